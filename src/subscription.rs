use base64::Engine as _;

use crate::{
    domain::{Client, Inbound, Protocol},
    protocol::{Network, Security, ShadowsocksSettings, StreamSettings},
};

/// User-agent substrings of client apps that expect a base64 subscription
/// body with machine-readable headers instead of an HTML page.
pub const KNOWN_CLIENT_APPS: [&str; 12] = [
    "v2rayn",
    "hiddify",
    "nekobox",
    "nekoray",
    "clash",
    "surge",
    "shadowrocket",
    "streisand",
    "v2rayng",
    "sing-box",
    "stash",
    "quantumult",
];

pub fn is_known_client_app(user_agent: &str) -> bool {
    let ua = user_agent.to_ascii_lowercase();
    KNOWN_CLIENT_APPS.iter().any(|app| ua.contains(app))
}

/// `subscription-userinfo` header value consumed by client apps.
pub fn subscription_user_info(client: &Client) -> String {
    format!(
        "upload={}; download={}; total={}",
        client.upload, client.download, client.traffic_limit
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    InvalidStreamSettings { tag: String, reason: String },
    InvalidProtocolSettings { tag: String, reason: String },
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidStreamSettings { tag, reason } => {
                write!(f, "invalid stream_settings for inbound {tag}: {reason}")
            }
            Self::InvalidProtocolSettings { tag, reason } => {
                write!(f, "invalid settings for inbound {tag}: {reason}")
            }
        }
    }
}

impl std::error::Error for LinkError {}

/// Derives the shareable connection URI for one inbound+client pair. Pure;
/// the caller supplies the externally visible hostname.
pub fn render_link(inbound: &Inbound, client: &Client, host: &str) -> Result<String, LinkError> {
    let stream = parse_stream(inbound)?;
    let fragment = link_fragment(inbound, client);

    match inbound.protocol {
        Protocol::Vless => Ok(vless_link(inbound, client, host, &stream, &fragment)),
        Protocol::Vmess => Ok(vmess_link(inbound, client, host, &stream)),
        Protocol::Trojan => Ok(trojan_link(inbound, client, host, &stream, &fragment)),
        Protocol::Shadowsocks => ss_link(inbound, host, &fragment),
    }
}

fn parse_stream(inbound: &Inbound) -> Result<StreamSettings, LinkError> {
    if inbound.stream_settings.is_null()
        || inbound
            .stream_settings
            .as_object()
            .is_some_and(|o| o.is_empty())
    {
        return Ok(StreamSettings::plain_tcp());
    }
    serde_json::from_value(inbound.stream_settings.clone()).map_err(|e| {
        LinkError::InvalidStreamSettings {
            tag: inbound.tag.clone(),
            reason: e.to_string(),
        }
    })
}

fn link_fragment(inbound: &Inbound, client: &Client) -> String {
    if inbound.remark.is_empty() {
        percent_encode_rfc3986(&client.name)
    } else {
        percent_encode_rfc3986(&format!("{} | {}", inbound.remark, client.name))
    }
}

fn vless_link(
    inbound: &Inbound,
    client: &Client,
    host: &str,
    stream: &StreamSettings,
    fragment: &str,
) -> String {
    let mut params = vec![
        format!("type={}", stream.network.as_str()),
        format!("security={}", stream.security.as_str()),
    ];
    if !client.flow.is_empty() {
        params.push(format!("flow={}", client.flow));
    }
    push_security_params(&mut params, stream);
    push_transport_params(&mut params, stream);

    format!(
        "vless://{}@{}:{}?{}#{}",
        client.credential,
        host,
        inbound.port,
        params.join("&"),
        fragment
    )
}

fn vmess_link(inbound: &Inbound, client: &Client, host: &str, stream: &StreamSettings) -> String {
    let mut obj = serde_json::json!({
        "v": "2",
        "ps": client.name,
        "add": host,
        "port": inbound.port.to_string(),
        "id": client.credential,
        "aid": "0",
        "net": stream.network.as_str(),
        "type": "none",
        "host": "",
        "path": "",
        "tls": if stream.security == Security::None { "" } else { stream.security.as_str() },
    });

    match stream.network {
        Network::Ws => {
            if let Some(ws) = &stream.ws_settings {
                obj["path"] = ws.path.clone().into();
                if let Some(headers) = &ws.headers {
                    obj["host"] = headers.host.clone().into();
                }
            }
        }
        Network::Grpc => {
            if let Some(grpc) = &stream.grpc_settings {
                obj["path"] = grpc.service_name.clone().into();
            }
            obj["type"] = "gun".into();
        }
        Network::H2 => {
            if let Some(h2) = &stream.http_settings {
                obj["path"] = h2.path.clone().into();
                obj["host"] = h2.host.clone().unwrap_or_default().join(",").into();
            }
        }
        Network::Tcp => {
            if let Some(tcp) = &stream.tcp_settings
                && tcp.header.header_type == "http"
            {
                obj["type"] = "http".into();
                if let Some(request) = &tcp.header.request {
                    obj["path"] = request.path.join(",").into();
                    obj["host"] = request.headers.host.join(",").into();
                }
            }
        }
        Network::Httpupgrade | Network::Xhttp => {}
    }

    if stream.security == Security::Tls
        && let Some(tls) = &stream.tls_settings
    {
        obj["sni"] = tls.server_name.clone().into();
        obj["fp"] = tls.fingerprint.clone().into();
    }

    let encoded = base64::engine::general_purpose::STANDARD.encode(obj.to_string());
    format!("vmess://{encoded}")
}

fn trojan_link(
    inbound: &Inbound,
    client: &Client,
    host: &str,
    stream: &StreamSettings,
    fragment: &str,
) -> String {
    let mut params = vec![
        format!("type={}", stream.network.as_str()),
        format!("security={}", stream.security.as_str()),
    ];
    push_security_params(&mut params, stream);
    push_transport_params(&mut params, stream);

    format!(
        "trojan://{}@{}:{}?{}#{}",
        client.credential,
        host,
        inbound.port,
        params.join("&"),
        fragment
    )
}

fn ss_link(inbound: &Inbound, host: &str, fragment: &str) -> Result<String, LinkError> {
    let settings: ShadowsocksSettings = serde_json::from_value(inbound.settings.clone())
        .map_err(|e| LinkError::InvalidProtocolSettings {
            tag: inbound.tag.clone(),
            reason: e.to_string(),
        })?;

    let userinfo = base64::engine::general_purpose::STANDARD
        .encode(format!("{}:{}", settings.method, settings.password));
    Ok(format!(
        "ss://{}@{}:{}#{}",
        userinfo, host, inbound.port, fragment
    ))
}

fn push_security_params(params: &mut Vec<String>, stream: &StreamSettings) {
    match stream.security {
        Security::Reality => {
            let Some(reality) = &stream.reality_settings else {
                return;
            };
            params.push(format!("pbk={}", reality.public_key));
            if let Some(sid) = reality.short_ids.first() {
                params.push(format!("sid={sid}"));
            }
            if let Some(sni) = reality.server_names.first() {
                params.push(format!("sni={sni}"));
            }
            let fp = if reality.fingerprint.is_empty() {
                "chrome"
            } else {
                reality.fingerprint.as_str()
            };
            params.push(format!("fp={fp}"));
            if let Some(spx) = &reality.spider_x {
                params.push(format!("spx={}", percent_encode_rfc3986(spx)));
            }
        }
        Security::Tls => {
            let Some(tls) = &stream.tls_settings else {
                return;
            };
            if !tls.server_name.is_empty() {
                params.push(format!("sni={}", tls.server_name));
            }
            if !tls.fingerprint.is_empty() {
                params.push(format!("fp={}", tls.fingerprint));
            }
            if !tls.alpn.is_empty() {
                params.push(format!(
                    "alpn={}",
                    percent_encode_rfc3986(&tls.alpn.join(","))
                ));
            }
        }
        Security::None => {}
    }
}

fn push_transport_params(params: &mut Vec<String>, stream: &StreamSettings) {
    match stream.network {
        Network::Ws => {
            if let Some(ws) = &stream.ws_settings {
                if !ws.path.is_empty() {
                    params.push(format!("path={}", percent_encode_rfc3986(&ws.path)));
                }
                if let Some(headers) = &ws.headers {
                    params.push(format!("host={}", headers.host));
                }
            }
        }
        Network::Grpc => {
            if let Some(grpc) = &stream.grpc_settings {
                if !grpc.service_name.is_empty() {
                    params.push(format!("serviceName={}", grpc.service_name));
                }
                if grpc.multi_mode {
                    params.push("mode=multi".to_string());
                }
            }
        }
        Network::H2 => {
            if let Some(h2) = &stream.http_settings {
                if !h2.path.is_empty() {
                    params.push(format!("path={}", percent_encode_rfc3986(&h2.path)));
                }
                if let Some(host) = h2.host.as_ref().and_then(|h| h.first()) {
                    params.push(format!("host={host}"));
                }
            }
        }
        Network::Httpupgrade => {
            if let Some(hu) = &stream.httpupgrade_settings {
                if !hu.path.is_empty() {
                    params.push(format!("path={}", percent_encode_rfc3986(&hu.path)));
                }
                if let Some(host) = &hu.host {
                    params.push(format!("host={host}"));
                }
            }
        }
        Network::Tcp => {
            if let Some(tcp) = &stream.tcp_settings
                && tcp.header.header_type == "http"
            {
                params.push("headerType=http".to_string());
            }
        }
        Network::Xhttp => {}
    }
}

fn percent_encode_rfc3986(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.as_bytes() {
        let c = *b;
        let is_unreserved =
            matches!(c, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~');
        if is_unreserved {
            out.push(c as char);
        } else {
            out.push('%');
            out.push(hex_upper_nibble((c >> 4) & 0x0f));
            out.push(hex_upper_nibble(c & 0x0f));
        }
    }
    out
}

fn hex_upper_nibble(n: u8) -> char {
    match n {
        0..=9 => (b'0' + n) as char,
        10..=15 => (b'A' + (n - 10)) as char,
        _ => unreachable!("nibble must be <= 15"),
    }
}

pub fn encode_subscription_body(link: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(link)
}

#[cfg(test)]
mod tests {
    use base64::Engine as _;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn inbound(protocol: Protocol, port: u16, stream: serde_json::Value) -> Inbound {
        let settings = match protocol {
            Protocol::Shadowsocks => json!({
                "method": "chacha20-ietf-poly1305",
                "password": "shared-secret",
                "network": "tcp,udp"
            }),
            Protocol::Vless => json!({"clients": [], "decryption": "none"}),
            _ => json!({"clients": []}),
        };
        Inbound {
            id: 1,
            tag: format!("{}-{port}-abc123", protocol.as_str()),
            protocol,
            listen: String::new(),
            port,
            settings,
            stream_settings: stream,
            sniffing: json!({}),
            enabled: true,
            remark: String::new(),
        }
    }

    fn client(name: &str, flow: &str) -> Client {
        Client {
            id: "tok".to_string(),
            inbound_id: 1,
            name: name.to_string(),
            credential: "11111111-2222-4333-8444-555555555555".to_string(),
            flow: flow.to_string(),
            enabled: true,
            expiry_time: 0,
            traffic_limit: 0,
            upload: 0,
            download: 0,
            ip_limit: 0,
        }
    }

    #[test]
    fn vless_reality_link_carries_key_material_params() {
        let stream = json!({
            "network": "tcp",
            "security": "reality",
            "tcpSettings": {"header": {"type": "none"}},
            "realitySettings": {
                "show": false,
                "dest": "google.com:443",
                "xver": 0,
                "serverNames": ["google.com"],
                "privateKey": "priv",
                "shortIds": ["01234567"],
                "publicKey": "pubkey",
                "fingerprint": "chrome"
            }
        });
        let ib = inbound(Protocol::Vless, 443, stream);
        let c = client("alice", "xtls-rprx-vision");

        let link = render_link(&ib, &c, "vpn.example.com").unwrap();
        assert!(link.starts_with("vless://11111111-2222-4333-8444-555555555555@vpn.example.com:443?"));
        assert!(link.contains("type=tcp"));
        assert!(link.contains("security=reality"));
        assert!(link.contains("flow=xtls-rprx-vision"));
        assert!(link.contains("pbk=pubkey"));
        assert!(link.contains("sid=01234567"));
        assert!(link.contains("sni=google.com"));
        assert!(link.contains("fp=chrome"));
        assert!(link.ends_with("#alice"));
    }

    #[test]
    fn fragment_uses_remark_pipe_name_with_percent_encoding() {
        let mut ib = inbound(
            Protocol::Vless,
            443,
            json!({"network": "tcp", "security": "none"}),
        );
        ib.remark = "DE Berlin".to_string();
        let c = client("my user", "");

        let link = render_link(&ib, &c, "host").unwrap();
        assert!(link.ends_with("#DE%20Berlin%20%7C%20my%20user"));
        assert!(!link.contains('+'));
    }

    #[test]
    fn vmess_ws_tls_link_decodes_to_expected_fields() {
        let stream = json!({
            "network": "ws",
            "security": "tls",
            "wsSettings": {"path": "/ws", "headers": {"Host": "cdn.example.com"}},
            "tlsSettings": {
                "serverName": "cdn.example.com",
                "alpn": ["h2", "http/1.1"],
                "fingerprint": "chrome",
                "allowInsecure": false
            }
        });
        let ib = inbound(Protocol::Vmess, 8443, stream);
        let c = client("bob", "");

        let link = render_link(&ib, &c, "vpn.example.com").unwrap();
        let encoded = link.strip_prefix("vmess://").unwrap();
        let decoded: serde_json::Value = serde_json::from_slice(
            &base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .unwrap(),
        )
        .unwrap();

        assert_eq!(decoded["v"], "2");
        assert_eq!(decoded["ps"], "bob");
        assert_eq!(decoded["add"], "vpn.example.com");
        assert_eq!(decoded["port"], "8443");
        assert_eq!(decoded["aid"], "0");
        assert_eq!(decoded["net"], "ws");
        assert_eq!(decoded["path"], "/ws");
        assert_eq!(decoded["host"], "cdn.example.com");
        assert_eq!(decoded["tls"], "tls");
        assert_eq!(decoded["sni"], "cdn.example.com");
        assert_eq!(decoded["fp"], "chrome");
    }

    #[test]
    fn trojan_tls_link_uses_credential_as_password() {
        let stream = json!({
            "network": "tcp",
            "security": "tls",
            "tcpSettings": {"header": {"type": "none"}},
            "tlsSettings": {
                "serverName": "example.com",
                "alpn": ["h2"],
                "fingerprint": "firefox",
                "allowInsecure": false
            }
        });
        let ib = inbound(Protocol::Trojan, 8443, stream);
        let c = client("carol", "");

        let link = render_link(&ib, &c, "vpn.example.com").unwrap();
        assert!(link.starts_with("trojan://11111111-2222-4333-8444-555555555555@vpn.example.com:8443?"));
        assert!(link.contains("security=tls"));
        assert!(link.contains("sni=example.com"));
        assert!(link.contains("fp=firefox"));
        assert!(link.contains("alpn=h2"));
    }

    #[test]
    fn shadowsocks_userinfo_is_base64_method_colon_password() {
        let ib = inbound(
            Protocol::Shadowsocks,
            8388,
            json!({"network": "tcp", "security": "none"}),
        );
        let c = client("dave", "");

        let link = render_link(&ib, &c, "vpn.example.com").unwrap();
        let userinfo = link
            .strip_prefix("ss://")
            .unwrap()
            .split('@')
            .next()
            .unwrap();
        let decoded = String::from_utf8(
            base64::engine::general_purpose::STANDARD
                .decode(userinfo)
                .unwrap(),
        )
        .unwrap();
        assert_eq!(decoded, "chacha20-ietf-poly1305:shared-secret");
        assert!(link.ends_with("@vpn.example.com:8388#dave"));
    }

    #[test]
    fn grpc_transport_params_include_service_name_and_multi_mode() {
        let stream = json!({
            "network": "grpc",
            "security": "none",
            "grpcSettings": {"serviceName": "tunnel", "multiMode": true}
        });
        let ib = inbound(Protocol::Vless, 443, stream);
        let c = client("erin", "");

        let link = render_link(&ib, &c, "host").unwrap();
        assert!(link.contains("serviceName=tunnel"));
        assert!(link.contains("mode=multi"));
    }

    #[test]
    fn malformed_stream_settings_is_a_typed_error() {
        let mut ib = inbound(Protocol::Vless, 443, json!({"network": "nope", "security": "none"}));
        ib.stream_settings = json!({"network": "nope", "security": "none"});
        let err = render_link(&ib, &client("x", ""), "host").unwrap_err();
        assert!(matches!(err, LinkError::InvalidStreamSettings { .. }));
    }

    #[test]
    fn known_client_apps_are_detected_case_insensitively() {
        assert!(is_known_client_app("v2rayNG/1.8.19"));
        assert!(is_known_client_app("Hiddify/2.0 CFNetwork"));
        assert!(is_known_client_app("clash-verge/1.5"));
        assert!(!is_known_client_app("Mozilla/5.0 (X11; Linux x86_64)"));
        assert!(!is_known_client_app(""));
    }

    #[test]
    fn subscription_user_info_reports_counters_and_total() {
        let mut c = client("alice", "");
        c.upload = 100;
        c.download = 250;
        c.traffic_limit = 1024;
        assert_eq!(
            subscription_user_info(&c),
            "upload=100; download=250; total=1024"
        );
    }
}
