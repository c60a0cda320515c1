use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::domain::Protocol;

/// Transport framing carried under the security layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Ws,
    Grpc,
    H2,
    Httpupgrade,
    Xhttp,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Ws => "ws",
            Self::Grpc => "grpc",
            Self::H2 => "h2",
            Self::Httpupgrade => "httpupgrade",
            Self::Xhttp => "xhttp",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    None,
    Tls,
    Reality,
}

impl Security {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Tls => "tls",
            Self::Reality => "reality",
        }
    }
}

/// Typed form of the per-inbound `stream_settings` blob.
///
/// Field names serialize to the engine's camelCase keys; the blob is stored
/// as raw JSON and parsed back through this type when the engine document is
/// synthesized, so malformed operator edits surface there.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    pub network: Network,
    pub security: Security,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_settings: Option<TcpSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_settings: Option<WsSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grpc_settings: Option<GrpcSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_settings: Option<HttpSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub httpupgrade_settings: Option<HttpUpgradeSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xhttp_settings: Option<XhttpSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_settings: Option<TlsSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reality_settings: Option<RealitySettings>,
}

impl StreamSettings {
    pub fn plain_tcp() -> Self {
        Self {
            network: Network::Tcp,
            security: Security::None,
            tcp_settings: Some(TcpSettings {
                header: TcpHeader {
                    header_type: "none".to_string(),
                    request: None,
                },
            }),
            ws_settings: None,
            grpc_settings: None,
            http_settings: None,
            httpupgrade_settings: None,
            xhttp_settings: None,
            tls_settings: None,
            reality_settings: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TcpSettings {
    pub header: TcpHeader,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TcpHeader {
    #[serde(rename = "type")]
    pub header_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<TcpHttpRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TcpHttpRequest {
    pub path: Vec<String>,
    pub headers: TcpHttpRequestHeaders,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TcpHttpRequestHeaders {
    #[serde(rename = "Host")]
    pub host: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WsSettings {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<WsHeaders>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WsHeaders {
    #[serde(rename = "Host")]
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GrpcSettings {
    pub service_name: String,
    pub multi_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpSettings {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpUpgradeSettings {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct XhttpSettings {
    pub path: String,
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    pub server_name: String,
    pub alpn: Vec<String>,
    pub fingerprint: String,
    pub allow_insecure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificates: Option<Vec<TlsCertificate>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TlsCertificate {
    pub certificate_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RealitySettings {
    pub show: bool,
    pub dest: String,
    pub xver: u32,
    pub server_names: Vec<String>,
    pub private_key: String,
    pub short_ids: Vec<String>,
    pub public_key: String,
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spider_x: Option<String>,
}

/// Typed form of the per-inbound `sniffing` blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SniffingSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(rename = "destOverride", default)]
    pub dest_override: Vec<String>,
    #[serde(rename = "routeOnly", default, skip_serializing_if = "Option::is_none")]
    pub route_only: Option<bool>,
}

fn default_true() -> bool {
    true
}

impl Default for SniffingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dest_override: vec!["http".to_string(), "tls".to_string(), "quic".to_string()],
            route_only: None,
        }
    }
}

/// Typed forms of the per-inbound `settings` blob. The `clients` arrays are
/// stored empty; synthesis injects the live client list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VlessSettings {
    #[serde(default)]
    pub clients: Vec<serde_json::Value>,
    pub decryption: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallbacks: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmessSettings {
    #[serde(default)]
    pub clients: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrojanSettings {
    #[serde(default)]
    pub clients: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallbacks: Option<Vec<TrojanFallback>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrojanFallback {
    pub addr: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShadowsocksSettings {
    pub method: String,
    pub password: String,
    pub network: String,
}

pub fn generate_tag_suffix<R: RngCore + CryptoRng>(rng: &mut R) -> String {
    let mut bytes = [0u8; 3];
    rng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn new_inbound_tag<R: RngCore + CryptoRng>(
    protocol: Protocol,
    port: u16,
    rng: &mut R,
) -> String {
    format!("{}-{}-{}", protocol.as_str(), port, generate_tag_suffix(rng))
}

pub fn generate_short_id<R: RngCore + CryptoRng>(rng: &mut R) -> String {
    let mut bytes = [0u8; 4];
    rng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn inbound_tag_has_protocol_port_and_hex_suffix() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let tag = new_inbound_tag(Protocol::Vless, 443, &mut rng);
        let parts: Vec<&str> = tag.split('-').collect();
        assert_eq!(parts[0], "vless");
        assert_eq!(parts[1], "443");
        assert_eq!(parts[2].len(), 6);
        assert!(parts[2].bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn short_id_is_eight_hex_chars() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(2);
        let sid = generate_short_id(&mut rng);
        assert_eq!(sid.len(), 8);
        assert!(sid.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn stream_settings_serialize_to_engine_key_names() {
        let stream = StreamSettings {
            network: Network::Ws,
            security: Security::Tls,
            tcp_settings: None,
            ws_settings: Some(WsSettings {
                path: "/ws".to_string(),
                headers: Some(WsHeaders {
                    host: "cdn.example.com".to_string(),
                }),
            }),
            grpc_settings: None,
            http_settings: None,
            httpupgrade_settings: None,
            xhttp_settings: None,
            tls_settings: Some(TlsSettings {
                server_name: "example.com".to_string(),
                alpn: vec!["h2".to_string(), "http/1.1".to_string()],
                fingerprint: "chrome".to_string(),
                allow_insecure: false,
                certificates: None,
            }),
            reality_settings: None,
        };

        let v = serde_json::to_value(&stream).unwrap();
        assert_eq!(v["network"], "ws");
        assert_eq!(v["security"], "tls");
        assert_eq!(v["wsSettings"]["path"], "/ws");
        assert_eq!(v["wsSettings"]["headers"]["Host"], "cdn.example.com");
        assert_eq!(v["tlsSettings"]["serverName"], "example.com");
        assert!(v.get("tcpSettings").is_none());
        assert!(v.get("realitySettings").is_none());
    }

    #[test]
    fn stream_settings_roundtrip_through_value() {
        let stream = StreamSettings::plain_tcp();
        let v = serde_json::to_value(&stream).unwrap();
        let back: StreamSettings = serde_json::from_value(v).unwrap();
        assert_eq!(back, stream);
    }

    #[test]
    fn sniffing_empty_object_falls_back_to_permissive_enabled() {
        let parsed: SniffingSettings = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(parsed.enabled);
        assert!(parsed.dest_override.is_empty());

        let default = SniffingSettings::default();
        assert_eq!(default.dest_override, vec!["http", "tls", "quic"]);
    }

    #[test]
    fn reality_settings_serialize_spider_x_only_when_set() {
        let mut reality = RealitySettings {
            show: false,
            dest: "google.com:443".to_string(),
            xver: 0,
            server_names: vec!["google.com".to_string()],
            private_key: "priv".to_string(),
            short_ids: vec!["01234567".to_string()],
            public_key: "pub".to_string(),
            fingerprint: "chrome".to_string(),
            spider_x: None,
        };
        let v = serde_json::to_value(&reality).unwrap();
        assert!(v.get("spiderX").is_none());
        assert_eq!(v["serverNames"][0], "google.com");
        assert_eq!(v["shortIds"][0], "01234567");

        reality.spider_x = Some("/".to_string());
        let v = serde_json::to_value(&reality).unwrap();
        assert_eq!(v["spiderX"], "/");
    }
}
