use std::{
    fs,
    io::{self, Write as _},
    path::Path,
};

use serde::Serialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::{
    domain::{Client, Inbound, Protocol},
    protocol::{
        ShadowsocksSettings, SniffingSettings, StreamSettings, TrojanSettings, VlessSettings,
        VmessSettings,
    },
    store::{SqliteStore, StoreError},
};

pub const MANAGEMENT_INBOUND_TAG: &str = "api-in";
pub const MANAGEMENT_OUTBOUND_TAG: &str = "api";
pub const DIRECT_OUTBOUND_TAG: &str = "direct";
pub const BLOCKED_OUTBOUND_TAG: &str = "blocked";

const FALLBACK_DNS_SERVERS: [&str; 2] = ["1.1.1.1", "8.8.8.8"];

/// Engine-facing slice of the settings table, loaded fresh on every
/// synthesis so reads always reflect the latest writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub api_port: u16,
    pub log_level: String,
    pub block_bittorrent: bool,
    pub custom_routing_rules: String,
    pub custom_dns: String,
    pub custom_outbounds: String,
}

impl EngineSettings {
    pub fn load(store: &SqliteStore) -> Result<Self, StoreError> {
        Ok(Self {
            api_port: store
                .get_setting("xray_api_port", "10085")?
                .parse()
                .unwrap_or(10085),
            log_level: store.get_setting("xray_log_level", "warning")?,
            block_bittorrent: store.get_setting("block_bittorrent", "true")? == "true",
            custom_routing_rules: store.get_setting("custom_routing_rules", "")?,
            custom_dns: store.get_setting("custom_dns", "")?,
            custom_outbounds: store.get_setting("custom_outbounds", "")?,
        })
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            api_port: 10085,
            log_level: "warning".to_string(),
            block_bittorrent: true,
            custom_routing_rules: String::new(),
            custom_dns: String::new(),
            custom_outbounds: String::new(),
        }
    }
}

#[derive(Debug)]
pub enum SynthesisError {
    InvalidStreamSettings { tag: String, reason: String },
    InvalidSniffing { tag: String, reason: String },
    InvalidProtocolSettings { tag: String, reason: String },
}

impl std::fmt::Display for SynthesisError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidStreamSettings { tag, reason } => {
                write!(f, "invalid stream_settings for inbound {tag}: {reason}")
            }
            Self::InvalidSniffing { tag, reason } => {
                write!(f, "invalid sniffing for inbound {tag}: {reason}")
            }
            Self::InvalidProtocolSettings { tag, reason } => {
                write!(f, "invalid settings for inbound {tag}: {reason}")
            }
        }
    }
}

impl std::error::Error for SynthesisError {}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConfigDocument {
    pub log: LogConfig,
    pub api: ApiConfig,
    pub stats: Value,
    pub policy: PolicyConfig,
    pub inbounds: Vec<InboundObject>,
    pub outbounds: Vec<Value>,
    pub routing: RoutingConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<Value>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LogConfig {
    pub loglevel: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ApiConfig {
    pub tag: String,
    pub services: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PolicyConfig {
    pub system: SystemPolicy,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SystemPolicy {
    pub stats_inbound_uplink: bool,
    pub stats_inbound_downlink: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InboundObject {
    pub tag: String,
    pub listen: String,
    pub port: u16,
    pub protocol: String,
    pub settings: Value,
    #[serde(rename = "streamSettings", skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sniffing: Option<Value>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RoutingConfig {
    pub rules: Vec<Value>,
}

/// Maps the stored model to the engine's configuration document.
///
/// Pure: writing the result to disk is the caller's job (`write_config_file`).
/// Only enabled inbounds are considered, and only their enabled clients are
/// embedded. Stored JSON blobs are validated here by round-tripping through
/// the typed models in `protocol`.
pub fn synthesize(
    settings: &EngineSettings,
    inbounds: &[Inbound],
    clients: &[Client],
) -> Result<ConfigDocument, SynthesisError> {
    let mut doc_inbounds = vec![management_inbound(settings.api_port)];
    for inbound in inbounds.iter().filter(|i| i.enabled) {
        let embedded: Vec<&Client> = clients
            .iter()
            .filter(|c| c.inbound_id == inbound.id && c.enabled)
            .collect();
        doc_inbounds.push(build_inbound_object(inbound, &embedded)?);
    }

    let mut outbounds = vec![
        json!({"tag": DIRECT_OUTBOUND_TAG, "protocol": "freedom"}),
        json!({"tag": BLOCKED_OUTBOUND_TAG, "protocol": "blackhole"}),
    ];
    merge_custom_outbounds(&mut outbounds, &settings.custom_outbounds);

    let mut rules = vec![json!({
        "type": "field",
        "inboundTag": [MANAGEMENT_INBOUND_TAG],
        "outboundTag": MANAGEMENT_OUTBOUND_TAG,
    })];
    if settings.block_bittorrent {
        rules.push(json!({
            "type": "field",
            "protocol": ["bittorrent"],
            "outboundTag": BLOCKED_OUTBOUND_TAG,
        }));
    }
    merge_custom_rules(&mut rules, &settings.custom_routing_rules);

    Ok(ConfigDocument {
        log: LogConfig {
            loglevel: settings.log_level.clone(),
        },
        api: ApiConfig {
            tag: MANAGEMENT_OUTBOUND_TAG.to_string(),
            services: vec!["StatsService".to_string()],
        },
        stats: json!({}),
        policy: PolicyConfig {
            system: SystemPolicy {
                stats_inbound_uplink: true,
                stats_inbound_downlink: true,
            },
        },
        inbounds: doc_inbounds,
        outbounds,
        routing: RoutingConfig { rules },
        dns: parse_custom_dns(&settings.custom_dns),
    })
}

/// Loads everything the document needs from the store and synthesizes.
pub fn synthesize_from_store(store: &SqliteStore) -> Result<ConfigDocument, SynthesisFromStoreError> {
    let settings = EngineSettings::load(store)?;
    let inbounds = store.list_enabled_inbounds()?;
    let clients = store.list_enabled_clients()?;
    Ok(synthesize(&settings, &inbounds, &clients)?)
}

#[derive(Debug)]
pub enum SynthesisFromStoreError {
    Store(StoreError),
    Synthesis(SynthesisError),
}

impl std::fmt::Display for SynthesisFromStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(e) => write!(f, "{e}"),
            Self::Synthesis(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SynthesisFromStoreError {}

impl From<StoreError> for SynthesisFromStoreError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<SynthesisError> for SynthesisFromStoreError {
    fn from(value: SynthesisError) -> Self {
        Self::Synthesis(value)
    }
}

fn management_inbound(api_port: u16) -> InboundObject {
    InboundObject {
        tag: MANAGEMENT_INBOUND_TAG.to_string(),
        listen: "127.0.0.1".to_string(),
        port: api_port,
        protocol: "dokodemo-door".to_string(),
        settings: json!({"address": "127.0.0.1"}),
        stream_settings: None,
        sniffing: None,
    }
}

fn is_empty_blob(value: &Value) -> bool {
    value.is_null() || value.as_object().is_some_and(|o| o.is_empty())
}

fn build_inbound_object(
    inbound: &Inbound,
    clients: &[&Client],
) -> Result<InboundObject, SynthesisError> {
    let stream = if is_empty_blob(&inbound.stream_settings) {
        StreamSettings::plain_tcp()
    } else {
        serde_json::from_value::<StreamSettings>(inbound.stream_settings.clone()).map_err(|e| {
            SynthesisError::InvalidStreamSettings {
                tag: inbound.tag.clone(),
                reason: e.to_string(),
            }
        })?
    };

    let sniffing = if is_empty_blob(&inbound.sniffing) {
        SniffingSettings::default()
    } else {
        serde_json::from_value::<SniffingSettings>(inbound.sniffing.clone()).map_err(|e| {
            SynthesisError::InvalidSniffing {
                tag: inbound.tag.clone(),
                reason: e.to_string(),
            }
        })?
    };

    let settings = project_protocol_settings(inbound, clients)?;

    Ok(InboundObject {
        tag: inbound.tag.clone(),
        listen: inbound.listen.clone(),
        port: inbound.port,
        protocol: inbound.protocol.as_str().to_string(),
        settings,
        stream_settings: Some(
            serde_json::to_value(&stream).expect("stream settings serialize"),
        ),
        sniffing: Some(serde_json::to_value(&sniffing).expect("sniffing serialize")),
    })
}

/// Fixed per-protocol projection of the embedded client list.
fn project_protocol_settings(
    inbound: &Inbound,
    clients: &[&Client],
) -> Result<Value, SynthesisError> {
    let invalid = |e: serde_json::Error| SynthesisError::InvalidProtocolSettings {
        tag: inbound.tag.clone(),
        reason: e.to_string(),
    };

    match inbound.protocol {
        Protocol::Vless => {
            let mut settings: VlessSettings = if is_empty_blob(&inbound.settings) {
                VlessSettings {
                    clients: Vec::new(),
                    decryption: "none".to_string(),
                    flow: None,
                    fallbacks: None,
                }
            } else {
                serde_json::from_value(inbound.settings.clone()).map_err(invalid)?
            };
            settings.clients = clients
                .iter()
                .map(|c| json!({"id": c.credential, "email": c.name, "flow": c.flow}))
                .collect();
            Ok(serde_json::to_value(settings).expect("vless settings serialize"))
        }
        Protocol::Vmess => {
            let mut settings: VmessSettings = if is_empty_blob(&inbound.settings) {
                VmessSettings {
                    clients: Vec::new(),
                }
            } else {
                serde_json::from_value(inbound.settings.clone()).map_err(invalid)?
            };
            settings.clients = clients
                .iter()
                .map(|c| json!({"id": c.credential, "email": c.name, "alterId": 0}))
                .collect();
            Ok(serde_json::to_value(settings).expect("vmess settings serialize"))
        }
        Protocol::Trojan => {
            let mut settings: TrojanSettings = if is_empty_blob(&inbound.settings) {
                TrojanSettings {
                    clients: Vec::new(),
                    fallbacks: None,
                }
            } else {
                serde_json::from_value(inbound.settings.clone()).map_err(invalid)?
            };
            settings.clients = clients
                .iter()
                .map(|c| json!({"password": c.credential, "email": c.name}))
                .collect();
            Ok(serde_json::to_value(settings).expect("trojan settings serialize"))
        }
        Protocol::Shadowsocks => {
            // No per-client list: one shared method+password on the inbound.
            let settings: ShadowsocksSettings =
                serde_json::from_value(inbound.settings.clone()).map_err(invalid)?;
            Ok(serde_json::to_value(settings).expect("ss settings serialize"))
        }
    }
}

/// Operator-supplied rules are merged leniently: anything unparsable is
/// skipped, never fatal.
fn merge_custom_rules(rules: &mut Vec<Value>, raw: &str) {
    if raw.is_empty() {
        return;
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(extra)) => rules.extend(extra),
        Ok(_) | Err(_) => {
            debug!("custom_routing_rules is not a JSON array; skipping");
        }
    }
}

/// Extra outbounds merge by tag; entries colliding with a baseline tag are
/// dropped.
fn merge_custom_outbounds(outbounds: &mut Vec<Value>, raw: &str) {
    if raw.is_empty() {
        return;
    }
    let Ok(Value::Array(extra)) = serde_json::from_str::<Value>(raw) else {
        debug!("custom_outbounds is not a JSON array; skipping");
        return;
    };
    for outbound in extra {
        let tag = outbound.get("tag").and_then(|t| t.as_str());
        let collides = tag.is_none_or(|t| {
            outbounds
                .iter()
                .any(|o| o.get("tag").and_then(|x| x.as_str()) == Some(t))
        });
        if !collides {
            outbounds.push(outbound);
        }
    }
}

/// Unset -> no dns section; unparsable -> fixed public resolvers.
fn parse_custom_dns(raw: &str) -> Option<Value> {
    if raw.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value) if value.is_object() => Some(value),
        _ => Some(json!({"servers": FALLBACK_DNS_SERVERS})),
    }
}

/// Fully replaces the document on disk; partial updates are unsupported.
pub fn write_config_file(path: &Path, doc: &ConfigDocument) -> io::Result<()> {
    let bytes = serde_json::to_vec_pretty(doc)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_atomic(path, &bytes)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory")
    })?;
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp_path = dir.join(format!("{}.tmp", file_name.to_string_lossy()));
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.write_all(b"\n")?;
        let _ = file.sync_all();
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn inbound(id: i64, protocol: Protocol, port: u16, enabled: bool) -> Inbound {
        let settings = match protocol {
            Protocol::Vless => json!({"clients": [], "decryption": "none"}),
            Protocol::Vmess | Protocol::Trojan => json!({"clients": []}),
            Protocol::Shadowsocks => json!({
                "method": "chacha20-ietf-poly1305",
                "password": "shared-secret",
                "network": "tcp,udp"
            }),
        };
        Inbound {
            id,
            tag: format!("{}-{port}-{id:06x}", protocol.as_str()),
            protocol,
            listen: String::new(),
            port,
            settings,
            stream_settings: json!({"network": "tcp", "security": "none"}),
            sniffing: json!({}),
            enabled,
            remark: String::new(),
        }
    }

    fn client(id: &str, inbound_id: i64, enabled: bool) -> Client {
        Client {
            id: id.to_string(),
            inbound_id,
            name: format!("user-{id}"),
            credential: format!("00000000-0000-4000-8000-{id:0>12}"),
            flow: String::new(),
            enabled,
            expiry_time: 0,
            traffic_limit: 0,
            upload: 0,
            download: 0,
            ip_limit: 0,
        }
    }

    fn embedded_emails(doc: &ConfigDocument, tag: &str) -> Vec<String> {
        let inbound = doc.inbounds.iter().find(|i| i.tag == tag).unwrap();
        inbound.settings["clients"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["email"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn only_enabled_inbounds_and_clients_are_emitted() {
        let settings = EngineSettings::default();
        let inbounds = vec![
            inbound(1, Protocol::Vless, 443, true),
            inbound(2, Protocol::Vmess, 8080, false),
        ];
        let clients = vec![
            client("a", 1, true),
            client("b", 1, false),
            client("c", 2, true),
        ];

        let doc = synthesize(&settings, &inbounds, &clients).unwrap();

        // Management inbound plus the single enabled one.
        assert_eq!(doc.inbounds.len(), 2);
        assert_eq!(doc.inbounds[0].tag, MANAGEMENT_INBOUND_TAG);
        let tag = inbounds[0].tag.clone();
        assert_eq!(embedded_emails(&doc, &tag), vec!["user-a".to_string()]);
    }

    #[test]
    fn synthesis_is_deterministic_for_identical_inputs() {
        let settings = EngineSettings {
            custom_routing_rules: r#"[{"type":"field","domain":["example.com"],"outboundTag":"direct"}]"#.to_string(),
            custom_dns: r#"{"servers":["9.9.9.9"]}"#.to_string(),
            ..EngineSettings::default()
        };
        let inbounds = vec![
            inbound(1, Protocol::Vless, 443, true),
            inbound(2, Protocol::Shadowsocks, 8388, true),
        ];
        let clients = vec![client("a", 1, true), client("b", 1, true)];

        let first = synthesize(&settings, &inbounds, &clients).unwrap();
        let second = synthesize(&settings, &inbounds, &clients).unwrap();
        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
    }

    #[test]
    fn management_inbound_is_loopback_and_routed_first() {
        let settings = EngineSettings {
            api_port: 12345,
            ..EngineSettings::default()
        };
        let doc = synthesize(&settings, &[], &[]).unwrap();

        let api_in = &doc.inbounds[0];
        assert_eq!(api_in.tag, MANAGEMENT_INBOUND_TAG);
        assert_eq!(api_in.listen, "127.0.0.1");
        assert_eq!(api_in.port, 12345);
        assert_eq!(api_in.protocol, "dokodemo-door");

        let first_rule = &doc.routing.rules[0];
        assert_eq!(first_rule["inboundTag"][0], MANAGEMENT_INBOUND_TAG);
        assert_eq!(first_rule["outboundTag"], MANAGEMENT_OUTBOUND_TAG);

        assert_eq!(doc.outbounds[0]["tag"], DIRECT_OUTBOUND_TAG);
        assert_eq!(doc.outbounds[1]["tag"], BLOCKED_OUTBOUND_TAG);
    }

    #[test]
    fn bittorrent_block_rule_follows_the_toggle() {
        let on = synthesize(&EngineSettings::default(), &[], &[]).unwrap();
        assert!(
            on.routing
                .rules
                .iter()
                .any(|r| r["protocol"][0] == "bittorrent")
        );

        let off_settings = EngineSettings {
            block_bittorrent: false,
            ..EngineSettings::default()
        };
        let off = synthesize(&off_settings, &[], &[]).unwrap();
        assert!(
            !off.routing
                .rules
                .iter()
                .any(|r| r["protocol"][0] == "bittorrent")
        );
    }

    #[test]
    fn unparsable_custom_rules_are_skipped_silently() {
        let settings = EngineSettings {
            custom_routing_rules: "{not json".to_string(),
            ..EngineSettings::default()
        };
        let doc = synthesize(&settings, &[], &[]).unwrap();
        // Only the management rule and the bittorrent default remain.
        assert_eq!(doc.routing.rules.len(), 2);
    }

    #[test]
    fn custom_dns_falls_back_to_public_resolvers_on_parse_failure() {
        let settings = EngineSettings {
            custom_dns: "{broken".to_string(),
            ..EngineSettings::default()
        };
        let doc = synthesize(&settings, &[], &[]).unwrap();
        assert_eq!(
            doc.dns.unwrap()["servers"],
            json!(["1.1.1.1", "8.8.8.8"])
        );

        let unset = synthesize(&EngineSettings::default(), &[], &[]).unwrap();
        assert!(unset.dns.is_none());
    }

    #[test]
    fn custom_outbounds_skip_baseline_tag_collisions() {
        let settings = EngineSettings {
            custom_outbounds: r#"[
                {"tag": "direct", "protocol": "socks"},
                {"tag": "warp", "protocol": "socks", "settings": {"servers": [{"address": "127.0.0.1", "port": 40000}]}},
                {"protocol": "freedom"}
            ]"#
            .to_string(),
            ..EngineSettings::default()
        };
        let doc = synthesize(&settings, &[], &[]).unwrap();

        let tags: Vec<&str> = doc
            .outbounds
            .iter()
            .filter_map(|o| o.get("tag").and_then(|t| t.as_str()))
            .collect();
        assert_eq!(tags, vec!["direct", "blocked", "warp"]);
        assert_eq!(doc.outbounds[0]["protocol"], "freedom");
        assert_eq!(doc.outbounds.len(), 3);
    }

    #[test]
    fn per_protocol_client_projection_shapes() {
        let settings = EngineSettings::default();
        let inbounds = vec![
            inbound(1, Protocol::Vless, 443, true),
            inbound(2, Protocol::Vmess, 8080, true),
            inbound(3, Protocol::Trojan, 8443, true),
            inbound(4, Protocol::Shadowsocks, 8388, true),
        ];
        let clients = vec![
            client("a", 1, true),
            client("b", 2, true),
            client("c", 3, true),
            client("d", 4, true),
        ];
        let doc = synthesize(&settings, &inbounds, &clients).unwrap();

        let vless = &doc.inbounds[1].settings["clients"][0];
        assert!(vless.get("id").is_some());
        assert!(vless.get("flow").is_some());
        assert!(vless.get("password").is_none());

        let vmess = &doc.inbounds[2].settings["clients"][0];
        assert_eq!(vmess["alterId"], 0);
        assert!(vmess.get("flow").is_none());

        let trojan = &doc.inbounds[3].settings["clients"][0];
        assert!(trojan.get("password").is_some());
        assert!(trojan.get("id").is_none());

        // Shadowsocks carries no client list at all.
        let ss = &doc.inbounds[4].settings;
        assert!(ss.get("clients").is_none());
        assert_eq!(ss["method"], "chacha20-ietf-poly1305");
    }

    #[test]
    fn malformed_stream_settings_blob_is_a_typed_error() {
        let settings = EngineSettings::default();
        let mut bad = inbound(1, Protocol::Vless, 443, true);
        bad.stream_settings = json!({"network": "carrier-pigeon", "security": "none"});

        let err = synthesize(&settings, &[bad], &[]).unwrap_err();
        assert!(matches!(
            err,
            SynthesisError::InvalidStreamSettings { .. }
        ));
    }

    #[test]
    fn vless_client_has_no_expiry_or_quota_fields() {
        let settings = EngineSettings::default();
        let inbounds = vec![inbound(1, Protocol::Vless, 443, true)];
        let mut c = client("a", 1, true);
        c.flow = "xtls-rprx-vision".to_string();
        c.expiry_time = 1_700_000_000_000;
        c.traffic_limit = 1 << 30;

        let doc = synthesize(&settings, &inbounds, &[c]).unwrap();
        let embedded = &doc.inbounds[1].settings["clients"][0];
        assert_eq!(embedded["flow"], "xtls-rprx-vision");
        assert!(embedded.get("expiry_time").is_none());
        assert!(embedded.get("traffic_limit").is_none());
        assert!(embedded.get("expiry").is_none());
        assert!(embedded.get("quota").is_none());
    }

    #[test]
    fn write_config_file_replaces_prior_document() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("engine_config.json");

        let doc = synthesize(&EngineSettings::default(), &[], &[]).unwrap();
        write_config_file(&path, &doc).unwrap();

        let settings = EngineSettings {
            api_port: 20000,
            ..EngineSettings::default()
        };
        let doc2 = synthesize(&settings, &[], &[]).unwrap();
        write_config_file(&path, &doc2).unwrap();

        let on_disk: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk["inbounds"][0]["port"], 20000);
    }
}
