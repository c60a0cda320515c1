use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq)]
pub enum DomainError {
    InvalidPort {
        port: u16,
    },
    InvalidProtocol {
        protocol: String,
    },
    InvalidTrafficLimitGb {
        traffic_limit_gb: f64,
    },
    InvalidExpiryDays {
        expiry_days: i64,
    },
    MissingInbound {
        inbound_id: i64,
    },
    MissingClient {
        client_id: String,
    },
    TagConflict {
        tag: String,
    },
}

impl DomainError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPort { .. }
            | Self::InvalidProtocol { .. }
            | Self::InvalidTrafficLimitGb { .. }
            | Self::InvalidExpiryDays { .. } => "invalid_request",
            Self::MissingInbound { .. } | Self::MissingClient { .. } => "not_found",
            Self::TagConflict { .. } => "conflict",
        }
    }
}

impl std::fmt::Display for DomainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPort { port } => write!(f, "invalid port: {port}"),
            Self::InvalidProtocol { protocol } => write!(f, "invalid protocol: {protocol}"),
            Self::InvalidTrafficLimitGb { traffic_limit_gb } => {
                write!(f, "invalid traffic_limit_gb: {traffic_limit_gb}")
            }
            Self::InvalidExpiryDays { expiry_days } => {
                write!(f, "invalid expiry_days: {expiry_days}")
            }
            Self::MissingInbound { inbound_id } => write!(f, "inbound not found: {inbound_id}"),
            Self::MissingClient { client_id } => write!(f, "client not found: {client_id}"),
            Self::TagConflict { tag } => write!(f, "tag already exists: {tag}"),
        }
    }
}

impl std::error::Error for DomainError {}

pub fn validate_port(port: u16) -> Result<(), DomainError> {
    if port == 0 {
        return Err(DomainError::InvalidPort { port });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vless,
    Vmess,
    Trojan,
    Shadowsocks,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vless => "vless",
            Self::Vmess => "vmess",
            Self::Trojan => "trojan",
            Self::Shadowsocks => "shadowsocks",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        match raw {
            "vless" => Ok(Self::Vless),
            "vmess" => Ok(Self::Vmess),
            "trojan" => Ok(Self::Trojan),
            "shadowsocks" => Ok(Self::Shadowsocks),
            other => Err(DomainError::InvalidProtocol {
                protocol: other.to_string(),
            }),
        }
    }

    /// Shadowsocks inbounds carry one shared method+password instead of a
    /// per-client credential list.
    pub fn has_client_list(self) -> bool {
        !matches!(self, Self::Shadowsocks)
    }
}

/// One listening endpoint of the external engine.
///
/// `settings`, `stream_settings` and `sniffing` are stored as JSON blobs and
/// only validated when the engine document is synthesized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Inbound {
    pub id: i64,
    pub tag: String,
    pub protocol: Protocol,
    pub listen: String,
    pub port: u16,
    pub settings: serde_json::Value,
    pub stream_settings: serde_json::Value,
    pub sniffing: serde_json::Value,
    pub enabled: bool,
    pub remark: String,
}

/// A credential scoped to exactly one inbound.
///
/// `id` doubles as the subscription token, so it must come from a secure
/// random source. `credential` is a UUID for vless/vmess and is used verbatim
/// as the trojan password.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Client {
    pub id: String,
    pub inbound_id: i64,
    pub name: String,
    pub credential: String,
    pub flow: String,
    pub enabled: bool,
    /// Unix millis; 0 = never expires.
    pub expiry_time: i64,
    /// Bytes; 0 = unlimited.
    pub traffic_limit: u64,
    pub upload: u64,
    pub download: u64,
    pub ip_limit: u32,
}

impl Client {
    pub fn total_usage(&self) -> u64 {
        self.upload.saturating_add(self.download)
    }

    /// Strict `>`: a client is still valid at the exact expiry instant.
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expiry_time > 0 && now_ms > self.expiry_time
    }

    /// `>=`: hitting the limit exactly counts as over quota.
    pub fn is_over_quota(&self) -> bool {
        self.traffic_limit > 0 && self.total_usage() >= self.traffic_limit
    }
}
