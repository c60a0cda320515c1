use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Extension, FromRequest, Path, Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::{
    admin_token::{AdminTokenHash, verify_admin_token},
    config::Config,
    domain::{Client, DomainError, Inbound, Protocol, validate_port},
    engine::{EngineCommandError, EngineSupervisor},
    notify::Notifier,
    protocol::{
        GrpcSettings, HttpSettings, HttpUpgradeSettings, Network, RealitySettings, Security,
        ShadowsocksSettings, SniffingSettings, StreamSettings, TcpHeader, TcpHttpRequest,
        TcpHttpRequestHeaders, TcpSettings, TlsCertificate, TlsSettings, TrojanFallback,
        TrojanSettings, VlessSettings, VmessSettings, WsSettings, XhttpSettings, generate_short_id,
    },
    store::{ClientUpdate, NewClient, NewInbound, InboundUpdate, SqliteStore, StoreError},
    subscription::{
        encode_subscription_body, is_known_client_app, render_link, subscription_user_info,
    },
};


#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Mutex<SqliteStore>>,
    pub engine: EngineSupervisor,
    pub notifier: Notifier,
}

#[derive(Debug)]
pub struct ApiError {
    code: &'static str,
    message: String,
    status: StatusCode,
}

impl ApiError {
    fn new(code: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request", StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("conflict", StatusCode::CONFLICT, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new("unauthorized", StatusCode::UNAUTHORIZED, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal", StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<StoreError> for ApiError {
    fn from(value: StoreError) -> Self {
        match &value {
            StoreError::Domain(domain) => match domain.code() {
                "not_found" => ApiError::not_found(domain.to_string()),
                "conflict" => ApiError::conflict(domain.to_string()),
                _ => ApiError::invalid_request(domain.to_string()),
            },
            StoreError::Io(_) | StoreError::Sqlite(_) | StoreError::SerdeJson(_) => {
                ApiError::internal(value.to_string())
            }
        }
    }
}

impl From<DomainError> for ApiError {
    fn from(value: DomainError) -> Self {
        ApiError::from(StoreError::Domain(value))
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

/// Json extractor that reports body rejections as typed API errors.
pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    axum::Json<T>: FromRequest<S>,
    <axum::Json<T> as FromRequest<S>>::Rejection: std::fmt::Display,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = axum::Json::<T>::from_request(req, state)
            .await
            .map_err(|e| ApiError::invalid_request(e.to_string()))?;
        Ok(Self(value))
    }
}

#[derive(Serialize)]
struct Items<T> {
    items: Vec<T>,
}

#[derive(Serialize)]
struct SuccessResponse {
    success: bool,
}

#[derive(Clone)]
struct AdminAuthState {
    admin_token_hash: Option<AdminTokenHash>,
}

pub fn build_router(
    config: Config,
    store: Arc<Mutex<SqliteStore>>,
    engine: EngineSupervisor,
    notifier: Notifier,
) -> Router {
    let auth_state = AdminAuthState {
        admin_token_hash: config.admin_token_hash(),
    };
    let app_state = AppState {
        config: Arc::new(config),
        store,
        engine,
        notifier,
    };

    let admin = Router::new()
        .route("/status", get(get_status))
        .route("/engine/start", post(engine_start))
        .route("/engine/stop", post(engine_stop))
        .route("/engine/restart", post(engine_restart))
        .route("/engine/config", get(engine_config))
        .route("/engine/version", get(engine_version))
        .route("/engine/reality-keys", post(engine_reality_keys))
        .route("/settings", get(get_settings).post(update_settings))
        .route("/inbounds", post(create_inbound).get(list_inbounds))
        .route(
            "/inbounds/:inbound_id",
            get(get_inbound)
                .put(update_inbound)
                .delete(delete_inbound),
        )
        .route("/inbounds/:inbound_id/toggle", put(toggle_inbound))
        .route("/inbounds/:inbound_id/clients", post(create_client))
        .route(
            "/clients/:client_id",
            put(update_client).delete(delete_client),
        )
        .route("/clients/:client_id/reset-traffic", post(reset_client_traffic))
        .route("/clients/:client_id/link", get(client_link))
        .route("/telegram/test", post(telegram_test))
        .route("/telegram/reset", post(telegram_reset))
        .layer(middleware::from_fn_with_state(auth_state, admin_auth));

    let api = Router::new()
        .route("/health", get(health))
        .merge(admin)
        .fallback(fallback_not_found);

    Router::new()
        .nest("/api", api)
        .route("/sub/:token", get(get_subscription))
        .fallback(fallback_not_found)
        .layer(Extension(app_state))
}

async fn admin_auth(
    State(auth): State<AdminAuthState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(token) = extract_bearer_token(req.headers()) else {
        return ApiError::unauthorized("missing or invalid authorization token").into_response();
    };
    let Some(expected) = auth.admin_token_hash.as_ref() else {
        return ApiError::unauthorized("missing or invalid authorization token").into_response();
    };
    if verify_admin_token(&token, expected) {
        next.run(req).await
    } else {
        ApiError::unauthorized("missing or invalid authorization token").into_response()
    }
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = raw.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

async fn fallback_not_found() -> ApiError {
    ApiError::not_found("no such route")
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "version": crate::version::VERSION}))
}

// ── status / engine control ──

#[derive(Serialize)]
struct StatusResponse {
    engine_running: bool,
    engine_installed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pid: Option<u32>,
}

async fn get_status(Extension(state): Extension<AppState>) -> Json<StatusResponse> {
    let status = state.engine.status().await;
    Json(StatusResponse {
        engine_running: status.running,
        engine_installed: state.engine.engine_installed(),
        pid: status.pid,
    })
}

async fn engine_start(Extension(state): Extension<AppState>) -> Json<SuccessResponse> {
    Json(SuccessResponse {
        success: state.engine.start().await,
    })
}

async fn engine_stop(Extension(state): Extension<AppState>) -> Json<SuccessResponse> {
    state.engine.stop().await;
    Json(SuccessResponse { success: true })
}

async fn engine_restart(Extension(state): Extension<AppState>) -> Json<SuccessResponse> {
    Json(SuccessResponse {
        success: state.engine.restart().await,
    })
}

async fn engine_config(Extension(state): Extension<AppState>) -> Result<Json<Value>, ApiError> {
    let path = state.engine.config_path();
    if !path.exists() {
        return Ok(Json(json!({})));
    }
    let bytes =
        std::fs::read(path).map_err(|e| ApiError::internal(format!("read engine config: {e}")))?;
    let doc = serde_json::from_slice(&bytes)
        .map_err(|e| ApiError::internal(format!("parse engine config: {e}")))?;
    Ok(Json(doc))
}

async fn engine_version(Extension(state): Extension<AppState>) -> Json<Value> {
    match state.engine.version().await {
        Ok(version) => Json(json!({"installed": true, "version": version})),
        Err(EngineCommandError::BinaryMissing { .. }) => Json(json!({"installed": false})),
        Err(_) => Json(json!({"installed": true, "version": "unknown"})),
    }
}

async fn engine_reality_keys(
    Extension(state): Extension<AppState>,
) -> Result<Json<Value>, ApiError> {
    let keys = state
        .engine
        .generate_reality_keypair()
        .await
        .map_err(|e| ApiError::invalid_request(format!("reality key generation failed: {e}")))?;
    Ok(Json(json!({
        "private_key": keys.private_key,
        "public_key": keys.public_key,
    })))
}

// ── settings ──

#[derive(Serialize)]
struct SettingsResponse {
    xray_api_port: u16,
    xray_log_level: String,
    block_bittorrent: bool,
    custom_dns: String,
    custom_routing_rules: String,
    custom_outbounds: String,
    sub_profile_title: String,
    tg_bot_token: String,
    tg_chat_id: String,
}

async fn get_settings(
    Extension(state): Extension<AppState>,
) -> Result<Json<SettingsResponse>, ApiError> {
    let store = state.store.lock().await;
    Ok(Json(SettingsResponse {
        xray_api_port: store
            .get_setting("xray_api_port", "10085")?
            .parse()
            .unwrap_or(10085),
        xray_log_level: store.get_setting("xray_log_level", "warning")?,
        block_bittorrent: store.get_setting("block_bittorrent", "true")? == "true",
        custom_dns: store.get_setting("custom_dns", "")?,
        custom_routing_rules: store.get_setting("custom_routing_rules", "")?,
        custom_outbounds: store.get_setting("custom_outbounds", "")?,
        sub_profile_title: store.get_setting("sub_profile_title", "SelfRay")?,
        tg_bot_token: store.get_setting("tg_bot_token", "")?,
        tg_chat_id: store.get_setting("tg_chat_id", "")?,
    }))
}

#[derive(Deserialize)]
struct SettingsUpdateRequest {
    xray_api_port: Option<u16>,
    xray_log_level: Option<String>,
    block_bittorrent: Option<bool>,
    custom_dns: Option<String>,
    custom_routing_rules: Option<String>,
    custom_outbounds: Option<String>,
    sub_profile_title: Option<String>,
    tg_bot_token: Option<String>,
    tg_chat_id: Option<String>,
}

async fn update_settings(
    Extension(state): Extension<AppState>,
    ApiJson(req): ApiJson<SettingsUpdateRequest>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let mut engine_affected = false;
    {
        let store = state.store.lock().await;
        if let Some(port) = req.xray_api_port {
            store.set_setting("xray_api_port", &port.to_string())?;
            engine_affected = true;
        }
        if let Some(level) = &req.xray_log_level {
            store.set_setting("xray_log_level", level)?;
            engine_affected = true;
        }
        if let Some(block) = req.block_bittorrent {
            store.set_setting("block_bittorrent", if block { "true" } else { "false" })?;
            engine_affected = true;
        }
        if let Some(dns) = &req.custom_dns {
            store.set_setting("custom_dns", dns)?;
            engine_affected = true;
        }
        if let Some(rules) = &req.custom_routing_rules {
            store.set_setting("custom_routing_rules", rules)?;
            engine_affected = true;
        }
        if let Some(outbounds) = &req.custom_outbounds {
            store.set_setting("custom_outbounds", outbounds)?;
            engine_affected = true;
        }
        if let Some(title) = &req.sub_profile_title {
            store.set_setting("sub_profile_title", title)?;
        }
        if let Some(token) = &req.tg_bot_token {
            store.set_setting("tg_bot_token", token)?;
        }
        if let Some(chat_id) = &req.tg_chat_id {
            store.set_setting("tg_chat_id", chat_id)?;
        }
    }

    if engine_affected {
        state.engine.restart().await;
    }
    Ok(Json(SuccessResponse { success: true }))
}

// ── inbounds ──

fn default_tls_alpn() -> String {
    "h2,http/1.1".to_string()
}

fn default_fingerprint() -> String {
    "chrome".to_string()
}

fn default_reality_dest() -> String {
    "google.com:443".to_string()
}

fn default_reality_server_names() -> String {
    "google.com".to_string()
}

fn default_decryption() -> String {
    "none".to_string()
}

fn default_ss_method() -> String {
    "chacha20-ietf-poly1305".to_string()
}

fn default_ss_network() -> String {
    "tcp,udp".to_string()
}

fn default_tcp_header_type() -> String {
    "none".to_string()
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_slash() -> String {
    "/".to_string()
}

fn default_xhttp_mode() -> String {
    "auto".to_string()
}

fn default_sniffing_dest_override() -> String {
    "http,tls,quic".to_string()
}

fn default_true() -> bool {
    true
}

fn default_network() -> Network {
    Network::Tcp
}

fn default_security() -> Security {
    Security::None
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateInboundRequest {
    pub protocol: Protocol,
    pub port: u16,
    #[serde(default)]
    pub listen: String,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub country: String,
    #[serde(default = "default_network")]
    pub network: Network,
    #[serde(default = "default_security")]
    pub security: Security,
    // TLS
    #[serde(default)]
    pub tls_server_name: String,
    #[serde(default)]
    pub tls_cert_file: String,
    #[serde(default)]
    pub tls_key_file: String,
    #[serde(default = "default_tls_alpn")]
    pub tls_alpn: String,
    #[serde(default = "default_fingerprint")]
    pub tls_fingerprint: String,
    #[serde(default)]
    pub tls_allow_insecure: bool,
    // Reality
    #[serde(default = "default_reality_dest")]
    pub reality_dest: String,
    #[serde(default = "default_reality_server_names")]
    pub reality_server_names: String,
    #[serde(default)]
    pub reality_private_key: String,
    #[serde(default)]
    pub reality_public_key: String,
    #[serde(default)]
    pub reality_short_ids: String,
    #[serde(default)]
    pub reality_spider_x: String,
    #[serde(default = "default_fingerprint")]
    pub reality_fingerprint: String,
    // VLESS
    #[serde(default)]
    pub flow: String,
    #[serde(default = "default_decryption")]
    pub vless_decryption: String,
    // Trojan
    #[serde(default)]
    pub trojan_fallback_addr: String,
    #[serde(default)]
    pub trojan_fallback_port: u16,
    // Shadowsocks
    #[serde(default = "default_ss_method")]
    pub ss_method: String,
    #[serde(default)]
    pub ss_password: String,
    #[serde(default = "default_ss_network")]
    pub ss_network: String,
    // TCP
    #[serde(default = "default_tcp_header_type")]
    pub tcp_header_type: String,
    #[serde(default = "default_slash")]
    pub tcp_header_request_path: String,
    #[serde(default)]
    pub tcp_header_request_host: String,
    // WebSocket
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    #[serde(default)]
    pub ws_host: String,
    // gRPC
    #[serde(default)]
    pub grpc_service_name: String,
    #[serde(default)]
    pub grpc_multi_mode: bool,
    // HTTP/2
    #[serde(default = "default_slash")]
    pub h2_path: String,
    #[serde(default)]
    pub h2_host: String,
    // HTTPUpgrade
    #[serde(default = "default_slash")]
    pub httpupgrade_path: String,
    #[serde(default)]
    pub httpupgrade_host: String,
    // XHTTP
    #[serde(default = "default_slash")]
    pub xhttp_path: String,
    #[serde(default = "default_xhttp_mode")]
    pub xhttp_mode: String,
    #[serde(default)]
    pub xhttp_host: String,
    // Sniffing
    #[serde(default = "default_true")]
    pub sniffing_enabled: bool,
    #[serde(default = "default_sniffing_dest_override")]
    pub sniffing_dest_override: String,
    #[serde(default)]
    pub sniffing_route_only: bool,
    // First client
    #[serde(default)]
    pub client_name: String,
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn build_stream_settings(
    req: &CreateInboundRequest,
    reality_private_key: &str,
    reality_public_key: &str,
) -> StreamSettings {
    let mut stream = StreamSettings {
        network: req.network,
        security: req.security,
        tcp_settings: None,
        ws_settings: None,
        grpc_settings: None,
        http_settings: None,
        httpupgrade_settings: None,
        xhttp_settings: None,
        tls_settings: None,
        reality_settings: None,
    };

    match req.network {
        Network::Tcp => {
            let request = (req.tcp_header_type == "http").then(|| TcpHttpRequest {
                path: vec![if req.tcp_header_request_path.is_empty() {
                    "/".to_string()
                } else {
                    req.tcp_header_request_path.clone()
                }],
                headers: TcpHttpRequestHeaders {
                    host: if req.tcp_header_request_host.is_empty() {
                        Vec::new()
                    } else {
                        vec![req.tcp_header_request_host.clone()]
                    },
                },
            });
            stream.tcp_settings = Some(TcpSettings {
                header: TcpHeader {
                    header_type: req.tcp_header_type.clone(),
                    request,
                },
            });
        }
        Network::Ws => {
            stream.ws_settings = Some(WsSettings {
                path: if req.ws_path.is_empty() {
                    default_ws_path()
                } else {
                    req.ws_path.clone()
                },
                headers: (!req.ws_host.is_empty()).then(|| crate::protocol::WsHeaders {
                    host: req.ws_host.clone(),
                }),
            });
        }
        Network::Grpc => {
            stream.grpc_settings = Some(GrpcSettings {
                service_name: if req.grpc_service_name.is_empty() {
                    "grpc".to_string()
                } else {
                    req.grpc_service_name.clone()
                },
                multi_mode: req.grpc_multi_mode,
            });
        }
        Network::H2 => {
            stream.http_settings = Some(HttpSettings {
                path: if req.h2_path.is_empty() {
                    default_slash()
                } else {
                    req.h2_path.clone()
                },
                host: (!req.h2_host.is_empty()).then(|| vec![req.h2_host.clone()]),
            });
        }
        Network::Httpupgrade => {
            stream.httpupgrade_settings = Some(HttpUpgradeSettings {
                path: if req.httpupgrade_path.is_empty() {
                    default_slash()
                } else {
                    req.httpupgrade_path.clone()
                },
                host: (!req.httpupgrade_host.is_empty()).then(|| req.httpupgrade_host.clone()),
            });
        }
        Network::Xhttp => {
            stream.xhttp_settings = Some(XhttpSettings {
                path: if req.xhttp_path.is_empty() {
                    default_slash()
                } else {
                    req.xhttp_path.clone()
                },
                mode: if req.xhttp_mode.is_empty() {
                    default_xhttp_mode()
                } else {
                    req.xhttp_mode.clone()
                },
                host: (!req.xhttp_host.is_empty()).then(|| req.xhttp_host.clone()),
            });
        }
    }

    match req.security {
        Security::Tls => {
            let certificates = (!req.tls_cert_file.is_empty() && !req.tls_key_file.is_empty())
                .then(|| {
                    vec![TlsCertificate {
                        certificate_file: req.tls_cert_file.clone(),
                        key_file: req.tls_key_file.clone(),
                    }]
                });
            stream.tls_settings = Some(TlsSettings {
                server_name: req.tls_server_name.clone(),
                alpn: split_csv(&req.tls_alpn),
                fingerprint: req.tls_fingerprint.clone(),
                allow_insecure: req.tls_allow_insecure,
                certificates,
            });
        }
        Security::Reality => {
            let short_ids = if req.reality_short_ids.is_empty() {
                vec![generate_short_id(&mut rand::rngs::OsRng)]
            } else {
                split_csv(&req.reality_short_ids)
            };
            stream.reality_settings = Some(RealitySettings {
                show: false,
                dest: if req.reality_dest.is_empty() {
                    default_reality_dest()
                } else {
                    req.reality_dest.clone()
                },
                xver: 0,
                server_names: split_csv(&req.reality_server_names),
                private_key: reality_private_key.to_string(),
                short_ids,
                public_key: reality_public_key.to_string(),
                fingerprint: if req.reality_fingerprint.is_empty() {
                    default_fingerprint()
                } else {
                    req.reality_fingerprint.clone()
                },
                spider_x: (!req.reality_spider_x.is_empty())
                    .then(|| req.reality_spider_x.clone()),
            });
        }
        Security::None => {}
    }

    stream
}

fn build_protocol_settings(req: &CreateInboundRequest) -> Value {
    match req.protocol {
        Protocol::Vless => {
            let flow = (req.security == Security::Reality && !req.flow.is_empty())
                .then(|| req.flow.clone());
            serde_json::to_value(VlessSettings {
                clients: Vec::new(),
                decryption: if req.vless_decryption.is_empty() {
                    default_decryption()
                } else {
                    req.vless_decryption.clone()
                },
                flow,
                fallbacks: None,
            })
            .expect("vless settings serialize")
        }
        Protocol::Vmess => serde_json::to_value(VmessSettings {
            clients: Vec::new(),
        })
        .expect("vmess settings serialize"),
        Protocol::Trojan => {
            let fallbacks = (!req.trojan_fallback_addr.is_empty()).then(|| {
                vec![TrojanFallback {
                    addr: req.trojan_fallback_addr.clone(),
                    port: if req.trojan_fallback_port == 0 {
                        80
                    } else {
                        req.trojan_fallback_port
                    },
                }]
            });
            serde_json::to_value(TrojanSettings {
                clients: Vec::new(),
                fallbacks,
            })
            .expect("trojan settings serialize")
        }
        Protocol::Shadowsocks => serde_json::to_value(ShadowsocksSettings {
            method: req.ss_method.clone(),
            password: if req.ss_password.is_empty() {
                nanoid::nanoid!()
            } else {
                req.ss_password.clone()
            },
            network: req.ss_network.clone(),
        })
        .expect("ss settings serialize"),
    }
}

fn build_sniffing(req: &CreateInboundRequest) -> SniffingSettings {
    SniffingSettings {
        enabled: req.sniffing_enabled,
        dest_override: split_csv(&req.sniffing_dest_override),
        route_only: req.sniffing_route_only.then_some(true),
    }
}

#[derive(Serialize)]
struct CreateInboundResponse {
    success: bool,
    id: i64,
    tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<String>,
}

async fn create_inbound(
    Extension(state): Extension<AppState>,
    ApiJson(req): ApiJson<CreateInboundRequest>,
) -> Result<Json<CreateInboundResponse>, ApiError> {
    validate_port(req.port)?;

    let (mut reality_private, mut reality_public) = (
        req.reality_private_key.clone(),
        req.reality_public_key.clone(),
    );
    if req.security == Security::Reality
        && (reality_private.is_empty() || reality_public.is_empty())
    {
        if !state.engine.engine_installed() {
            return Err(ApiError::invalid_request(
                "install the engine before creating a reality inbound (key generation needs it)",
            ));
        }
        let keys = state.engine.generate_reality_keypair().await.map_err(|e| {
            ApiError::invalid_request(format!("reality key generation failed: {e}"))
        })?;
        reality_private = keys.private_key;
        reality_public = keys.public_key;
    }

    let stream = build_stream_settings(&req, &reality_private, &reality_public);
    let settings = build_protocol_settings(&req);
    let sniffing = build_sniffing(&req);

    let remark = if req.country.is_empty() {
        req.remark.clone()
    } else {
        format!("{} {}", req.country, req.remark).trim().to_string()
    };

    let inbound = {
        let store = state.store.lock().await;
        store.create_inbound(NewInbound {
            protocol: req.protocol,
            listen: req.listen.clone(),
            port: req.port,
            settings,
            stream_settings: serde_json::to_value(&stream).expect("stream settings serialize"),
            sniffing: serde_json::to_value(&sniffing).expect("sniffing serialize"),
            remark,
        })?
    };

    let client_id = if inbound.protocol.has_client_list() {
        let client = {
            let store = state.store.lock().await;
            store.create_client(NewClient {
                inbound_id: inbound.id,
                name: if req.client_name.is_empty() {
                    "default-user".to_string()
                } else {
                    req.client_name.clone()
                },
                flow: if req.protocol == Protocol::Vless {
                    req.flow.clone()
                } else {
                    String::new()
                },
                expiry_time: 0,
                traffic_limit: 0,
                ip_limit: 0,
            })?
        };
        Some(client.id)
    } else {
        None
    };

    state.engine.restart().await;
    Ok(Json(CreateInboundResponse {
        success: true,
        id: inbound.id,
        tag: inbound.tag,
        client_id,
    }))
}

#[derive(Serialize)]
struct InboundWithClients {
    #[serde(flatten)]
    inbound: Inbound,
    clients: Vec<Client>,
}

async fn list_inbounds(
    Extension(state): Extension<AppState>,
) -> Result<Json<Items<InboundWithClients>>, ApiError> {
    let store = state.store.lock().await;
    let mut items = Vec::new();
    for inbound in store.list_inbounds()? {
        let clients = store.list_clients(inbound.id)?;
        items.push(InboundWithClients { inbound, clients });
    }
    Ok(Json(Items { items }))
}

async fn get_inbound(
    Extension(state): Extension<AppState>,
    Path(inbound_id): Path<i64>,
) -> Result<Json<InboundWithClients>, ApiError> {
    let store = state.store.lock().await;
    let inbound = store
        .get_inbound(inbound_id)?
        .ok_or_else(|| ApiError::not_found(format!("inbound not found: {inbound_id}")))?;
    let clients = store.list_clients(inbound_id)?;
    Ok(Json(InboundWithClients { inbound, clients }))
}

#[derive(Deserialize)]
struct UpdateInboundRequest {
    listen: Option<String>,
    port: Option<u16>,
    remark: Option<String>,
    settings: Option<Value>,
    stream_settings: Option<Value>,
    sniffing: Option<Value>,
}

async fn update_inbound(
    Extension(state): Extension<AppState>,
    Path(inbound_id): Path<i64>,
    ApiJson(req): ApiJson<UpdateInboundRequest>,
) -> Result<Json<Inbound>, ApiError> {
    let updated = {
        let store = state.store.lock().await;
        store.update_inbound(
            inbound_id,
            InboundUpdate {
                listen: req.listen,
                port: req.port,
                remark: req.remark,
                settings: req.settings,
                stream_settings: req.stream_settings,
                sniffing: req.sniffing,
            },
        )?
    }
    .ok_or_else(|| ApiError::not_found(format!("inbound not found: {inbound_id}")))?;

    state.engine.restart().await;
    Ok(Json(updated))
}

async fn delete_inbound(
    Extension(state): Extension<AppState>,
    Path(inbound_id): Path<i64>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let deleted = {
        let store = state.store.lock().await;
        store.delete_inbound(inbound_id)?
    };
    if !deleted {
        return Err(ApiError::not_found(format!(
            "inbound not found: {inbound_id}"
        )));
    }
    state.engine.restart().await;
    Ok(Json(SuccessResponse { success: true }))
}

#[derive(Serialize)]
struct ToggleResponse {
    success: bool,
    enabled: bool,
}

async fn toggle_inbound(
    Extension(state): Extension<AppState>,
    Path(inbound_id): Path<i64>,
) -> Result<Json<ToggleResponse>, ApiError> {
    let enabled = {
        let store = state.store.lock().await;
        store.toggle_inbound(inbound_id)?
    }
    .ok_or_else(|| ApiError::not_found(format!("inbound not found: {inbound_id}")))?;

    state.engine.restart().await;
    Ok(Json(ToggleResponse {
        success: true,
        enabled,
    }))
}

// ── clients ──

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Deserialize)]
struct CreateClientRequest {
    name: String,
    #[serde(default)]
    flow: String,
    #[serde(default)]
    expiry_days: i64,
    #[serde(default)]
    traffic_limit_gb: f64,
    #[serde(default)]
    ip_limit: u32,
}

fn expiry_time_from_days(expiry_days: i64) -> Result<i64, ApiError> {
    if expiry_days < 0 {
        return Err(DomainError::InvalidExpiryDays { expiry_days }.into());
    }
    if expiry_days == 0 {
        return Ok(0);
    }
    let expiry = chrono::Utc::now() + chrono::Duration::days(expiry_days);
    Ok(expiry.timestamp_millis())
}

fn traffic_limit_from_gb(traffic_limit_gb: f64) -> Result<u64, ApiError> {
    if !traffic_limit_gb.is_finite() || traffic_limit_gb < 0.0 {
        return Err(DomainError::InvalidTrafficLimitGb { traffic_limit_gb }.into());
    }
    Ok((traffic_limit_gb * BYTES_PER_GB) as u64)
}

#[derive(Serialize)]
struct CreateClientResponse {
    success: bool,
    id: String,
    credential: String,
}

async fn create_client(
    Extension(state): Extension<AppState>,
    Path(inbound_id): Path<i64>,
    ApiJson(req): ApiJson<CreateClientRequest>,
) -> Result<Json<CreateClientResponse>, ApiError> {
    let expiry_time = expiry_time_from_days(req.expiry_days)?;
    let traffic_limit = traffic_limit_from_gb(req.traffic_limit_gb)?;

    let client = {
        let store = state.store.lock().await;
        store.create_client(NewClient {
            inbound_id,
            name: req.name,
            flow: req.flow,
            expiry_time,
            traffic_limit,
            ip_limit: req.ip_limit,
        })?
    };

    state.engine.restart().await;
    Ok(Json(CreateClientResponse {
        success: true,
        id: client.id,
        credential: client.credential,
    }))
}

#[derive(Deserialize)]
struct UpdateClientRequest {
    name: Option<String>,
    flow: Option<String>,
    enabled: Option<bool>,
    expiry_days: Option<i64>,
    traffic_limit_gb: Option<f64>,
    ip_limit: Option<u32>,
}

async fn update_client(
    Extension(state): Extension<AppState>,
    Path(client_id): Path<String>,
    ApiJson(req): ApiJson<UpdateClientRequest>,
) -> Result<Json<Client>, ApiError> {
    let expiry_time = req.expiry_days.map(expiry_time_from_days).transpose()?;
    let traffic_limit = req
        .traffic_limit_gb
        .map(traffic_limit_from_gb)
        .transpose()?;

    let updated = {
        let store = state.store.lock().await;
        store.update_client(
            &client_id,
            ClientUpdate {
                name: req.name,
                flow: req.flow,
                enabled: req.enabled,
                expiry_time,
                traffic_limit,
                ip_limit: req.ip_limit,
            },
        )?
    }
    .ok_or_else(|| ApiError::not_found(format!("client not found: {client_id}")))?;

    state.engine.restart().await;
    Ok(Json(updated))
}

async fn delete_client(
    Extension(state): Extension<AppState>,
    Path(client_id): Path<String>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let deleted = {
        let store = state.store.lock().await;
        store.delete_client(&client_id)?
    };
    if !deleted {
        return Err(ApiError::not_found(format!(
            "client not found: {client_id}"
        )));
    }
    state.engine.restart().await;
    Ok(Json(SuccessResponse { success: true }))
}

/// Quota reset is orthogonal to the enabled flag and does not touch routing,
/// so no engine restart here.
async fn reset_client_traffic(
    Extension(state): Extension<AppState>,
    Path(client_id): Path<String>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let reset = {
        let store = state.store.lock().await;
        store.reset_client_traffic(&client_id)?
    };
    if !reset {
        return Err(ApiError::not_found(format!(
            "client not found: {client_id}"
        )));
    }
    Ok(Json(SuccessResponse { success: true }))
}

#[derive(Serialize)]
struct ClientLinkResponse {
    link: String,
    protocol: Protocol,
    host: String,
    port: u16,
}

async fn client_link(
    Extension(state): Extension<AppState>,
    Path(client_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ClientLinkResponse>, ApiError> {
    let (client, inbound) = {
        let store = state.store.lock().await;
        store.client_with_inbound(&client_id)?
    }
    .ok_or_else(|| ApiError::not_found(format!("client not found: {client_id}")))?;

    let host = host_from_headers(&headers).unwrap_or_else(|| "YOUR_SERVER_IP".to_string());
    let link = render_link(&inbound, &client, &host)
        .map_err(|e| ApiError::invalid_request(e.to_string()))?;
    Ok(Json(ClientLinkResponse {
        link,
        protocol: inbound.protocol,
        host,
        port: inbound.port,
    }))
}

fn host_from_headers(headers: &HeaderMap) -> Option<String> {
    let host = headers.get(header::HOST)?.to_str().ok()?;
    let host = host.split(':').next()?.trim().to_string();
    if host.is_empty() || host == "0.0.0.0" || host == "127.0.0.1" || host == "localhost" {
        None
    } else {
        Some(host)
    }
}

// ── subscription ──

async fn get_subscription(
    Extension(state): Extension<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (client, inbound) = {
        let store = state.store.lock().await;
        store.client_with_inbound(&token)?
    }
    .ok_or_else(|| ApiError::not_found("unknown subscription token"))?;

    let host = host_from_headers(&headers).unwrap_or_else(|| "YOUR_SERVER_IP".to_string());
    let link = render_link(&inbound, &client, &host)
        .map_err(|e| ApiError::internal(e.to_string()))?;

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if is_known_client_app(user_agent) {
        let profile_title = {
            let store = state.store.lock().await;
            store.get_setting("sub_profile_title", "SelfRay")?
        };
        let filename = client.name.replace(['"', '\\'], "_");
        let response = (
            [
                (header::CONTENT_TYPE.as_str(), "text/plain".to_string()),
                (
                    header::CONTENT_DISPOSITION.as_str(),
                    format!("attachment; filename=\"{filename}\""),
                ),
                (
                    "profile-title",
                    encode_subscription_body(&profile_title),
                ),
                ("subscription-userinfo", subscription_user_info(&client)),
                ("profile-update-interval", "12".to_string()),
            ],
            encode_subscription_body(&link),
        );
        return Ok(response.into_response());
    }

    Ok(Html(subscription_page_html(&client, &inbound, &link, &token, &host)).into_response())
}

fn format_expiry(expiry_time: i64) -> String {
    if expiry_time <= 0 {
        return "Unlimited".to_string();
    }
    match chrono::DateTime::from_timestamp_millis(expiry_time) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M").to_string(),
        None => "Unlimited".to_string(),
    }
}

fn format_traffic_limit(traffic_limit: u64) -> String {
    if traffic_limit == 0 {
        return "Unlimited".to_string();
    }
    format!("{:.1} GB", traffic_limit as f64 / BYTES_PER_GB)
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn subscription_page_html(
    client: &Client,
    inbound: &Inbound,
    link: &str,
    token: &str,
    host: &str,
) -> String {
    let name = escape_html(&client.name);
    let protocol = inbound.protocol.as_str().to_uppercase();
    let expiry = format_expiry(client.expiry_time);
    let limit = format_traffic_limit(client.traffic_limit);
    let used = format!("{:.2} GB", client.total_usage() as f64 / BYTES_PER_GB);
    let link = escape_html(link);
    let sub_url = format!("http://{host}/sub/{token}");

    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\">\
<meta name=\"viewport\" content=\"width=device-width,initial-scale=1\">\
<title>{name}</title></head><body>\
<h1>{name}</h1>\
<p>{protocol} subscription</p>\
<ul>\
<li>Expires: {expiry}</li>\
<li>Limit: {limit}</li>\
<li>Used: {used}</li>\
</ul>\
<p>Connection link:</p><pre>{link}</pre>\
<p>Subscription URL:</p><pre>{sub_url}</pre>\
</body></html>"
    )
}

// ── telegram ──

#[derive(Deserialize, Default)]
struct TelegramTestRequest {
    #[serde(default)]
    token: String,
    #[serde(default)]
    chat_id: String,
}

async fn telegram_test(
    Extension(state): Extension<AppState>,
    ApiJson(req): ApiJson<TelegramTestRequest>,
) -> Result<Json<Value>, ApiError> {
    let (token, chat_id) = {
        let store = state.store.lock().await;
        let token = if req.token.is_empty() {
            store.get_setting("tg_bot_token", "")?
        } else {
            req.token
        };
        let chat_id = if req.chat_id.is_empty() {
            store.get_setting("tg_chat_id", "")?
        } else {
            req.chat_id
        };
        (token, chat_id)
    };

    if token.is_empty() || chat_id.is_empty() {
        return Ok(Json(json!({
            "success": false,
            "error": "bot token and chat id are required; save them first",
        })));
    }

    match state
        .notifier
        .send_message(&token, &chat_id, "✅ <b>SelfRay</b>\nTest message — bot is working!")
        .await
    {
        Ok(_) => Ok(Json(json!({"success": true}))),
        Err(err) => Ok(Json(json!({"success": false, "error": err.to_string()}))),
    }
}

async fn telegram_reset(
    Extension(state): Extension<AppState>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let store = state.store.lock().await;
    store.set_setting("tg_bot_token", "")?;
    store.set_setting("tg_chat_id", "")?;
    Ok(Json(SuccessResponse { success: true }))
}
