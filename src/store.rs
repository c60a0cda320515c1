use std::path::Path;

use rusqlite::{Connection, params};
use tracing::{debug, info};

use crate::{
    domain::{Client, DomainError, Inbound, Protocol, validate_port},
    protocol::new_inbound_tag,
};

/// Schema version recorded in the `migrations` table.
pub const SCHEMA_VERSION: i32 = 1;

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Sqlite(rusqlite::Error),
    SerdeJson(serde_json::Error),
    Domain(DomainError),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Sqlite(e) => write!(f, "sqlite error: {e}"),
            Self::SerdeJson(e) => write!(f, "json error: {e}"),
            Self::Domain(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Sqlite(e) => Some(e),
            Self::SerdeJson(e) => Some(e),
            Self::Domain(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::SerdeJson(value)
    }
}

impl From<DomainError> for StoreError {
    fn from(value: DomainError) -> Self {
        Self::Domain(value)
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[derive(Debug, Clone)]
pub struct NewInbound {
    pub protocol: Protocol,
    pub listen: String,
    pub port: u16,
    pub settings: serde_json::Value,
    pub stream_settings: serde_json::Value,
    pub sniffing: serde_json::Value,
    pub remark: String,
}

#[derive(Debug, Clone, Default)]
pub struct InboundUpdate {
    pub listen: Option<String>,
    pub port: Option<u16>,
    pub remark: Option<String>,
    pub settings: Option<serde_json::Value>,
    pub stream_settings: Option<serde_json::Value>,
    pub sniffing: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct NewClient {
    pub inbound_id: i64,
    pub name: String,
    pub flow: String,
    pub expiry_time: i64,
    pub traffic_limit: u64,
    pub ip_limit: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ClientUpdate {
    pub name: Option<String>,
    pub flow: Option<String>,
    pub enabled: Option<bool>,
    pub expiry_time: Option<i64>,
    pub traffic_limit: Option<u64>,
    pub ip_limit: Option<u32>,
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        run_migrations(&conn)?;
        Ok(Self { conn })
    }

    /// In-memory database for tests; WAL does not apply here.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        run_migrations(&conn)?;
        Ok(Self { conn })
    }

    // ── settings ──

    pub fn get_setting(&self, key: &str, default: &str) -> Result<String, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM settings WHERE key = ?1")?;
        match stmt.query_row(params![key], |row| row.get::<_, String>(0)) {
            Ok(value) => Ok(value),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(default.to_string()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    // ── inbounds ──

    pub fn create_inbound(&self, new: NewInbound) -> Result<Inbound, StoreError> {
        validate_port(new.port)?;
        let tag = new_inbound_tag(new.protocol, new.port, &mut rand::rngs::OsRng);
        self.insert_inbound(&tag, &new)
    }

    fn insert_inbound(&self, tag: &str, new: &NewInbound) -> Result<Inbound, StoreError> {
        let result = self.conn.execute(
            "INSERT INTO inbounds (tag, protocol, listen, port, settings, stream_settings, sniffing, remark)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                tag,
                new.protocol.as_str(),
                new.listen,
                new.port,
                new.settings.to_string(),
                new.stream_settings.to_string(),
                new.sniffing.to_string(),
                new.remark,
            ],
        );
        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(DomainError::TagConflict {
                    tag: tag.to_string(),
                }
                .into());
            }
            Err(e) => return Err(e.into()),
        }

        let id = self.conn.last_insert_rowid();
        debug!(inbound_id = id, tag, "inbound created");
        self.get_inbound(id)?
            .ok_or(StoreError::Domain(DomainError::MissingInbound {
                inbound_id: id,
            }))
    }

    pub fn get_inbound(&self, id: i64) -> Result<Option<Inbound>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, tag, protocol, listen, port, settings, stream_settings, sniffing, enabled, remark
             FROM inbounds WHERE id = ?1",
        )?;
        match stmt.query_row(params![id], row_to_inbound) {
            Ok(inbound) => Ok(Some(inbound)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_inbounds(&self) -> Result<Vec<Inbound>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, tag, protocol, listen, port, settings, stream_settings, sniffing, enabled, remark
             FROM inbounds ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_inbound)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn list_enabled_inbounds(&self) -> Result<Vec<Inbound>, StoreError> {
        Ok(self
            .list_inbounds()?
            .into_iter()
            .filter(|i| i.enabled)
            .collect())
    }

    pub fn count_inbounds(&self) -> Result<u64, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM inbounds", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn update_inbound(
        &self,
        id: i64,
        update: InboundUpdate,
    ) -> Result<Option<Inbound>, StoreError> {
        if self.get_inbound(id)?.is_none() {
            return Ok(None);
        }
        if let Some(port) = update.port {
            validate_port(port)?;
        }

        if let Some(listen) = &update.listen {
            self.conn.execute(
                "UPDATE inbounds SET listen = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![listen, id],
            )?;
        }
        if let Some(port) = update.port {
            self.conn.execute(
                "UPDATE inbounds SET port = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![port, id],
            )?;
        }
        if let Some(remark) = &update.remark {
            self.conn.execute(
                "UPDATE inbounds SET remark = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![remark, id],
            )?;
        }
        if let Some(settings) = &update.settings {
            self.conn.execute(
                "UPDATE inbounds SET settings = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![settings.to_string(), id],
            )?;
        }
        if let Some(stream_settings) = &update.stream_settings {
            self.conn.execute(
                "UPDATE inbounds SET stream_settings = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![stream_settings.to_string(), id],
            )?;
        }
        if let Some(sniffing) = &update.sniffing {
            self.conn.execute(
                "UPDATE inbounds SET sniffing = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![sniffing.to_string(), id],
            )?;
        }

        self.get_inbound(id)
    }

    /// Cascade-deletes the inbound's clients via the foreign key.
    pub fn delete_inbound(&self, id: i64) -> Result<bool, StoreError> {
        let deleted = self
            .conn
            .execute("DELETE FROM inbounds WHERE id = ?1", params![id])?;
        if deleted > 0 {
            info!(inbound_id = id, "inbound deleted");
        }
        Ok(deleted > 0)
    }

    /// Flips the enabled flag; returns the new state.
    pub fn toggle_inbound(&self, id: i64) -> Result<Option<bool>, StoreError> {
        let Some(inbound) = self.get_inbound(id)? else {
            return Ok(None);
        };
        let next = !inbound.enabled;
        self.conn.execute(
            "UPDATE inbounds SET enabled = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![next as i64, id],
        )?;
        Ok(Some(next))
    }

    // ── clients ──

    pub fn create_client(&self, new: NewClient) -> Result<Client, StoreError> {
        if self.get_inbound(new.inbound_id)?.is_none() {
            return Err(DomainError::MissingInbound {
                inbound_id: new.inbound_id,
            }
            .into());
        }

        // The id is the subscription token, so it must be unguessable.
        let id = nanoid::nanoid!();
        let credential = uuid::Uuid::new_v4().to_string();

        self.conn.execute(
            "INSERT INTO clients (id, inbound_id, name, credential, flow, expiry_time, traffic_limit, ip_limit)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                new.inbound_id,
                new.name,
                credential,
                new.flow,
                new.expiry_time,
                new.traffic_limit as i64,
                new.ip_limit,
            ],
        )?;
        debug!(client_id = %id, inbound_id = new.inbound_id, "client created");
        self.get_client(&id)?
            .ok_or(StoreError::Domain(DomainError::MissingClient {
                client_id: id,
            }))
    }

    pub fn get_client(&self, id: &str) -> Result<Option<Client>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, inbound_id, name, credential, flow, enabled, expiry_time, traffic_limit, upload, download, ip_limit
             FROM clients WHERE id = ?1",
        )?;
        match stmt.query_row(params![id], row_to_client) {
            Ok(client) => Ok(Some(client)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn client_with_inbound(&self, id: &str) -> Result<Option<(Client, Inbound)>, StoreError> {
        let Some(client) = self.get_client(id)? else {
            return Ok(None);
        };
        let Some(inbound) = self.get_inbound(client.inbound_id)? else {
            return Ok(None);
        };
        Ok(Some((client, inbound)))
    }

    pub fn list_clients(&self, inbound_id: i64) -> Result<Vec<Client>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, inbound_id, name, credential, flow, enabled, expiry_time, traffic_limit, upload, download, ip_limit
             FROM clients WHERE inbound_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![inbound_id], row_to_client)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn list_all_clients(&self) -> Result<Vec<Client>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, inbound_id, name, credential, flow, enabled, expiry_time, traffic_limit, upload, download, ip_limit
             FROM clients ORDER BY inbound_id, created_at, id",
        )?;
        let rows = stmt.query_map([], row_to_client)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn list_enabled_clients(&self) -> Result<Vec<Client>, StoreError> {
        Ok(self
            .list_all_clients()?
            .into_iter()
            .filter(|c| c.enabled)
            .collect())
    }

    pub fn update_client(
        &self,
        id: &str,
        update: ClientUpdate,
    ) -> Result<Option<Client>, StoreError> {
        if self.get_client(id)?.is_none() {
            return Ok(None);
        }

        if let Some(name) = &update.name {
            self.conn.execute(
                "UPDATE clients SET name = ?1 WHERE id = ?2",
                params![name, id],
            )?;
        }
        if let Some(flow) = &update.flow {
            self.conn.execute(
                "UPDATE clients SET flow = ?1 WHERE id = ?2",
                params![flow, id],
            )?;
        }
        if let Some(enabled) = update.enabled {
            self.conn.execute(
                "UPDATE clients SET enabled = ?1 WHERE id = ?2",
                params![enabled as i64, id],
            )?;
        }
        if let Some(expiry_time) = update.expiry_time {
            self.conn.execute(
                "UPDATE clients SET expiry_time = ?1 WHERE id = ?2",
                params![expiry_time, id],
            )?;
        }
        if let Some(traffic_limit) = update.traffic_limit {
            self.conn.execute(
                "UPDATE clients SET traffic_limit = ?1 WHERE id = ?2",
                params![traffic_limit as i64, id],
            )?;
        }
        if let Some(ip_limit) = update.ip_limit {
            self.conn.execute(
                "UPDATE clients SET ip_limit = ?1 WHERE id = ?2",
                params![ip_limit, id],
            )?;
        }

        self.get_client(id)
    }

    pub fn delete_client(&self, id: &str) -> Result<bool, StoreError> {
        let deleted = self
            .conn
            .execute("DELETE FROM clients WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    /// Zeroes the traffic counters. Orthogonal to the enabled flag.
    pub fn reset_client_traffic(&self, id: &str) -> Result<bool, StoreError> {
        let updated = self.conn.execute(
            "UPDATE clients SET upload = 0, download = 0 WHERE id = ?1",
            params![id],
        )?;
        Ok(updated > 0)
    }

    pub fn set_client_traffic(
        &self,
        id: &str,
        upload: u64,
        download: u64,
    ) -> Result<bool, StoreError> {
        let updated = self.conn.execute(
            "UPDATE clients SET upload = ?1, download = ?2 WHERE id = ?3",
            params![upload as i64, download as i64, id],
        )?;
        Ok(updated > 0)
    }

    /// Disables the given clients in one transaction so the reconciler's
    /// "disable N, restart once" behavior is atomic to external observers.
    pub fn disable_clients(&mut self, ids: &[String]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        for id in ids {
            tx.execute(
                "UPDATE clients SET enabled = 0 WHERE id = ?1",
                params![id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current < 1 {
        migrate_v1_initial_schema(conn)?;
    }

    debug!(
        from_version = current,
        to_version = SCHEMA_VERSION,
        "migrations applied"
    );
    Ok(())
}

fn migrate_v1_initial_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        CREATE TABLE inbounds (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tag TEXT UNIQUE NOT NULL,
            protocol TEXT NOT NULL,
            listen TEXT NOT NULL DEFAULT '',
            port INTEGER NOT NULL,
            settings TEXT NOT NULL DEFAULT '{}',
            stream_settings TEXT NOT NULL DEFAULT '{}',
            sniffing TEXT NOT NULL DEFAULT '{}',
            enabled INTEGER NOT NULL DEFAULT 1,
            remark TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE TABLE clients (
            id TEXT PRIMARY KEY,
            inbound_id INTEGER NOT NULL REFERENCES inbounds(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            credential TEXT NOT NULL,
            flow TEXT NOT NULL DEFAULT '',
            enabled INTEGER NOT NULL DEFAULT 1,
            expiry_time INTEGER NOT NULL DEFAULT 0,
            traffic_limit INTEGER NOT NULL DEFAULT 0,
            upload INTEGER NOT NULL DEFAULT 0,
            download INTEGER NOT NULL DEFAULT 0,
            ip_limit INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX idx_clients_inbound_id ON clients(inbound_id);",
    )?;
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        params![1, "initial_schema"],
    )?;
    Ok(())
}

fn row_to_inbound(row: &rusqlite::Row<'_>) -> rusqlite::Result<Inbound> {
    let protocol_raw: String = row.get(2)?;
    let protocol = Protocol::parse(&protocol_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Inbound {
        id: row.get(0)?,
        tag: row.get(1)?,
        protocol,
        listen: row.get(3)?,
        port: row.get::<_, i64>(4)? as u16,
        settings: parse_json_column(row, 5)?,
        stream_settings: parse_json_column(row, 6)?,
        sniffing: parse_json_column(row, 7)?,
        enabled: row.get::<_, i64>(8)? != 0,
        remark: row.get(9)?,
    })
}

fn parse_json_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<serde_json::Value> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_client(row: &rusqlite::Row<'_>) -> rusqlite::Result<Client> {
    Ok(Client {
        id: row.get(0)?,
        inbound_id: row.get(1)?,
        name: row.get(2)?,
        credential: row.get(3)?,
        flow: row.get(4)?,
        enabled: row.get::<_, i64>(5)? != 0,
        expiry_time: row.get(6)?,
        traffic_limit: row.get::<_, i64>(7)? as u64,
        upload: row.get::<_, i64>(8)? as u64,
        download: row.get::<_, i64>(9)? as u64,
        ip_limit: row.get::<_, i64>(10)? as u32,
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn new_vless(port: u16) -> NewInbound {
        NewInbound {
            protocol: Protocol::Vless,
            listen: String::new(),
            port,
            settings: json!({"clients": [], "decryption": "none"}),
            stream_settings: json!({"network": "tcp", "security": "none"}),
            sniffing: json!({"enabled": true, "destOverride": ["http", "tls", "quic"]}),
            remark: String::new(),
        }
    }

    fn new_client(inbound_id: i64) -> NewClient {
        NewClient {
            inbound_id,
            name: "alice".to_string(),
            flow: String::new(),
            expiry_time: 0,
            traffic_limit: 0,
            ip_limit: 0,
        }
    }

    #[test]
    fn open_persists_entities_across_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("panel.db");

        let store = SqliteStore::open(&db_path).unwrap();
        let inbound = store.create_inbound(new_vless(443)).unwrap();
        drop(store);

        let store = SqliteStore::open(&db_path).unwrap();
        let loaded = store.get_inbound(inbound.id).unwrap().unwrap();
        assert_eq!(loaded, inbound);
    }

    #[test]
    fn settings_read_reflects_latest_write() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.get_setting("panel_port", "8443").unwrap(), "8443");

        store.set_setting("panel_port", "9000").unwrap();
        assert_eq!(store.get_setting("panel_port", "8443").unwrap(), "9000");

        store.set_setting("panel_port", "9001").unwrap();
        assert_eq!(store.get_setting("panel_port", "8443").unwrap(), "9001");
    }

    #[test]
    fn create_inbound_derives_tag_and_rejects_port_zero() {
        let store = SqliteStore::open_in_memory().unwrap();
        let inbound = store.create_inbound(new_vless(443)).unwrap();
        assert!(inbound.tag.starts_with("vless-443-"));
        assert!(inbound.enabled);

        let err = store.create_inbound(new_vless(0)).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Domain(DomainError::InvalidPort { port: 0 })
        ));
        assert_eq!(store.list_inbounds().unwrap().len(), 1);
    }

    #[test]
    fn duplicate_tag_is_a_conflict_and_leaves_one_inbound() {
        let store = SqliteStore::open_in_memory().unwrap();
        let new = new_vless(443);
        store.insert_inbound("vless-443-aabbcc", &new).unwrap();

        let err = store.insert_inbound("vless-443-aabbcc", &new).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Domain(DomainError::TagConflict { .. })
        ));
        assert_eq!(store.list_inbounds().unwrap().len(), 1);
    }

    #[test]
    fn delete_inbound_cascades_to_clients() {
        let store = SqliteStore::open_in_memory().unwrap();
        let inbound = store.create_inbound(new_vless(443)).unwrap();
        let client = store.create_client(new_client(inbound.id)).unwrap();

        assert!(store.delete_inbound(inbound.id).unwrap());
        assert!(store.get_client(&client.id).unwrap().is_none());
        assert!(!store.delete_inbound(inbound.id).unwrap());
    }

    #[test]
    fn toggle_inbound_flips_enabled() {
        let store = SqliteStore::open_in_memory().unwrap();
        let inbound = store.create_inbound(new_vless(443)).unwrap();

        assert_eq!(store.toggle_inbound(inbound.id).unwrap(), Some(false));
        assert_eq!(store.toggle_inbound(inbound.id).unwrap(), Some(true));
        assert_eq!(store.toggle_inbound(999).unwrap(), None);
    }

    #[test]
    fn create_client_requires_existing_inbound() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store.create_client(new_client(42)).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Domain(DomainError::MissingInbound { inbound_id: 42 })
        ));
    }

    #[test]
    fn client_ids_are_opaque_and_distinct() {
        let store = SqliteStore::open_in_memory().unwrap();
        let inbound = store.create_inbound(new_vless(443)).unwrap();
        let a = store.create_client(new_client(inbound.id)).unwrap();
        let b = store.create_client(new_client(inbound.id)).unwrap();

        assert_ne!(a.id, b.id);
        assert_ne!(a.credential, b.credential);
        assert!(a.id.len() >= 16);
    }

    #[test]
    fn disable_clients_batch_disables_all_given_ids() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let inbound = store.create_inbound(new_vless(443)).unwrap();
        let a = store.create_client(new_client(inbound.id)).unwrap();
        let b = store.create_client(new_client(inbound.id)).unwrap();

        store.disable_clients(&[a.id.clone(), b.id.clone()]).unwrap();
        assert!(!store.get_client(&a.id).unwrap().unwrap().enabled);
        assert!(!store.get_client(&b.id).unwrap().unwrap().enabled);
        assert!(store.list_enabled_clients().unwrap().is_empty());
    }

    #[test]
    fn reset_traffic_zeroes_counters_without_touching_enabled() {
        let store = SqliteStore::open_in_memory().unwrap();
        let inbound = store.create_inbound(new_vless(443)).unwrap();
        let client = store.create_client(new_client(inbound.id)).unwrap();

        store.set_client_traffic(&client.id, 100, 200).unwrap();
        store
            .update_client(
                &client.id,
                ClientUpdate {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(store.reset_client_traffic(&client.id).unwrap());
        let after = store.get_client(&client.id).unwrap().unwrap();
        assert_eq!(after.upload, 0);
        assert_eq!(after.download, 0);
        assert!(!after.enabled);
    }

    #[test]
    fn update_client_applies_partial_fields() {
        let store = SqliteStore::open_in_memory().unwrap();
        let inbound = store.create_inbound(new_vless(443)).unwrap();
        let client = store.create_client(new_client(inbound.id)).unwrap();

        let updated = store
            .update_client(
                &client.id,
                ClientUpdate {
                    name: Some("bob".to_string()),
                    traffic_limit: Some(1024),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated.name, "bob");
        assert_eq!(updated.traffic_limit, 1024);
        assert_eq!(updated.credential, client.credential);
        assert_eq!(updated.flow, client.flow);
    }
}
