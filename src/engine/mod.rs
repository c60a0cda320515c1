use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use tokio::{
    process::{Child, Command},
    sync::Mutex,
};
use tracing::{debug, info, warn};

use crate::store::SqliteStore;

pub mod config;

use config::{synthesize_from_store, write_config_file};

/// Bound on `version` / `x25519` side-calls to the engine binary.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStatus {
    pub running: bool,
    pub pid: Option<u32>,
}

impl EngineStatus {
    fn stopped() -> Self {
        Self {
            running: false,
            pid: None,
        }
    }
}

#[derive(Debug)]
pub enum EngineCommandError {
    BinaryMissing { path: PathBuf },
    Spawn(std::io::Error),
    Timeout { secs: u64 },
    NonZeroExit { status: std::process::ExitStatus },
    UnexpectedOutput { reason: String },
}

impl std::fmt::Display for EngineCommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BinaryMissing { path } => {
                write!(f, "engine binary not found: {}", path.display())
            }
            Self::Spawn(e) => write!(f, "spawn engine command: {e}"),
            Self::Timeout { secs } => write!(f, "engine command timed out after {secs}s"),
            Self::NonZeroExit { status } => write!(f, "engine command exited with {status}"),
            Self::UnexpectedOutput { reason } => {
                write!(f, "unexpected engine command output: {reason}")
            }
        }
    }
}

impl std::error::Error for EngineCommandError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealityKeypair {
    pub private_key: String,
    pub public_key: String,
}

/// Owns the engine child process. The handle lives behind one async mutex so
/// concurrent start/stop/restart calls serialize; there is never more than
/// one tracked engine process.
#[derive(Clone)]
pub struct EngineSupervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    engine_bin: PathBuf,
    config_path: PathBuf,
    store: Arc<Mutex<SqliteStore>>,
    stop_grace: Duration,
    child: Mutex<Option<Child>>,
}

impl EngineSupervisor {
    pub fn new(
        engine_bin: PathBuf,
        config_path: PathBuf,
        store: Arc<Mutex<SqliteStore>>,
        stop_grace: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                engine_bin,
                config_path,
                store,
                stop_grace,
                child: Mutex::new(None),
            }),
        }
    }

    pub fn engine_installed(&self) -> bool {
        self.inner.engine_bin.exists()
    }

    pub fn config_path(&self) -> &Path {
        &self.inner.config_path
    }

    /// Liveness of the tracked handle only; says nothing about whether the
    /// engine is actually serving.
    pub async fn status(&self) -> EngineStatus {
        let mut slot = self.inner.child.lock().await;
        match slot.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(None) => EngineStatus {
                    running: true,
                    pid: child.id(),
                },
                Ok(Some(_)) | Err(_) => EngineStatus::stopped(),
            },
            None => EngineStatus::stopped(),
        }
    }

    /// Synthesizes a fresh config, writes it, and launches the engine.
    ///
    /// Any previously tracked child is forcibly stopped first. All failure
    /// modes (binary absent, synthesis failure, spawn error) are logged here
    /// and reported only as `false`; the panel itself keeps running.
    pub async fn start(&self) -> bool {
        let mut slot = self.inner.child.lock().await;
        stop_tracked(&mut slot, self.inner.stop_grace).await;

        if !self.inner.engine_bin.exists() {
            warn!(
                engine_bin = %self.inner.engine_bin.display(),
                "engine binary not found; not starting"
            );
            return false;
        }

        let doc = {
            let store = self.inner.store.lock().await;
            match synthesize_from_store(&store) {
                Ok(doc) => doc,
                Err(err) => {
                    warn!(%err, "config synthesis failed; not starting engine");
                    return false;
                }
            }
        };
        if let Err(err) = write_config_file(&self.inner.config_path, &doc) {
            warn!(
                %err,
                config_path = %self.inner.config_path.display(),
                "failed to write engine config"
            );
            return false;
        }

        let spawned = Command::new(&self.inner.engine_bin)
            .arg("run")
            .arg("-c")
            .arg(&self.inner.config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();

        match spawned {
            Ok(child) => {
                info!(pid = ?child.id(), "engine started");
                *slot = Some(child);
                true
            }
            Err(err) => {
                warn!(%err, "failed to spawn engine");
                false
            }
        }
    }

    /// Graceful termination, bounded by the grace period, then force-kill.
    /// Always clears the tracked handle; idempotent when already stopped.
    pub async fn stop(&self) {
        let mut slot = self.inner.child.lock().await;
        stop_tracked(&mut slot, self.inner.stop_grace).await;
    }

    /// Stop then start; returns the start result.
    pub async fn restart(&self) -> bool {
        // start() forcibly stops the tracked child under the same lock, so
        // the stop/start pair is atomic with respect to other callers.
        self.start().await
    }

    /// `<engine> version`, first output line.
    pub async fn version(&self) -> Result<String, EngineCommandError> {
        let stdout = run_engine_command(&self.inner.engine_bin, &["version"]).await?;
        let line = stdout
            .lines()
            .next()
            .ok_or_else(|| EngineCommandError::UnexpectedOutput {
                reason: "empty version output".to_string(),
            })?;
        // "Xray 25.1.1 (...)": the second token is the version number.
        let mut parts = line.split_whitespace();
        let _name = parts.next();
        Ok(parts.next().unwrap_or(line).to_string())
    }

    /// `<engine> x25519`: key material for the Reality security mode.
    pub async fn generate_reality_keypair(&self) -> Result<RealityKeypair, EngineCommandError> {
        let stdout = run_engine_command(&self.inner.engine_bin, &["x25519"]).await?;
        parse_x25519_output(&stdout)
    }
}

async fn stop_tracked(slot: &mut Option<Child>, grace: Duration) {
    let Some(mut child) = slot.take() else {
        return;
    };

    match child.try_wait() {
        Ok(Some(status)) => {
            debug!(%status, "engine already exited");
            return;
        }
        Ok(None) => {}
        Err(err) => {
            warn!(%err, "engine status check failed");
        }
    }

    if let Some(pid) = child.id() {
        send_sigterm(pid);
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(%status, "engine stopped");
                return;
            }
            Ok(Err(err)) => {
                warn!(%err, "waiting for engine after SIGTERM failed");
            }
            Err(_) => {
                warn!(grace_secs = grace.as_secs(), "engine ignored SIGTERM; killing");
            }
        }
    }

    if let Err(err) = child.kill().await {
        warn!(%err, "failed to kill engine");
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    // SAFETY: plain kill(2) on a pid we spawned and still track.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

async fn run_engine_command(bin: &Path, args: &[&str]) -> Result<String, EngineCommandError> {
    if !bin.exists() {
        return Err(EngineCommandError::BinaryMissing {
            path: bin.to_path_buf(),
        });
    }

    let mut cmd = Command::new(bin);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let output = match tokio::time::timeout(COMMAND_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => return Err(EngineCommandError::Spawn(err)),
        Err(_) => {
            return Err(EngineCommandError::Timeout {
                secs: COMMAND_TIMEOUT.as_secs(),
            });
        }
    };

    if !output.status.success() {
        return Err(EngineCommandError::NonZeroExit {
            status: output.status,
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// The binary prints labeled lines; locate them by case-insensitive marker
/// and take the value after the last colon. Newer engine builds label the
/// public key "Password".
fn parse_x25519_output(stdout: &str) -> Result<RealityKeypair, EngineCommandError> {
    let mut private_key = String::new();
    let mut public_key = String::new();

    for line in stdout.lines() {
        let lower = line.to_ascii_lowercase();
        let value = line.rsplit(':').next().unwrap_or("").trim();
        if lower.contains("private") {
            private_key = value.to_string();
        } else if lower.contains("public") || lower.contains("password") {
            public_key = value.to_string();
        }
    }

    if private_key.is_empty() || public_key.is_empty() {
        return Err(EngineCommandError::UnexpectedOutput {
            reason: format!("missing private/public markers in: {stdout:?}"),
        });
    }
    Ok(RealityKeypair {
        private_key,
        public_key,
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn test_store() -> Arc<Mutex<SqliteStore>> {
        Arc::new(Mutex::new(SqliteStore::open_in_memory().unwrap()))
    }

    #[cfg(unix)]
    fn write_fake_engine(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("engine");
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn supervisor(engine_bin: PathBuf, dir: &Path) -> EngineSupervisor {
        EngineSupervisor::new(
            engine_bin,
            dir.join("engine_config.json"),
            test_store(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn start_fails_when_binary_is_missing_and_state_stays_stopped() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path().join("no-such-engine"), tmp.path());

        assert!(!sup.engine_installed());
        assert!(!sup.start().await);
        assert_eq!(sup.status().await, EngineStatus::stopped());
        assert!(!sup.restart().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_writes_config_and_tracks_live_child() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = write_fake_engine(tmp.path(), "#!/bin/sh\nexec sleep 600\n");
        let sup = supervisor(bin, tmp.path());

        assert!(sup.start().await);
        let status = sup.status().await;
        assert!(status.running);
        assert!(status.pid.is_some());

        let doc: serde_json::Value =
            serde_json::from_slice(&std::fs::read(sup.config_path()).unwrap()).unwrap();
        assert_eq!(doc["inbounds"][0]["tag"], "api-in");
        assert_eq!(doc["outbounds"][0]["tag"], "direct");

        sup.stop().await;
        assert_eq!(sup.status().await, EngineStatus::stopped());
        // Idempotent when already stopped.
        sup.stop().await;
        assert_eq!(sup.status().await, EngineStatus::stopped());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn restart_replaces_the_tracked_child() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = write_fake_engine(tmp.path(), "#!/bin/sh\nexec sleep 600\n");
        let sup = supervisor(bin, tmp.path());

        assert!(sup.start().await);
        let first = sup.status().await.pid.unwrap();

        assert!(sup.restart().await);
        let second = sup.status().await;
        assert!(second.running);
        assert_ne!(second.pid.unwrap(), first);

        sup.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn status_reports_stopped_after_child_crash() {
        let tmp = tempfile::tempdir().unwrap();
        // Exits immediately, simulating an engine crash on startup.
        let bin = write_fake_engine(tmp.path(), "#!/bin/sh\nexit 1\n");
        let sup = supervisor(bin, tmp.path());

        assert!(sup.start().await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!sup.status().await.running);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn version_takes_second_token_of_first_line() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = write_fake_engine(
            tmp.path(),
            "#!/bin/sh\necho 'Xray 25.1.30 (Xray, Penetrates Everything.)'\n",
        );
        let sup = supervisor(bin, tmp.path());
        assert_eq!(sup.version().await.unwrap(), "25.1.30");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn x25519_output_is_parsed_by_markers() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = write_fake_engine(
            tmp.path(),
            "#!/bin/sh\necho 'Private key: kJ1frzGJVQ4O'\necho 'Public key: m9X2aaVq21wQ'\n",
        );
        let sup = supervisor(bin, tmp.path());
        let keys = sup.generate_reality_keypair().await.unwrap();
        assert_eq!(keys.private_key, "kJ1frzGJVQ4O");
        assert_eq!(keys.public_key, "m9X2aaVq21wQ");
    }

    #[test]
    fn x25519_parse_accepts_password_label_for_public_key() {
        let keys =
            parse_x25519_output("PrivateKey: abc\nPassword: def\n").unwrap();
        assert_eq!(keys.private_key, "abc");
        assert_eq!(keys.public_key, "def");
    }

    #[test]
    fn x25519_parse_rejects_unlabeled_output() {
        assert!(parse_x25519_output("nothing useful\n").is_err());
        assert!(parse_x25519_output("").is_err());
    }

    #[tokio::test]
    async fn version_on_missing_binary_is_binary_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path().join("absent"), tmp.path());
        assert!(matches!(
            sup.version().await.unwrap_err(),
            EngineCommandError::BinaryMissing { .. }
        ));
    }
}
