use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

use crate::admin_token::{AdminTokenHash, parse_admin_token_hash};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "selfray",
    about = "Proxy engine control panel",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the panel HTTP server (default).
    Run,

    /// Hash a plaintext admin token for --admin-token-hash.
    HashAdminToken(HashAdminTokenArgs),
}

#[derive(Args, Debug, Clone)]
pub struct HashAdminTokenArgs {
    #[arg(long, value_name = "TOKEN")]
    pub token: String,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long,
        global = true,
        env = "SELFRAY_BIND",
        value_name = "ADDR",
        default_value = "0.0.0.0:8443"
    )]
    pub bind: SocketAddr,

    #[arg(
        long,
        global = true,
        env = "SELFRAY_DATA_DIR",
        value_name = "PATH",
        default_value = "./data"
    )]
    pub data_dir: PathBuf,

    #[arg(
        long = "engine-bin",
        global = true,
        env = "SELFRAY_ENGINE_BIN",
        value_name = "PATH",
        default_value = "./xray/xray"
    )]
    pub engine_bin: PathBuf,

    /// Where the synthesized engine config is written. Defaults to
    /// <data-dir>/engine_config.json.
    #[arg(
        long = "engine-config",
        global = true,
        env = "SELFRAY_ENGINE_CONFIG",
        value_name = "PATH"
    )]
    pub engine_config: Option<PathBuf>,

    #[arg(
        long = "reconcile-interval-secs",
        global = true,
        env = "SELFRAY_RECONCILE_INTERVAL_SECS",
        value_name = "SECS",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(5..=3600)
    )]
    pub reconcile_interval_secs: u64,

    #[arg(
        long = "engine-stop-grace-secs",
        global = true,
        env = "SELFRAY_ENGINE_STOP_GRACE_SECS",
        value_name = "SECS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..=60)
    )]
    pub engine_stop_grace_secs: u64,

    #[arg(
        long,
        global = true,
        env = "SELFRAY_ADMIN_TOKEN_HASH",
        value_name = "HASH",
        default_value = ""
    )]
    pub admin_token_hash: String,
}

impl Config {
    pub fn admin_token_hash(&self) -> Option<AdminTokenHash> {
        parse_admin_token_hash(&self.admin_token_hash)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("selfray.db")
    }

    pub fn engine_config_path(&self) -> PathBuf {
        self.engine_config
            .clone()
            .unwrap_or_else(|| self.data_dir.join("engine_config.json"))
    }
}
