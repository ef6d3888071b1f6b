//! CLI argument parsing using clap.

use std::path::{Path, PathBuf};

use clap::Parser;

use crate::bridge::SESSION_DB;
use crate::storage::DatabaseConfig;

/// WhatsApp History - record chats into SQLite or PostgreSQL and serve a query API
#[derive(Parser, Debug, Clone)]
#[command(name = "whatsapp-history")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Enable verbose/debug logging
    #[arg(short, long, env = "WA_VERBOSE")]
    pub verbose: bool,

    /// Directory for the databases and downloaded media
    #[arg(long, value_name = "DIR", env = "WA_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Path to wa-bridge binary (auto-detected by default)
    #[arg(long, value_name = "PATH", env = "WA_BRIDGE_PATH")]
    pub bridge_path: Option<PathBuf>,

    /// Host address to bind the API server to
    #[arg(long, default_value = "0.0.0.0", env = "WA_HOST")]
    pub host: String,

    /// Port for the API server
    #[arg(long, default_value = "8080", env = "WA_PORT")]
    pub port: u16,

    /// Ask the phone for a history sync once connected
    #[arg(long, env = "WA_REQUEST_HISTORY")]
    pub request_history: bool,

    /// Store messages in PostgreSQL instead of SQLite
    #[arg(long, env = "IS_POSTGRES")]
    pub postgres: bool,

    #[arg(long, env = "POSTGRES_USER", default_value = "postgres")]
    pub pg_user: String,

    #[arg(long, env = "POSTGRES_PASS", default_value = "", hide_env_values = true)]
    pub pg_pass: String,

    #[arg(long, env = "POSTGRES_HOST", default_value = "localhost")]
    pub pg_host: String,

    #[arg(long, env = "POSTGRES_PORT", default_value = "5432")]
    pub pg_port: u16,

    #[arg(long, env = "POSTGRES_DB", default_value = "whatsapp")]
    pub pg_database: String,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Database selection; decided once here and nowhere else
    pub fn database_config(&self, data_dir: &Path) -> DatabaseConfig {
        if self.postgres {
            let url = format!(
                "postgres://{}:{}@{}:{}/{}",
                urlencoding::encode(&self.pg_user),
                urlencoding::encode(&self.pg_pass),
                self.pg_host,
                self.pg_port,
                self.pg_database
            );
            DatabaseConfig::Postgres { url }
        } else {
            DatabaseConfig::Sqlite {
                path: data_dir.join("messages.db"),
                contacts_db: Some(data_dir.join(SESSION_DB)),
            }
        }
    }
}
