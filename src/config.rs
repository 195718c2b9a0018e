use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::planner::DEFAULT_CHUNK_SIZE;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub backend: BackendKind,
    pub s3_bucket: String,
    pub s3_endpoint: Option<String>,
    pub public_url: Option<String>,
    pub part_ttl_secs: u64,
}

/// Which backend holds part data and completed objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    S3,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(BackendKind::Memory),
            "s3" => Ok(BackendKind::S3),
            other => Err(format!("unknown backend `{other}` (expected `memory` or `s3`)")),
        }
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable chunked-upload coordinator")]
pub struct Args {
    /// Host to bind to (overrides UPLOAD_COORDINATOR_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides UPLOAD_COORDINATOR_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides UPLOAD_COORDINATOR_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Storage backend, `memory` or `s3` (overrides UPLOAD_COORDINATOR_BACKEND)
    #[arg(long)]
    pub backend: Option<BackendKind>,

    /// Bucket completed objects land in (overrides UPLOAD_COORDINATOR_S3_BUCKET)
    #[arg(long)]
    pub s3_bucket: Option<String>,

    /// Endpoint for S3-compatible stores (overrides UPLOAD_COORDINATOR_S3_ENDPOINT)
    #[arg(long)]
    pub s3_endpoint: Option<String>,

    /// Base URL clients reach this process at; the memory backend signs
    /// part-write URLs against it (overrides UPLOAD_COORDINATOR_PUBLIC_URL)
    #[arg(long)]
    pub public_url: Option<String>,

    /// Seconds a part-write authorization stays valid
    /// (overrides UPLOAD_COORDINATOR_PART_TTL_SECS)
    #[arg(long)]
    pub part_ttl_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Client-side commands. Without one the process runs as the server.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Upload a file through a running coordinator
    Upload {
        /// Path of the file to send
        file: PathBuf,

        /// Base URL of the coordinator
        #[arg(long, default_value = "http://127.0.0.1:3000")]
        server: String,

        /// Bytes per part
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: u64,
    },
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig, the migrate
    /// flag, and any client subcommand.
    pub fn from_env_and_args() -> Result<(Self, bool, Option<Command>)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("UPLOAD_COORDINATOR_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match env::var("UPLOAD_COORDINATOR_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing UPLOAD_COORDINATOR_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 3000,
            Err(err) => return Err(err).context("reading UPLOAD_COORDINATOR_PORT"),
        };
        let env_db = env::var("UPLOAD_COORDINATOR_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/upload_coordinator.db".into());
        let env_backend = match env::var("UPLOAD_COORDINATOR_BACKEND") {
            Ok(value) => value
                .parse::<BackendKind>()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("parsing UPLOAD_COORDINATOR_BACKEND value `{}`", value))?,
            Err(env::VarError::NotPresent) => BackendKind::Memory,
            Err(err) => return Err(err).context("reading UPLOAD_COORDINATOR_BACKEND"),
        };
        let env_bucket =
            env::var("UPLOAD_COORDINATOR_S3_BUCKET").unwrap_or_else(|_| "uploads".into());
        let env_s3_endpoint = env::var("UPLOAD_COORDINATOR_S3_ENDPOINT").ok();
        let env_public_url = env::var("UPLOAD_COORDINATOR_PUBLIC_URL").ok();
        let env_ttl = match env::var("UPLOAD_COORDINATOR_PART_TTL_SECS") {
            Ok(value) => value.parse::<u64>().with_context(|| {
                format!("parsing UPLOAD_COORDINATOR_PART_TTL_SECS value `{}`", value)
            })?,
            Err(env::VarError::NotPresent) => 3600,
            Err(err) => return Err(err).context("reading UPLOAD_COORDINATOR_PART_TTL_SECS"),
        };

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            backend: args.backend.unwrap_or(env_backend),
            s3_bucket: args.s3_bucket.unwrap_or(env_bucket),
            s3_endpoint: args.s3_endpoint.or(env_s3_endpoint),
            public_url: args.public_url.or(env_public_url),
            part_ttl_secs: args.part_ttl_secs.unwrap_or(env_ttl),
        };

        Ok((cfg, args.migrate, args.command))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Base URL the memory backend embeds in part-write authorizations.
    /// A wildcard bind address is unreachable for clients, so it is
    /// swapped for loopback.
    pub fn public_base_url(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => {
                let host = match self.host.as_str() {
                    "0.0.0.0" | "::" => "127.0.0.1",
                    other => other,
                };
                format!("http://{}:{}", host, self.port)
            }
        }
    }
}
