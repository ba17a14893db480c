use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TlsMinVersion {
    /// TLS 1.2.
    #[value(name = "1.2")]
    V1_2,
    /// TLS 1.3.
    #[value(name = "1.3")]
    V1_3,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "cluster-server", version, about = "Chess analysis cluster server")]
pub struct Cli {
    /// Identifies this server instance on the wire.
    #[arg(long, env = "CLUSTER_SERVER_ID")]
    pub server_id: String,

    /// Host to bind.
    #[arg(long, env = "CLUSTER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, env = "CLUSTER_PORT", default_value_t = 9000)]
    pub port: u16,

    /// Path to the UCI engine binary.
    #[arg(long, env = "CLUSTER_ENGINE_PATH")]
    pub engine_path: String,

    /// Threads passed to `setoption name Threads` per job.
    #[arg(long, env = "CLUSTER_THREADS", default_value_t = 32)]
    pub threads: u32,

    /// Maximum concurrent jobs. 0 means unlimited.
    #[arg(long, env = "CLUSTER_MAX_JOBS", default_value_t = 1)]
    pub max_jobs: usize,

    /// Optional SQLite DB file to persist jobs/logs (enables restore after restart).
    #[arg(long, env = "CLUSTER_DB")]
    pub db: Option<String>,

    /// How many recent jobs to load into memory at startup (only used with `--db`).
    #[arg(long, env = "CLUSTER_DB_LOAD_LIMIT", default_value_t = 500)]
    pub db_load_limit: usize,

    /// Path to server certificate (PEM). Requires `--tls-key` and `--client-ca`.
    #[arg(long, env = "CLUSTER_TLS_CERT")]
    pub tls_cert: Option<String>,

    /// Path to server private key (PEM). Requires `--tls-cert` and `--client-ca`.
    #[arg(long, env = "CLUSTER_TLS_KEY")]
    pub tls_key: Option<String>,

    /// Path to the CA certificate used to verify client certificates (PEM).
    /// Requires `--tls-cert` and `--tls-key`.
    #[arg(long, env = "CLUSTER_CLIENT_CA")]
    pub client_ca: Option<String>,

    /// Minimum TLS version.
    #[arg(long, env = "CLUSTER_TLS_MIN_VERSION", value_enum, default_value_t = TlsMinVersion::V1_2)]
    pub tls_min_version: TlsMinVersion,
}

impl Cli {
    /// The `(cert, key, ca)` triple, if TLS was fully configured.
    ///
    /// Returns an error if only part of the triple is present.
    pub fn tls_paths(&self) -> Result<Option<(&str, &str, &str)>, String> {
        match (&self.tls_cert, &self.tls_key, &self.client_ca) {
            (None, None, None) => Ok(None),
            (Some(cert), Some(key), Some(ca)) => Ok(Some((cert, key, ca))),
            _ => Err(
                "TLS enabled but --tls-cert, --tls-key and --client-ca must all be provided"
                    .to_string(),
            ),
        }
    }
}
