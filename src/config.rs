use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// Server settings, read once from `SPACEBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Password for logins that match no account (anonymous sessions).
    pub password: String,
    pub max_connections: usize,
    /// WAL appends before the compactor rewrites the log.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls: Option<TlsFiles>,
    pub admin: Option<AdminBootstrap>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminBootstrap {
    pub email: String,
    pub password: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String },
    Unpaired { set: &'static str, missing: &'static str },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "invalid value for {var}: {value:?}"),
            ConfigError::Unpaired { set, missing } => {
                write!(f, "{set} is set but {missing} is not; set both or neither")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let tls = paired(
            &lookup,
            ("SPACEBOOK_TLS_CERT", "SPACEBOOK_TLS_KEY"),
        )?
        .map(|(cert, key)| TlsFiles {
            cert: cert.into(),
            key: key.into(),
        });
        let admin = paired(
            &lookup,
            ("SPACEBOOK_ADMIN_EMAIL", "SPACEBOOK_ADMIN_PASSWORD"),
        )?
        .map(|(email, password)| AdminBootstrap { email, password });

        Ok(Self {
            bind: lookup("SPACEBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&lookup, "SPACEBOOK_PORT")?.unwrap_or(5433),
            data_dir: lookup("SPACEBOOK_DATA_DIR")
                .unwrap_or_else(|| "./data".into())
                .into(),
            password: lookup("SPACEBOOK_PASSWORD").unwrap_or_else(|| "spacebook".into()),
            max_connections: parsed(&lookup, "SPACEBOOK_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parsed(&lookup, "SPACEBOOK_COMPACT_THRESHOLD")?.unwrap_or(1000),
            metrics_port: parsed(&lookup, "SPACEBOOK_METRICS_PORT")?,
            tls,
            admin,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_port.map(|p| ([0, 0, 0, 0], p).into())
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("spacebook.wal")
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

fn paired(
    lookup: &impl Fn(&str) -> Option<String>,
    (a, b): (&'static str, &'static str),
) -> Result<Option<(String, String)>, ConfigError> {
    match (lookup(a), lookup(b)) {
        (None, None) => Ok(None),
        (Some(x), Some(y)) => Ok(Some((x, y))),
        (Some(_), None) => Err(ConfigError::Unpaired { set: a, missing: b }),
        (None, Some(_)) => Err(ConfigError::Unpaired { set: b, missing: a }),
    }
}
