use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Apache,
    Nginx,
}

impl Backend {
    pub const ALL: [Backend; 2] = [Backend::Apache, Backend::Nginx];

    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Apache => "apache",
            Backend::Nginx => "nginx",
        }
    }

    /// systemd unit / Debian package name
    pub fn service_name(&self) -> &'static str {
        match self {
            Backend::Apache => "apache2",
            Backend::Nginx => "nginx",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "apache" | "apache2" => Ok(Backend::Apache),
            "nginx" => Ok(Backend::Nginx),
            other => Err(format!("unknown backend {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SslState {
    #[default]
    None,
    Pending,
    Active,
    Expired,
}

impl SslState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SslState::None => "none",
            SslState::Pending => "pending",
            SslState::Active => "active",
            SslState::Expired => "expired",
        }
    }
}

impl fmt::Display for SslState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SslState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "no" | "" => Ok(SslState::None),
            "pending" => Ok(SslState::Pending),
            "active" | "yes" => Ok(SslState::Active),
            "expired" => Ok(SslState::Expired),
            other => Err(format!("unknown ssl state {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRecord {
    pub name: String,
    pub backend: Backend,
    pub document_root: PathBuf,
    pub ssl_state: SslState,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
}

impl DomainRecord {
    pub fn new(name: impl Into<String>, backend: Backend, document_root: impl Into<PathBuf>) -> Self {
        let now = now_seconds();
        Self {
            name: name.into(),
            backend,
            document_root: document_root.into(),
            ssl_state: SslState::None,
            created_at: now,
            last_modified_at: now,
        }
    }

    /// Returns a copy with a new SSL state and a fresh modification time.
    pub fn with_ssl_state(&self, state: SslState) -> Self {
        Self {
            ssl_state: state,
            last_modified_at: now_seconds(),
            ..self.clone()
        }
    }

    pub fn touch(&mut self) {
        self.last_modified_at = now_seconds();
    }
}

/// Certificate material found on disk for a domain. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub domain: String,
    pub issuer: String,
    pub not_after: DateTime<Utc>,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub fullchain_path: PathBuf,
}

impl CertificateRecord {
    pub fn classify(&self, now: DateTime<Utc>) -> SslState {
        if now < self.not_after {
            SslState::Active
        } else {
            SslState::Expired
        }
    }

    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.not_after - now).num_days()
    }
}

/// Registry timestamps are stored with second precision.
pub fn now_seconds() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::<Utc>::from_timestamp(now.timestamp(), 0).unwrap_or(now)
}
