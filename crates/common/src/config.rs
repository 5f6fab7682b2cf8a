use crate::error::SiteError;
use anyhow::{Result, anyhow};
use std::env;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcmeClientKind {
    /// Shell out to certbot (default, matches what most hosts already run).
    Certbot,
    /// Built-in ACME client writing into the same certificate layout.
    Native,
}

impl std::str::FromStr for AcmeClientKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "certbot" => Ok(Self::Certbot),
            "native" | "builtin" => Ok(Self::Native),
            other => Err(anyhow!("unknown ACME client {}", other)),
        }
    }
}

/// Per-backend configuration directories (Debian layout).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDirs {
    pub sites_available: PathBuf,
    pub sites_enabled: PathBuf,
}

impl BackendDirs {
    fn under(base: &Path) -> Self {
        Self {
            sites_available: base.join("sites-available"),
            sites_enabled: base.join("sites-enabled"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub root: PathBuf,
    pub registry_path: PathBuf,
    pub log_file: PathBuf,
    pub state_dir: PathBuf,
    pub web_root: PathBuf,
    pub web_user: String,
    pub apache: BackendDirs,
    pub nginx: BackendDirs,
    pub cert_base: PathBuf,
    pub acme_client: AcmeClientKind,
    pub acme_contact_email: Option<String>,
    pub acme_directory_url: String,
    pub acme_storage_dir: PathBuf,
    pub renew_before_days: u64,
    pub command_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub public_ip: Option<String>,
    pub require_root: bool,
    pub metrics_textfile: Option<PathBuf>,
}

pub const LETSENCRYPT_DIRECTORY: &str = "https://acme-v02.api.letsencrypt.org/directory";

impl AppConfig {
    /// Defaults with every path placed under `root` (`/` on a real host).
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            registry_path: root.join("var/lib/sitekeeper/domains.list"),
            log_file: root.join("var/log/sitekeeper.log"),
            state_dir: root.join("var/lib/sitekeeper"),
            web_root: root.join("var/www"),
            web_user: "www-data".to_string(),
            apache: BackendDirs::under(&root.join("etc/apache2")),
            nginx: BackendDirs::under(&root.join("etc/nginx")),
            cert_base: root.join("etc/letsencrypt/live"),
            acme_client: AcmeClientKind::Certbot,
            acme_contact_email: None,
            acme_directory_url: LETSENCRYPT_DIRECTORY.to_string(),
            acme_storage_dir: root.join("var/lib/sitekeeper/acme"),
            renew_before_days: 30,
            command_timeout_secs: 600,
            probe_timeout_secs: 10,
            public_ip: None,
            require_root: true,
            metrics_textfile: None,
            root,
        }
    }

    pub fn from_env() -> Result<Self> {
        // Load .env early so process env reads pick it up.
        let _ = dotenvy::dotenv();

        let root = env::var("SITEKEEPER_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/"));
        let mut config = Self::with_root(root);

        if let Some(path) = env_path("SITEKEEPER_REGISTRY") {
            config.registry_path = path;
        }
        if let Some(path) = env_path("SITEKEEPER_LOG_FILE") {
            config.log_file = path;
        }
        if let Some(path) = env_path("SITEKEEPER_STATE_DIR") {
            config.state_dir = path;
        }
        if let Some(path) = env_path("SITEKEEPER_WEB_ROOT") {
            config.web_root = path;
        }
        if let Ok(user) = env::var("SITEKEEPER_WEB_USER") {
            config.web_user = user;
        }
        if let Some(path) = env_path("SITEKEEPER_APACHE_DIR") {
            config.apache = BackendDirs::under(&path);
        }
        if let Some(path) = env_path("SITEKEEPER_NGINX_DIR") {
            config.nginx = BackendDirs::under(&path);
        }
        if let Some(path) = env_path("SITEKEEPER_CERT_BASE") {
            config.cert_base = path;
        }
        if let Ok(kind) = env::var("SITEKEEPER_ACME_CLIENT") {
            config.acme_client = kind.parse()?;
        }
        config.acme_contact_email = env::var("SITEKEEPER_ACME_CONTACT_EMAIL").ok();
        if let Ok(url) = env::var("SITEKEEPER_ACME_DIRECTORY_URL") {
            config.acme_directory_url = url;
        }
        if let Some(path) = env_path("SITEKEEPER_ACME_STORAGE_DIR") {
            config.acme_storage_dir = path;
        }
        config.renew_before_days = env_u64("SITEKEEPER_RENEW_BEFORE_DAYS", config.renew_before_days);
        config.command_timeout_secs =
            env_u64("SITEKEEPER_COMMAND_TIMEOUT_SECS", config.command_timeout_secs).max(1);
        config.probe_timeout_secs =
            env_u64("SITEKEEPER_PROBE_TIMEOUT_SECS", config.probe_timeout_secs).max(1);
        config.public_ip = env::var("SITEKEEPER_PUBLIC_IP")
            .ok()
            .filter(|v| !v.trim().is_empty());
        config.require_root = env_bool("SITEKEEPER_REQUIRE_ROOT", true)?;
        config.metrics_textfile = env_path("SITEKEEPER_METRICS_TEXTFILE");

        if config.acme_client == AcmeClientKind::Native && config.acme_contact_email.is_none() {
            return Err(anyhow!(
                "SITEKEEPER_ACME_CONTACT_EMAIL is required when SITEKEEPER_ACME_CLIENT=native"
            ));
        }
        Ok(config)
    }

    pub fn backend_dirs(&self, backend: crate::models::Backend) -> &BackendDirs {
        match backend {
            crate::models::Backend::Apache => &self.apache,
            crate::models::Backend::Nginx => &self.nginx,
        }
    }

    pub fn default_document_root(&self, domain: &str) -> PathBuf {
        self.web_root.join(domain)
    }

    /// Serializes validate-and-reload sequences against other invocations.
    pub fn vhost_lock_path(&self) -> PathBuf {
        self.state_dir.join("vhost.lock")
    }

    pub fn os_release_path(&self) -> PathBuf {
        self.root.join("etc/os-release")
    }
}

fn env_bool(key: &str, default: bool) -> crate::error::Result<bool> {
    match env::var(key) {
        Ok(value) => parse_bool(key, &value),
        Err(_) => Ok(default),
    }
}

fn parse_bool(key: &str, raw: &str) -> crate::error::Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SiteError::validation(format!(
            "{} must be a boolean (true/false, yes/no, on/off, 1/0), got {:?}",
            key, raw
        ))),
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}
