//! Host capability detection.

use crate::services::{PackageManager, ServiceManager};
use crate::system::CommandRunner;
use serde::Serialize;
use sitekeeper_common::{AppConfig, Backend, Result};
use std::collections::BTreeMap;
use std::fs;
use tracing::{debug, warn};

/// Newest first; the first installed one backs generated PHP blocks.
pub const PHP_FPM_VERSIONS: [&str; 6] = ["8.4", "8.3", "8.2", "8.1", "8.0", "7.4"];
pub const DATABASE_PACKAGES: [&str; 3] = ["mysql-server", "mariadb-server", "postgresql"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WebServerDetection {
    pub active: Option<Backend>,
    /// Both apache2 and nginx reported active; Apache was chosen.
    pub conflict: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostCapabilities {
    pub os: Option<OsRelease>,
    pub web_server: Option<Backend>,
    pub web_server_conflict: bool,
    pub installed_web_servers: Vec<Backend>,
    pub php_fpm: Vec<String>,
    pub databases: Vec<String>,
    pub certbot: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OsRelease {
    pub id: String,
    pub version_id: Option<String>,
    pub pretty_name: Option<String>,
}

pub async fn detect_active_web_server(runner: &dyn CommandRunner) -> Result<WebServerDetection> {
    let services = ServiceManager::new(runner);
    let apache = services.is_active(Backend::Apache.service_name()).await?;
    let nginx = services.is_active(Backend::Nginx.service_name()).await?;
    let detection = match (apache, nginx) {
        (true, true) => {
            warn!("both apache2 and nginx are active; managing apache2");
            WebServerDetection {
                active: Some(Backend::Apache),
                conflict: true,
            }
        }
        (true, false) => WebServerDetection {
            active: Some(Backend::Apache),
            conflict: false,
        },
        (false, true) => WebServerDetection {
            active: Some(Backend::Nginx),
            conflict: false,
        },
        (false, false) => WebServerDetection {
            active: None,
            conflict: false,
        },
    };
    debug!(?detection, "web server detection");
    Ok(detection)
}

pub async fn is_installed(runner: &dyn CommandRunner, package: &str) -> Result<bool> {
    PackageManager::new(runner).is_installed(package).await
}

/// Installed PHP-FPM versions, newest first.
pub async fn php_fpm_versions(runner: &dyn CommandRunner) -> Result<Vec<String>> {
    let packages: Vec<String> = PHP_FPM_VERSIONS
        .iter()
        .map(|v| format!("php{}-fpm", v))
        .collect();
    let names: Vec<&str> = packages.iter().map(String::as_str).collect();
    let installed = PackageManager::new(runner).installed(&names).await?;
    Ok(PHP_FPM_VERSIONS
        .iter()
        .filter(|v| installed.contains(&format!("php{}-fpm", v)))
        .map(|v| v.to_string())
        .collect())
}

pub fn php_fpm_socket(version: &str) -> String {
    format!("/run/php/php{}-fpm.sock", version)
}

pub fn read_os_release(config: &AppConfig) -> Option<OsRelease> {
    let path = config.os_release_path();
    match fs::read_to_string(&path) {
        Ok(content) => parse_os_release(&content),
        Err(err) => {
            debug!(path = %path.display(), error = %err, "os-release not readable");
            None
        }
    }
}

fn parse_os_release(content: &str) -> Option<OsRelease> {
    let fields: BTreeMap<&str, String> = content
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim().trim_matches('"').to_string()))
        .collect();
    Some(OsRelease {
        id: fields.get("ID")?.clone(),
        version_id: fields.get("VERSION_ID").cloned(),
        pretty_name: fields.get("PRETTY_NAME").cloned(),
    })
}

pub async fn probe(runner: &dyn CommandRunner, config: &AppConfig) -> Result<HostCapabilities> {
    let detection = detect_active_web_server(runner).await?;
    let packages = PackageManager::new(runner);
    let installed_web_servers = {
        let names: Vec<&str> = Backend::ALL.iter().map(|b| b.service_name()).collect();
        let installed = packages.installed(&names).await?;
        Backend::ALL
            .into_iter()
            .filter(|b| installed.contains(b.service_name()))
            .collect()
    };
    let databases = packages
        .installed(&DATABASE_PACKAGES)
        .await?
        .into_iter()
        .collect();

    Ok(HostCapabilities {
        os: read_os_release(config),
        web_server: detection.active,
        web_server_conflict: detection.conflict,
        installed_web_servers,
        php_fpm: php_fpm_versions(runner).await?,
        databases,
        certbot: packages.is_installed("certbot").await?,
    })
}
