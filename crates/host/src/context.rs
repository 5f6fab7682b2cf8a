use crate::acme::{AcmeClient, CertbotClient};
use crate::certstore::CertificateStore;
use crate::interrupt::Interrupt;
use crate::native_acme::NativeAcmeClient;
use crate::preflight::{DnsResolver, HttpReachability, ReachabilityProbe, SystemResolver};
use crate::probe;
use crate::system::{CommandRunner, ProgressFn, SystemRunner};
use sitekeeper_common::{AcmeClientKind, AppConfig, Backend, Registry, Result, SiteError};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Everything an operation needs to touch the host. Built once per
/// invocation and passed by reference; nothing here is global.
pub struct HostContext {
    pub config: AppConfig,
    /// Backend new and re-provisioned sites are configured for.
    pub web_server: Option<Backend>,
    pub web_server_conflict: bool,
    /// Newest installed PHP-FPM version, wired into generated vhosts.
    pub php_fpm: Option<String>,
    pub runner: Arc<dyn CommandRunner>,
    pub resolver: Arc<dyn DnsResolver>,
    pub reachability: Arc<dyn ReachabilityProbe>,
    pub acme: Arc<dyn AcmeClient>,
    /// Set by Ctrl-C; every wait in an operation races against it.
    pub interrupt: Interrupt,
}

impl HostContext {
    /// Production wiring: real commands, system DNS, HTTP probes and the
    /// configured ACME client.
    pub async fn for_system(
        config: AppConfig,
        progress: Option<ProgressFn>,
        interrupt: Interrupt,
    ) -> Result<Self> {
        let mut runner = SystemRunner::new(Duration::from_secs(config.command_timeout_secs))
            .with_interrupt(interrupt.clone());
        if let Some(progress) = progress {
            runner = runner.with_progress(progress);
        }
        let runner: Arc<dyn CommandRunner> = Arc::new(runner);
        let reachability = HttpReachability::new(Duration::from_secs(config.probe_timeout_secs))?;

        let acme: Arc<dyn AcmeClient> = match config.acme_client {
            AcmeClientKind::Certbot => Arc::new(CertbotClient::new(
                runner.clone(),
                config.acme_contact_email.clone(),
                &config.cert_base,
            )),
            AcmeClientKind::Native => Arc::new(NativeAcmeClient::new(
                config.acme_directory_url.clone(),
                config.acme_contact_email.clone(),
                config.acme_storage_dir.clone(),
                CertificateStore::new(&config.cert_base),
                config.renew_before_days,
                interrupt.clone(),
            )),
        };

        let mut ctx = Self {
            config,
            web_server: None,
            web_server_conflict: false,
            php_fpm: None,
            runner,
            resolver: Arc::new(SystemResolver::from_system_conf()),
            reachability: Arc::new(reachability),
            acme,
            interrupt,
        };
        ctx.detect().await?;
        Ok(ctx)
    }

    /// Refreshes the detected web server and PHP-FPM version.
    pub async fn detect(&mut self) -> Result<()> {
        let detection = probe::detect_active_web_server(self.runner.as_ref()).await?;
        self.web_server = detection.active;
        self.web_server_conflict = detection.conflict;
        self.php_fpm = probe::php_fpm_versions(self.runner.as_ref())
            .await?
            .into_iter()
            .next();
        info!(
            web_server = ?self.web_server,
            php_fpm = ?self.php_fpm,
            acme = self.acme.name(),
            "host context ready"
        );
        Ok(())
    }

    pub fn registry(&self) -> Registry {
        Registry::open(&self.config.registry_path)
    }

    pub fn cert_store(&self) -> CertificateStore {
        CertificateStore::new(&self.config.cert_base)
    }

    pub fn active_backend(&self) -> Result<Backend> {
        self.web_server.ok_or(SiteError::NoActiveBackend)
    }
}
