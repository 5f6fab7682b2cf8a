//! Virtual host provisioning.
//!
//! Every change is staged in a [`ConfigTransaction`], checked with the
//! backend's own config test and only then reloaded. A rejected config or a
//! failed reload restores the previous files, so the running server never
//! sees a half-written site.

use crate::context::HostContext;
use crate::probe::php_fpm_socket;
use crate::services::ServiceManager;
use crate::system::CommandSpec;
use crate::templates::{self, SiteTemplate, TlsPaths};
use crate::transaction::ConfigTransaction;
use sitekeeper_common::lock::FileLock;
use sitekeeper_common::{AppConfig, Backend, CertificateRecord, DomainRecord, Result, SiteError};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

const INDEX_FILES: [&str; 3] = ["index.html", "index.htm", "index.php"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionOutcome {
    pub site_file: PathBuf,
    pub enabled_link: PathBuf,
    pub created_document_root: bool,
}

pub fn site_file(config: &AppConfig, backend: Backend, domain: &str) -> PathBuf {
    config
        .backend_dirs(backend)
        .sites_available
        .join(format!("{}.conf", domain))
}

pub fn enabled_link(config: &AppConfig, backend: Backend, domain: &str) -> PathBuf {
    config
        .backend_dirs(backend)
        .sites_enabled
        .join(format!("{}.conf", domain))
}

pub fn config_test_command(backend: Backend) -> CommandSpec {
    match backend {
        Backend::Nginx => CommandSpec::new("nginx").arg("-t"),
        Backend::Apache => CommandSpec::new("apache2ctl").arg("configtest"),
    }
}

/// Writes the site config, creates the document root with a placeholder
/// page when it has no index, enables the site and reloads.
pub async fn create(
    ctx: &HostContext,
    domain: &str,
    backend: Backend,
    document_root: &Path,
    tls: Option<&TlsPaths>,
) -> Result<ProvisionOutcome> {
    let _lock = FileLock::acquire(&ctx.config.vhost_lock_path())?;
    let mut txn = ConfigTransaction::new();

    let created_document_root = !document_root.exists();
    txn.create_dir_all(document_root)?;
    if !has_index(document_root) {
        txn.write_file(
            &document_root.join("index.html"),
            templates::placeholder_page(domain).as_bytes(),
        )?;
    }
    let modules = stage_site(ctx, &mut txn, backend, domain, document_root, tls)?;
    validate_and_reload(ctx, backend, txn, &modules).await?;

    if created_document_root {
        set_owner(ctx, document_root).await;
    }
    info!(domain, %backend, tls = tls.is_some(), "virtual host provisioned");
    Ok(ProvisionOutcome {
        site_file: site_file(&ctx.config, backend, domain),
        enabled_link: enabled_link(&ctx.config, backend, domain),
        created_document_root,
    })
}

/// Disables and deletes the site config. `Ok(false)` when nothing was there.
/// For a backend that is not running the files are removed without a
/// config test or reload.
pub async fn remove(ctx: &HostContext, domain: &str, backend: Backend) -> Result<bool> {
    let _lock = FileLock::acquire(&ctx.config.vhost_lock_path())?;
    let mut txn = ConfigTransaction::new();

    let link = enabled_link(&ctx.config, backend, domain);
    match fs::symlink_metadata(&link) {
        Ok(meta) if meta.file_type().is_symlink() => txn.unlink(&link)?,
        Ok(_) => txn.remove_file(&link)?,
        Err(_) => {}
    }
    txn.remove_file(&site_file(&ctx.config, backend, domain))?;

    if txn.is_empty() {
        info!(domain, %backend, "no virtual host to remove");
        return Ok(false);
    }
    if ctx.web_server == Some(backend) {
        validate_and_reload(ctx, backend, txn, &[]).await?;
    } else {
        warn!(domain, %backend, "backend not active, removed config without reload");
        txn.commit();
    }
    info!(domain, %backend, "virtual host removed");
    Ok(true)
}

/// Re-renders the site with TLS pointing at `cert`.
pub async fn install_tls(ctx: &HostContext, record: &DomainRecord, cert: &CertificateRecord) -> Result<()> {
    let tls = TlsPaths {
        fullchain: cert.fullchain_path.clone(),
        key: cert.key_path.clone(),
    };
    rewrite(ctx, record, Some(&tls)).await?;
    info!(domain = %record.name, cert = %cert.fullchain_path.display(), "TLS enabled");
    Ok(())
}

/// Re-renders the site as plain HTTP.
pub async fn remove_tls(ctx: &HostContext, record: &DomainRecord) -> Result<()> {
    rewrite(ctx, record, None).await?;
    info!(domain = %record.name, "TLS disabled");
    Ok(())
}

async fn rewrite(ctx: &HostContext, record: &DomainRecord, tls: Option<&TlsPaths>) -> Result<()> {
    let _lock = FileLock::acquire(&ctx.config.vhost_lock_path())?;
    let mut txn = ConfigTransaction::new();
    let modules = stage_site(
        ctx,
        &mut txn,
        record.backend,
        &record.name,
        &record.document_root,
        tls,
    )?;
    validate_and_reload(ctx, record.backend, txn, &modules).await
}

/// Renders and enables the site; returns the Apache modules it needs.
fn stage_site(
    ctx: &HostContext,
    txn: &mut ConfigTransaction,
    backend: Backend,
    domain: &str,
    document_root: &Path,
    tls: Option<&TlsPaths>,
) -> Result<Vec<&'static str>> {
    let socket = ctx.php_fpm.as_deref().map(php_fpm_socket);
    let site = SiteTemplate {
        domain,
        document_root,
        php_socket: socket.as_deref(),
        tls,
    };
    let path = site_file(&ctx.config, backend, domain);
    txn.write_file(&path, templates::render(backend, &site).as_bytes())?;
    txn.symlink(&path, &enabled_link(&ctx.config, backend, domain))?;
    Ok(match backend {
        Backend::Apache => templates::apache_modules(&site),
        Backend::Nginx => Vec::new(),
    })
}

async fn validate_and_reload(
    ctx: &HostContext,
    backend: Backend,
    txn: ConfigTransaction,
    modules: &[&str],
) -> Result<()> {
    let enabled = modules_to_enable(&ctx.config, modules);
    if !enabled.is_empty() {
        ctx.runner
            .run_checked(&CommandSpec::new("a2enmod").arg("-q").args(enabled.iter().copied()))
            .await?;
    }

    let test = ctx.runner.run(&config_test_command(backend)).await?;
    if !test.success() {
        let output = test.stderr_tail(10);
        error!(%backend, %output, "config test rejected generated configuration, rolling back");
        txn.rollback();
        disable_modules(ctx, &enabled).await;
        return Err(SiteError::ConfigValidationFailed { backend, output });
    }

    let services = ServiceManager::new(ctx.runner.as_ref());
    if let Err(err) = services.reload(backend.service_name()).await {
        error!(%backend, error = %err, "reload failed, rolling back");
        txn.rollback();
        disable_modules(ctx, &enabled).await;
        if !matches!(err, SiteError::Interrupted)
            && let Err(again) = services.reload(backend.service_name()).await
        {
            warn!(%backend, error = %again, "reload after rollback failed");
        }
        return Err(err);
    }
    txn.commit();
    Ok(())
}

/// Modules without a `mods-enabled/<name>.load` entry yet.
fn modules_to_enable<'a>(config: &AppConfig, modules: &[&'a str]) -> Vec<&'a str> {
    let Some(mods_enabled) = config
        .apache
        .sites_enabled
        .parent()
        .map(|dir| dir.join("mods-enabled"))
    else {
        return modules.to_vec();
    };
    modules
        .iter()
        .copied()
        .filter(|module| !mods_enabled.join(format!("{}.load", module)).exists())
        .collect()
}

/// Best effort: a module left enabled is harmless to the running server.
async fn disable_modules(ctx: &HostContext, modules: &[&str]) {
    if modules.is_empty() {
        return;
    }
    let cmd = CommandSpec::new("a2dismod").arg("-q").args(modules.iter().copied());
    if let Err(err) = ctx.runner.run_checked(&cmd).await {
        warn!(modules = ?modules, error = %err, "could not disable modules enabled for the rolled back site");
    }
}

fn has_index(document_root: &Path) -> bool {
    INDEX_FILES
        .iter()
        .any(|name| document_root.join(name).exists())
}

async fn set_owner(ctx: &HostContext, path: &Path) {
    let owner = format!("{0}:{0}", ctx.config.web_user);
    let cmd = CommandSpec::new("chown")
        .arg("-R")
        .arg(owner)
        .arg(path.display().to_string());
    match ctx.runner.run(&cmd).await {
        Ok(out) if out.success() => {}
        Ok(out) => warn!(path = %path.display(), stderr = %out.stderr_tail(2), "chown failed"),
        Err(err) => warn!(path = %path.display(), error = %err, "chown failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::CommandOutput;
    use crate::test_utils::Sandbox;

    fn position(calls: &[String], prefix: &str) -> usize {
        calls
            .iter()
            .position(|c| c.starts_with(prefix))
            .unwrap_or_else(|| panic!("{prefix} not called: {calls:?}"))
    }

    #[tokio::test]
    async fn test_create_on_nginx_writes_enables_and_reloads_after_test() {
        let sandbox = Sandbox::new(Some(Backend::Nginx));
        let root = sandbox.ctx.config.default_document_root("example.test");

        let outcome = create(&sandbox.ctx, "example.test", Backend::Nginx, &root, None)
            .await
            .unwrap();

        assert!(outcome.created_document_root);
        let conf = fs::read_to_string(&outcome.site_file).unwrap();
        assert!(conf.contains("server_name example.test;"));
        assert_eq!(fs::read_link(&outcome.enabled_link).unwrap(), outcome.site_file);
        assert!(root.join("index.html").is_file());

        let calls = sandbox.runner.calls();
        assert!(position(&calls, "nginx -t") < position(&calls, "systemctl reload nginx"));
        assert_eq!(sandbox.runner.count("systemctl reload nginx"), 1);
        assert_eq!(sandbox.runner.count("chown -R www-data:www-data"), 1);
    }

    #[tokio::test]
    async fn test_failed_config_test_rolls_back_without_reload() {
        let sandbox = Sandbox::new(Some(Backend::Nginx));
        sandbox.runner.on(
            "nginx -t",
            CommandOutput::failed(1, "nginx: [emerg] unknown directive \"bogus\"\nnginx: configuration file test failed"),
        );
        let root = sandbox.ctx.config.default_document_root("example.test");

        let err = create(&sandbox.ctx, "example.test", Backend::Nginx, &root, None)
            .await
            .unwrap_err();

        match err {
            SiteError::ConfigValidationFailed { backend, output } => {
                assert_eq!(backend, Backend::Nginx);
                assert!(output.contains("test failed"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!sandbox.site_file(Backend::Nginx, "example.test").exists());
        assert!(fs::symlink_metadata(sandbox.enabled_link(Backend::Nginx, "example.test")).is_err());
        assert!(!root.exists());
        assert_eq!(sandbox.runner.count("systemctl reload"), 0);
    }

    #[tokio::test]
    async fn test_failed_config_test_restores_previous_site_file() {
        let sandbox = Sandbox::new(Some(Backend::Nginx));
        let root = sandbox.ctx.config.default_document_root("example.test");
        create(&sandbox.ctx, "example.test", Backend::Nginx, &root, None)
            .await
            .unwrap();
        let path = sandbox.site_file(Backend::Nginx, "example.test");
        let before = fs::read_to_string(&path).unwrap();

        sandbox.runner.on("nginx -t", CommandOutput::failed(1, "emerg"));
        let tls = TlsPaths {
            fullchain: "/x/fullchain.pem".into(),
            key: "/x/key.pem".into(),
        };
        assert!(
            create(&sandbox.ctx, "example.test", Backend::Nginx, &root, Some(&tls))
                .await
                .is_err()
        );
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
        assert!(root.join("index.html").is_file());
    }

    #[tokio::test]
    async fn test_failed_reload_rolls_back_and_reloads_previous_config() {
        let sandbox = Sandbox::new(Some(Backend::Nginx));
        sandbox
            .runner
            .on("systemctl reload nginx", CommandOutput::failed(1, "Job for nginx.service failed"));
        let root = sandbox.ctx.config.default_document_root("example.test");

        let err = create(&sandbox.ctx, "example.test", Backend::Nginx, &root, None)
            .await
            .unwrap_err();

        assert!(matches!(err, SiteError::ExternalCommandFailed { .. }));
        assert!(!sandbox.site_file(Backend::Nginx, "example.test").exists());
        assert_eq!(sandbox.runner.count("systemctl reload nginx"), 2);
    }

    #[tokio::test]
    async fn test_interrupt_during_config_test_rolls_back() {
        let sandbox = Sandbox::new(Some(Backend::Nginx));
        sandbox.runner.interrupt_on("nginx -t");
        let root = sandbox.ctx.config.default_document_root("example.test");

        let err = create(&sandbox.ctx, "example.test", Backend::Nginx, &root, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SiteError::Interrupted));
        assert!(!sandbox.site_file(Backend::Nginx, "example.test").exists());
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_existing_index_is_kept() {
        let sandbox = Sandbox::new(Some(Backend::Nginx));
        let root = sandbox.ctx.config.default_document_root("example.test");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("index.php"), "<?php echo 1;").unwrap();

        let outcome = create(&sandbox.ctx, "example.test", Backend::Nginx, &root, None)
            .await
            .unwrap();
        assert!(!outcome.created_document_root);
        assert!(!root.join("index.html").exists());
        assert_eq!(sandbox.runner.count("chown"), 0);
    }

    #[tokio::test]
    async fn test_apache_tls_enables_modules_before_config_test() {
        let sandbox = Sandbox::new(Some(Backend::Apache));
        let root = sandbox.ctx.config.default_document_root("example.test");
        let tls = TlsPaths {
            fullchain: "/c/fullchain.pem".into(),
            key: "/c/key.pem".into(),
        };

        create(&sandbox.ctx, "example.test", Backend::Apache, &root, Some(&tls))
            .await
            .unwrap();

        let calls = sandbox.runner.calls();
        assert!(calls.contains(&"a2enmod -q ssl rewrite".to_string()));
        assert!(position(&calls, "a2enmod") < position(&calls, "apache2ctl configtest"));
        assert!(position(&calls, "apache2ctl configtest") < position(&calls, "systemctl reload apache2"));
        let conf = fs::read_to_string(sandbox.site_file(Backend::Apache, "example.test")).unwrap();
        assert!(conf.contains("SSLCertificateFile /c/fullchain.pem"));
    }

    #[tokio::test]
    async fn test_rejected_apache_config_disables_modules_it_enabled() {
        let sandbox = Sandbox::new(Some(Backend::Apache));
        let mods_enabled = sandbox.dir.path().join("etc/apache2/mods-enabled");
        fs::create_dir_all(&mods_enabled).unwrap();
        fs::write(mods_enabled.join("rewrite.load"), "LoadModule rewrite_module").unwrap();
        sandbox
            .runner
            .on("apache2ctl configtest", CommandOutput::failed(1, "Syntax error"));
        let root = sandbox.ctx.config.default_document_root("example.test");
        let tls = TlsPaths {
            fullchain: "/c/fullchain.pem".into(),
            key: "/c/key.pem".into(),
        };

        let err = create(&sandbox.ctx, "example.test", Backend::Apache, &root, Some(&tls))
            .await
            .unwrap_err();

        assert!(matches!(err, SiteError::ConfigValidationFailed { .. }));
        let calls = sandbox.runner.calls();
        assert!(calls.contains(&"a2enmod -q ssl".to_string()), "{calls:?}");
        assert!(calls.contains(&"a2dismod -q ssl".to_string()), "{calls:?}");
        assert!(position(&calls, "apache2ctl configtest") < position(&calls, "a2dismod"));
        assert_eq!(sandbox.runner.count("systemctl reload"), 0);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let sandbox = Sandbox::new(Some(Backend::Nginx));
        let root = sandbox.ctx.config.default_document_root("example.test");
        create(&sandbox.ctx, "example.test", Backend::Nginx, &root, None)
            .await
            .unwrap();

        assert!(remove(&sandbox.ctx, "example.test", Backend::Nginx).await.unwrap());
        assert!(!sandbox.site_file(Backend::Nginx, "example.test").exists());
        assert!(fs::symlink_metadata(sandbox.enabled_link(Backend::Nginx, "example.test")).is_err());
        assert!(root.exists(), "document root is left alone");

        assert!(!remove(&sandbox.ctx, "example.test", Backend::Nginx).await.unwrap());
        assert_eq!(sandbox.runner.count("systemctl reload nginx"), 2);
    }

    #[tokio::test]
    async fn test_remove_on_inactive_backend_skips_reload() {
        let sandbox = Sandbox::new(Some(Backend::Nginx));
        let path = sandbox.site_file(Backend::Apache, "old.example.test");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "<VirtualHost *:80></VirtualHost>").unwrap();

        assert!(remove(&sandbox.ctx, "old.example.test", Backend::Apache).await.unwrap());
        assert!(!path.exists());
        assert_eq!(sandbox.runner.count("apache2ctl"), 0);
        assert_eq!(sandbox.runner.count("systemctl reload"), 0);
    }

    #[tokio::test]
    async fn test_install_and_remove_tls_rewrite_site() {
        let sandbox = Sandbox::new(Some(Backend::Nginx));
        let record = DomainRecord::new(
            "example.test",
            Backend::Nginx,
            sandbox.ctx.config.default_document_root("example.test"),
        );
        create(&sandbox.ctx, &record.name, record.backend, &record.document_root, None)
            .await
            .unwrap();
        let cert = CertificateRecord {
            domain: record.name.clone(),
            issuer: "CN=Test".to_string(),
            not_after: chrono::Utc::now() + chrono::Duration::days(60),
            cert_path: "/live/example.test/cert.pem".into(),
            key_path: "/live/example.test/key.pem".into(),
            fullchain_path: "/live/example.test/fullchain.pem".into(),
        };

        install_tls(&sandbox.ctx, &record, &cert).await.unwrap();
        let path = sandbox.site_file(Backend::Nginx, "example.test");
        let conf = fs::read_to_string(&path).unwrap();
        assert!(conf.contains("ssl_certificate /live/example.test/fullchain.pem;"));

        remove_tls(&sandbox.ctx, &record).await.unwrap();
        let conf = fs::read_to_string(&path).unwrap();
        assert!(!conf.contains("ssl_certificate"));
    }
}
