use crate::context::HostContext;
use crate::lifecycle::{self, SslStatus};
use crate::templates::TlsPaths;
use crate::vhost;
use chrono::Utc;
use sitekeeper_common::{
    DomainRecord, Result, SiteError, SslState, validate_document_root, validate_domain,
};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveOptions {
    pub purge_certificate: bool,
    pub purge_document_root: bool,
}

/// Provisions `name` on the active backend and registers it.
///
/// Re-adding a registered name re-renders its site (with TLS while the
/// certificate is still on disk), keeps `created_at` and, unless a new root
/// is given, the recorded document root. A site owned by the other backend
/// moves to the active one.
pub async fn add(ctx: &HostContext, name: &str, document_root: Option<&Path>) -> Result<DomainRecord> {
    let name = validate_domain(name)?;
    let registry = ctx.registry();
    let existing = match registry.get(&name) {
        Ok(record) => Some(record),
        Err(SiteError::NotFound(_)) => None,
        Err(err) => return Err(err),
    };

    // Re-adding without a root keeps the recorded one.
    let document_root = match (document_root, &existing) {
        (Some(root), _) => root.to_path_buf(),
        (None, Some(record)) => record.document_root.clone(),
        (None, None) => ctx.config.default_document_root(&name),
    };
    validate_document_root(&document_root)?;
    let backend = ctx.active_backend()?;

    let certificate = match &existing {
        Some(record) if matches!(record.ssl_state, SslState::Active | SslState::Expired) => {
            ctx.cert_store().inspect(&name)?
        }
        _ => None,
    };
    let tls = certificate.as_ref().map(|cert| TlsPaths {
        fullchain: cert.fullchain_path.clone(),
        key: cert.key_path.clone(),
    });

    vhost::create(ctx, &name, backend, &document_root, tls.as_ref()).await?;

    let record = match existing {
        Some(mut record) => {
            if record.backend != backend {
                info!(domain = %name, from = %record.backend, to = %backend, "moving site to active backend");
                vhost::remove(ctx, &name, record.backend).await?;
                record.backend = backend;
            }
            record.document_root = document_root;
            record.ssl_state = certificate
                .map(|cert| cert.classify(Utc::now()))
                .unwrap_or(SslState::None);
            record.touch();
            record
        }
        None => DomainRecord::new(name, backend, document_root),
    };
    registry.upsert(&record)?;
    info!(domain = %record.name, %backend, ssl = %record.ssl_state, "domain added");
    Ok(record)
}

/// Removes the site from its backend and the registry.
pub async fn remove(ctx: &HostContext, name: &str, options: RemoveOptions) -> Result<DomainRecord> {
    let name = validate_domain(name)?;
    let registry = ctx.registry();
    let record = registry.get(&name)?;

    vhost::remove(ctx, &name, record.backend).await?;

    if options.purge_certificate && ctx.cert_store().exists(&name) {
        if let Err(err) = ctx.acme.delete(&name).await {
            if matches!(err, SiteError::Interrupted) {
                return Err(err);
            }
            warn!(domain = %name, error = %err, "certificate deletion failed");
        }
    }

    registry.remove(&name)?;

    if options.purge_document_root {
        purge_document_root(ctx, &record);
    }
    info!(domain = %name, backend = %record.backend, "domain removed");
    Ok(record)
}

/// Only roots under the configured web root are deleted.
fn purge_document_root(ctx: &HostContext, record: &DomainRecord) {
    let root = &record.document_root;
    if !root.starts_with(&ctx.config.web_root) || root == &ctx.config.web_root {
        warn!(
            domain = %record.name,
            root = %root.display(),
            web_root = %ctx.config.web_root.display(),
            "document root is outside the web root, left in place"
        );
        return;
    }
    match fs::remove_dir_all(root) {
        Ok(()) => info!(domain = %record.name, root = %root.display(), "document root deleted"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(root = %root.display(), error = %err, "cannot delete document root"),
    }
}

pub fn list(ctx: &HostContext) -> Result<Vec<DomainRecord>> {
    let mut records: Vec<DomainRecord> = ctx.registry().list()?.collect();
    records.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(records)
}

pub async fn status(ctx: &HostContext, name: &str) -> Result<SslStatus> {
    lifecycle::reconcile(ctx, name).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::CommandOutput;
    use crate::test_utils::{FakeConfirm, Sandbox, write_test_certificate};
    use sitekeeper_common::Backend;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_add_on_nginx_registers_and_serves_placeholder() {
        let sandbox = Sandbox::new(Some(Backend::Nginx));

        let record = add(&sandbox.ctx, "example.test", None).await.unwrap();

        assert_eq!(record.backend, Backend::Nginx);
        assert_eq!(record.ssl_state, SslState::None);
        assert_eq!(
            record.document_root,
            sandbox.ctx.config.web_root.join("example.test")
        );
        assert!(record.document_root.join("index.html").is_file());
        assert!(sandbox.site_file(Backend::Nginx, "example.test").is_file());
        assert_eq!(sandbox.registry().get("example.test").unwrap(), record);
        assert_eq!(sandbox.runner.count("systemctl reload nginx"), 1);
    }

    #[tokio::test]
    async fn test_re_add_keeps_one_record_and_created_at() {
        let sandbox = Sandbox::new(Some(Backend::Nginx));
        let first = add(&sandbox.ctx, "example.test", None).await.unwrap();
        let second = add(&sandbox.ctx, "Example.Test", None).await.unwrap();

        assert_eq!(sandbox.registry().list().unwrap().count(), 1);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(sandbox.runner.count("nginx -t"), 2, "second add re-renders the site");
    }

    #[tokio::test]
    async fn test_re_add_without_root_keeps_recorded_root() {
        let sandbox = Sandbox::new(Some(Backend::Nginx));
        let custom = sandbox.dir.path().join("srv/shop");
        sandbox
            .registry()
            .upsert(&DomainRecord::new("shop.example.test", Backend::Nginx, custom.clone()))
            .unwrap();

        let record = add(&sandbox.ctx, "shop.example.test", None).await.unwrap();
        assert_eq!(record.document_root, custom);
        let conf = fs::read_to_string(sandbox.site_file(Backend::Nginx, "shop.example.test")).unwrap();
        assert!(conf.contains(&custom.display().to_string()));

        let moved = sandbox.dir.path().join("srv/shop-v2");
        let record = add(&sandbox.ctx, "shop.example.test", Some(&moved)).await.unwrap();
        assert_eq!(record.document_root, moved);
    }

    #[tokio::test]
    async fn test_re_add_keeps_tls_while_certificate_is_active() {
        let sandbox = Sandbox::new(Some(Backend::Nginx));
        add(&sandbox.ctx, "example.test", None).await.unwrap();
        sandbox.resolve_here("example.test");
        lifecycle::add_ssl(&sandbox.ctx, "example.test", &FakeConfirm::new(true))
            .await
            .unwrap();

        let record = add(&sandbox.ctx, "example.test", None).await.unwrap();

        assert_eq!(record.ssl_state, SslState::Active);
        let conf = fs::read_to_string(sandbox.site_file(Backend::Nginx, "example.test")).unwrap();
        assert!(conf.contains("listen 443 ssl;"));
    }

    #[tokio::test]
    async fn test_validation_happens_before_side_effects() {
        let sandbox = Sandbox::new(Some(Backend::Nginx));
        for bad in ["localhost", "192.168.1.1", "nodot", "bad_label.example.com"] {
            let err = add(&sandbox.ctx, bad, None).await.unwrap_err();
            assert!(matches!(err, SiteError::Validation(_)), "{bad}: {err:?}");
        }
        let err = add(&sandbox.ctx, "example.test", Some(Path::new("relative/root")))
            .await
            .unwrap_err();
        assert!(matches!(err, SiteError::Validation(_)));

        assert!(sandbox.runner.calls().is_empty());
        assert!(!sandbox.registry().path().exists());
    }

    #[tokio::test]
    async fn test_add_without_active_backend() {
        let sandbox = Sandbox::new(None);
        assert!(matches!(
            add(&sandbox.ctx, "example.test", None).await,
            Err(SiteError::NoActiveBackend)
        ));
    }

    #[tokio::test]
    async fn test_config_rejection_leaves_registry_untouched() {
        let sandbox = Sandbox::new(Some(Backend::Nginx));
        sandbox.runner.on("nginx -t", CommandOutput::failed(1, "emerg"));

        let err = add(&sandbox.ctx, "example.test", None).await.unwrap_err();
        assert!(matches!(err, SiteError::ConfigValidationFailed { .. }));
        assert!(matches!(
            sandbox.registry().get("example.test"),
            Err(SiteError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_re_add_moves_site_from_inactive_backend() {
        let sandbox = Sandbox::new(Some(Backend::Nginx));
        let old_site = sandbox.site_file(Backend::Apache, "example.test");
        fs::create_dir_all(old_site.parent().unwrap()).unwrap();
        fs::write(&old_site, "<VirtualHost *:80></VirtualHost>").unwrap();
        sandbox
            .registry()
            .upsert(&DomainRecord::new(
                "example.test",
                Backend::Apache,
                sandbox.ctx.config.default_document_root("example.test"),
            ))
            .unwrap();

        let record = add(&sandbox.ctx, "example.test", None).await.unwrap();
        assert_eq!(record.backend, Backend::Nginx);
        assert!(!old_site.exists());
        assert!(sandbox.site_file(Backend::Nginx, "example.test").is_file());
    }

    #[tokio::test]
    async fn test_remove_then_get_is_not_found() {
        let sandbox = Sandbox::new(Some(Backend::Nginx));
        add(&sandbox.ctx, "example.test", None).await.unwrap();

        let removed = remove(&sandbox.ctx, "example.test", RemoveOptions::default())
            .await
            .unwrap();
        assert_eq!(removed.name, "example.test");
        assert!(removed.document_root.exists(), "content is kept without purge");
        assert!(matches!(
            sandbox.registry().get("example.test"),
            Err(SiteError::NotFound(_))
        ));
        assert!(matches!(
            remove(&sandbox.ctx, "example.test", RemoveOptions::default()).await,
            Err(SiteError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_with_purge() {
        let sandbox = Sandbox::new(Some(Backend::Nginx));
        let record = add(&sandbox.ctx, "example.test", None).await.unwrap();
        write_test_certificate(
            &sandbox.ctx.cert_store().domain_dir("example.test"),
            "example.test",
            30,
        );

        remove(
            &sandbox.ctx,
            "example.test",
            RemoveOptions {
                purge_certificate: true,
                purge_document_root: true,
            },
        )
        .await
        .unwrap();

        assert!(!record.document_root.exists());
        assert!(!sandbox.ctx.cert_store().exists("example.test"));
        assert_eq!(sandbox.acme.calls(), vec!["delete example.test"]);
    }

    #[tokio::test]
    async fn test_purge_refuses_roots_outside_web_root() {
        let sandbox = Sandbox::new(Some(Backend::Nginx));
        let outside: PathBuf = sandbox.dir.path().join("srv/custom");
        add(&sandbox.ctx, "example.test", Some(&outside)).await.unwrap();

        remove(
            &sandbox.ctx,
            "example.test",
            RemoveOptions {
                purge_certificate: false,
                purge_document_root: true,
            },
        )
        .await
        .unwrap();
        assert!(outside.exists());
    }

    #[tokio::test]
    async fn test_list_is_sorted() {
        let sandbox = Sandbox::new(Some(Backend::Nginx));
        for name in ["b.example.test", "a.example.test"] {
            add(&sandbox.ctx, name, None).await.unwrap();
        }
        let names: Vec<String> = list(&sandbox.ctx).unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a.example.test", "b.example.test"]);
    }

    #[tokio::test]
    async fn test_status_reports_certificate() {
        let sandbox = Sandbox::new(Some(Backend::Nginx));
        add(&sandbox.ctx, "example.test", None).await.unwrap();
        sandbox.resolve_here("example.test");
        lifecycle::add_ssl(&sandbox.ctx, "example.test", &FakeConfirm::new(true))
            .await
            .unwrap();

        let status = status(&sandbox.ctx, "example.test").await.unwrap();
        assert_eq!(status.observed, SslState::Active);
        assert!(!status.reconciled);
        assert!(status.certificate.unwrap().days_remaining(Utc::now()) > 80);
    }
}
