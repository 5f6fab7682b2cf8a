//! Certificate lifecycle.
//!
//! A record's SSL state only moves to `active` once a certificate has been
//! obtained, read back from disk and wired into the site config. `pending`
//! exists for the duration of an issuance attempt and is never persisted;
//! `expired` is observed from the certificate, never set by hand.

use crate::acme::RenewTarget;
use crate::context::HostContext;
use crate::preflight::{self, PreflightReport};
use crate::services::ServiceManager;
use crate::vhost;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sitekeeper_common::{
    Backend, CertificateRecord, DomainRecord, IssuanceFailure, Result, SiteError, SslState,
    validate_domain,
};
use std::collections::{BTreeSet, HashMap};
use tracing::{error, info, warn};

/// Operator confirmation for advisory warnings.
pub trait Confirm: Send + Sync {
    fn confirm(&self, prompt: &str) -> bool;
}

#[derive(Debug, Clone, Serialize)]
pub struct SslStatus {
    pub record: DomainRecord,
    pub certificate: Option<CertificateRecord>,
    /// State implied by what is on disk now.
    pub observed: SslState,
    /// The registry disagreed with `observed` and was updated.
    pub reconciled: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RenewReport {
    pub checked: usize,
    pub renewed: Vec<String>,
    pub reloaded: Vec<Backend>,
    pub state_changes: Vec<StateChange>,
    /// Error reported by the ACME client; other certificates may still have renewed.
    pub client_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub domain: String,
    pub from: SslState,
    pub to: SslState,
}

fn ensure_owner(ctx: &HostContext, record: &DomainRecord) -> Result<Backend> {
    let active = ctx.active_backend()?;
    if record.backend != active {
        return Err(SiteError::BackendMismatch {
            domain: record.name.clone(),
            owner: record.backend,
            active,
        });
    }
    Ok(active)
}

fn log_transition(domain: &str, from: SslState, to: SslState) {
    info!(domain, %from, %to, "ssl state transition");
}

/// Obtains and installs a certificate for a registered domain.
///
/// Pre-flight warnings are put to `confirm`; declining returns `Aborted`
/// before any ACME traffic. An issuance failure leaves the registry as it was.
pub async fn add_ssl(ctx: &HostContext, name: &str, confirm: &dyn Confirm) -> Result<DomainRecord> {
    let name = validate_domain(name)?;
    let registry = ctx.registry();
    let record = registry.get(&name)?;
    ensure_owner(ctx, &record)?;
    ctx.acme.ensure_available().await?;

    let report = preflight::run(ctx, &name).await?;
    if !report.passed() && !confirm.confirm(&confirmation_prompt(&report)) {
        info!(domain = %name, "issuance declined after pre-flight warnings");
        return Err(SiteError::aborted(format!(
            "certificate request for {} declined",
            name
        )));
    }

    // Ctrl-C while the question was open.
    ctx.interrupt.check()?;

    log_transition(&name, record.ssl_state, SslState::Pending);
    if let Err(err) = ctx.acme.issue(&name, &record.document_root).await {
        log_transition(&name, SslState::Pending, record.ssl_state);
        return Err(err);
    }

    let cert = match ctx.cert_store().inspect(&name)? {
        Some(cert) => cert,
        None => {
            log_transition(&name, SslState::Pending, record.ssl_state);
            return Err(SiteError::Issuance(IssuanceFailure::IssuanceFailed(format!(
                "{} reported success but no certificate was found under {}",
                ctx.acme.name(),
                ctx.cert_store().domain_dir(&name).display()
            ))));
        }
    };

    if let Err(err) = vhost::install_tls(ctx, &record, &cert).await {
        error!(
            domain = %name,
            cert = %cert.cert_path.display(),
            error = %err,
            "certificate issued but TLS configuration failed; certificate kept on disk"
        );
        log_transition(&name, SslState::Pending, record.ssl_state);
        return Err(err);
    }

    let updated = record.with_ssl_state(cert.classify(Utc::now()));
    registry.upsert(&updated)?;
    log_transition(&name, SslState::Pending, updated.ssl_state);
    Ok(updated)
}

fn confirmation_prompt(report: &PreflightReport) -> String {
    let mut prompt = format!("Pre-flight checks for {} reported:\n", report.domain);
    for warning in &report.warnings {
        prompt.push_str("  - ");
        prompt.push_str(warning);
        prompt.push('\n');
    }
    prompt.push_str("Request a certificate anyway?");
    prompt
}

/// Renews certificates for every active or expired record, reloads each
/// affected backend once, and records observed state changes.
pub async fn renew(ctx: &HostContext) -> Result<RenewReport> {
    let registry = ctx.registry();
    let store = ctx.cert_store();
    let records: Vec<DomainRecord> = registry
        .list()?
        .filter(|r| matches!(r.ssl_state, SslState::Active | SslState::Expired))
        .collect();

    let mut report = RenewReport {
        checked: records.len(),
        ..Default::default()
    };
    if records.is_empty() {
        info!("no certificates to renew");
        return Ok(report);
    }

    let before: HashMap<String, Option<DateTime<Utc>>> = records
        .iter()
        .map(|r| (r.name.clone(), inspect_quietly(ctx, &r.name).map(|c| c.not_after)))
        .collect();
    let targets: Vec<RenewTarget> = records
        .iter()
        .map(|r| RenewTarget {
            domain: r.name.clone(),
            webroot: r.document_root.clone(),
            not_after: before.get(&r.name).copied().flatten(),
        })
        .collect();

    match ctx.acme.renew_all(&targets).await {
        Ok(()) => {}
        Err(SiteError::Interrupted) => return Err(SiteError::Interrupted),
        Err(err) => {
            warn!(error = %err, "renewal reported errors; checking which certificates changed");
            report.client_error = Some(err.to_string());
        }
    }

    let now = Utc::now();
    let mut backends = BTreeSet::new();
    for record in records {
        let after = match store.inspect(&record.name) {
            Ok(cert) => cert,
            Err(err) => {
                warn!(domain = %record.name, error = %err, "cannot read certificate after renewal");
                None
            }
        };
        let previous = before.get(&record.name).copied().flatten();
        if let Some(cert) = &after
            && Some(cert.not_after) != previous
        {
            info!(domain = %record.name, not_after = %cert.not_after, "certificate renewed");
            report.renewed.push(record.name.clone());
            backends.insert(record.backend);
        }

        let observed = after.map(|c| c.classify(now)).unwrap_or(SslState::None);
        if observed != record.ssl_state {
            log_transition(&record.name, record.ssl_state, observed);
            registry.upsert(&record.with_ssl_state(observed))?;
            report.state_changes.push(StateChange {
                domain: record.name.clone(),
                from: record.ssl_state,
                to: observed,
            });
        }
    }

    let services = ServiceManager::new(ctx.runner.as_ref());
    for backend in backends {
        if ctx.web_server != Some(backend) {
            warn!(%backend, "renewed certificates belong to an inactive backend, not reloading");
            continue;
        }
        services.reload(backend.service_name()).await?;
        report.reloaded.push(backend);
    }

    info!(
        checked = report.checked,
        renewed = report.renewed.len(),
        reloads = report.reloaded.len(),
        "renewal finished"
    );
    Ok(report)
}

fn inspect_quietly(ctx: &HostContext, name: &str) -> Option<CertificateRecord> {
    match ctx.cert_store().inspect(name) {
        Ok(cert) => cert,
        Err(err) => {
            warn!(domain = name, error = %err, "cannot read certificate");
            None
        }
    }
}

/// Compares a record's SSL state with the certificate on disk and corrects
/// the registry. A certificate alone never promotes a `none` record: the
/// site config may not reference it.
pub async fn reconcile(ctx: &HostContext, name: &str) -> Result<SslStatus> {
    let name = validate_domain(name)?;
    let record = ctx.registry().get(&name)?;
    reconcile_record(ctx, record)
}

pub async fn reconcile_all(ctx: &HostContext) -> Result<Vec<SslStatus>> {
    let records: Vec<DomainRecord> = ctx.registry().list()?.collect();
    records
        .into_iter()
        .map(|record| reconcile_record(ctx, record))
        .collect()
}

fn reconcile_record(ctx: &HostContext, record: DomainRecord) -> Result<SslStatus> {
    let certificate = ctx.cert_store().inspect(&record.name)?;
    let observed = match record.ssl_state {
        SslState::None | SslState::Pending => SslState::None,
        SslState::Active | SslState::Expired => certificate
            .as_ref()
            .map(|c| c.classify(Utc::now()))
            .unwrap_or(SslState::None),
    };

    if observed == record.ssl_state {
        return Ok(SslStatus {
            record,
            certificate,
            observed,
            reconciled: false,
        });
    }

    log_transition(&record.name, record.ssl_state, observed);
    let updated = record.with_ssl_state(observed);
    ctx.registry().upsert(&updated)?;
    Ok(SslStatus {
        record: updated,
        certificate,
        observed,
        reconciled: true,
    })
}

/// Drops TLS from the site config, deletes the certificate and marks the
/// record `none`.
pub async fn remove_ssl(ctx: &HostContext, name: &str) -> Result<DomainRecord> {
    let name = validate_domain(name)?;
    let registry = ctx.registry();
    let record = registry.get(&name)?;
    ensure_owner(ctx, &record)?;

    vhost::remove_tls(ctx, &record).await?;
    if let Err(err) = ctx.acme.delete(&name).await {
        if matches!(err, SiteError::Interrupted) {
            return Err(err);
        }
        warn!(domain = %name, error = %err, "certificate deletion failed; TLS already disabled");
    }

    let updated = record.with_ssl_state(SslState::None);
    registry.upsert(&updated)?;
    log_transition(&name, record.ssl_state, SslState::None);
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::CommandOutput;
    use crate::test_utils::{FakeConfirm, Sandbox, write_test_certificate};
    use std::fs;

    async fn registered(sandbox: &Sandbox, name: &str) -> DomainRecord {
        crate::domains::add(&sandbox.ctx, name, None).await.unwrap()
    }

    #[tokio::test]
    async fn test_add_ssl_success_installs_tls_and_marks_active() {
        let sandbox = Sandbox::new(Some(Backend::Nginx));
        registered(&sandbox, "example.test").await;
        sandbox.resolve_here("example.test");
        let confirm = FakeConfirm::new(false);

        let record = add_ssl(&sandbox.ctx, "example.test", &confirm).await.unwrap();

        assert_eq!(record.ssl_state, SslState::Active);
        assert!(confirm.prompts().is_empty(), "clean pre-flight asks nothing");
        assert_eq!(sandbox.registry().get("example.test").unwrap().ssl_state, SslState::Active);
        let conf = fs::read_to_string(sandbox.site_file(Backend::Nginx, "example.test")).unwrap();
        assert!(conf.contains("listen 443 ssl;"));
        assert!(conf.contains("example.test/fullchain.pem;"));
        assert_eq!(sandbox.acme.calls(), vec!["issue example.test"]);
    }

    #[tokio::test]
    async fn test_declined_preflight_makes_no_acme_call() {
        let sandbox = Sandbox::new(Some(Backend::Nginx));
        registered(&sandbox, "example.test").await;
        let confirm = FakeConfirm::new(false);

        let err = add_ssl(&sandbox.ctx, "example.test", &confirm).await.unwrap_err();

        assert!(matches!(err, SiteError::Aborted(_)));
        assert_eq!(confirm.prompts().len(), 1);
        assert!(confirm.prompts()[0].contains("no A record"));
        assert!(sandbox.acme.calls().is_empty());
        assert_eq!(sandbox.registry().get("example.test").unwrap().ssl_state, SslState::None);
    }

    /// Stands in for an operator who hits Ctrl-C at the confirmation prompt.
    struct InterruptedAtPrompt(crate::Interrupt);

    impl Confirm for InterruptedAtPrompt {
        fn confirm(&self, _prompt: &str) -> bool {
            self.0.trigger();
            true
        }
    }

    #[tokio::test]
    async fn test_interrupt_during_preflight_makes_no_acme_call() {
        let sandbox = Sandbox::new(Some(Backend::Nginx));
        let before = registered(&sandbox, "example.test").await;
        sandbox.resolve_here("example.test");
        sandbox.ctx.interrupt.trigger();

        let err = add_ssl(&sandbox.ctx, "example.test", &FakeConfirm::new(true))
            .await
            .unwrap_err();

        assert!(matches!(err, SiteError::Interrupted));
        assert!(sandbox.acme.calls().is_empty());
        assert_eq!(sandbox.registry().get("example.test").unwrap(), before);
    }

    #[tokio::test]
    async fn test_interrupt_at_confirmation_stops_before_issuance() {
        let sandbox = Sandbox::new(Some(Backend::Nginx));
        let before = registered(&sandbox, "example.test").await;
        let confirm = InterruptedAtPrompt(sandbox.ctx.interrupt.clone());

        let err = add_ssl(&sandbox.ctx, "example.test", &confirm).await.unwrap_err();

        assert!(matches!(err, SiteError::Interrupted));
        assert!(sandbox.acme.calls().is_empty());
        assert_eq!(sandbox.registry().get("example.test").unwrap(), before);
        let conf = fs::read_to_string(sandbox.site_file(Backend::Nginx, "example.test")).unwrap();
        assert!(!conf.contains("listen 443"));
    }

    #[tokio::test]
    async fn test_accepted_warning_proceeds() {
        let sandbox = Sandbox::new(Some(Backend::Nginx));
        registered(&sandbox, "example.test").await;
        let confirm = FakeConfirm::new(true);

        let record = add_ssl(&sandbox.ctx, "example.test", &confirm).await.unwrap();
        assert_eq!(record.ssl_state, SslState::Active);
        assert_eq!(confirm.prompts().len(), 1);
    }

    #[tokio::test]
    async fn test_issuance_failure_leaves_record_unchanged() {
        let sandbox = Sandbox::new(Some(Backend::Nginx));
        let before = registered(&sandbox, "example.test").await;
        sandbox.resolve_here("example.test");
        sandbox
            .acme
            .fail_with(IssuanceFailure::RateLimited("too many certificates".to_string()));
        let conf_before = fs::read_to_string(sandbox.site_file(Backend::Nginx, "example.test")).unwrap();

        let err = add_ssl(&sandbox.ctx, "example.test", &FakeConfirm::new(true))
            .await
            .unwrap_err();

        match err {
            SiteError::Issuance(failure) => assert_eq!(failure.category(), "rate-limited"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(sandbox.registry().get("example.test").unwrap(), before);
        let conf_after = fs::read_to_string(sandbox.site_file(Backend::Nginx, "example.test")).unwrap();
        assert_eq!(conf_before, conf_after);
    }

    #[tokio::test]
    async fn test_tls_config_rejected_keeps_record_and_certificate() {
        let sandbox = Sandbox::new(Some(Backend::Nginx));
        registered(&sandbox, "example.test").await;
        sandbox.resolve_here("example.test");
        sandbox.runner.on("nginx -t", CommandOutput::failed(1, "ssl_certificate: BIO_new_file() failed"));

        let err = add_ssl(&sandbox.ctx, "example.test", &FakeConfirm::new(true))
            .await
            .unwrap_err();

        assert!(matches!(err, SiteError::ConfigValidationFailed { .. }));
        assert_eq!(sandbox.registry().get("example.test").unwrap().ssl_state, SslState::None);
        assert!(sandbox.ctx.cert_store().exists("example.test"));
    }

    #[tokio::test]
    async fn test_add_ssl_requires_owning_backend() {
        let sandbox = Sandbox::new(Some(Backend::Nginx));
        sandbox
            .registry()
            .upsert(&DomainRecord::new("example.test", Backend::Apache, "/var/www/example.test"))
            .unwrap();

        let err = add_ssl(&sandbox.ctx, "example.test", &FakeConfirm::new(true))
            .await
            .unwrap_err();
        assert!(matches!(err, SiteError::BackendMismatch { .. }));
        assert!(sandbox.acme.calls().is_empty());

        assert!(matches!(
            add_ssl(&sandbox.ctx, "missing.example.test", &FakeConfirm::new(true)).await,
            Err(SiteError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_renew_reloads_each_backend_once() {
        let sandbox = Sandbox::new(Some(Backend::Nginx));
        for name in ["a.example.test", "b.example.test", "c.example.test"] {
            let record = registered(&sandbox, name).await;
            registry_set_active(&sandbox, &record, 10);
        }
        let reloads_before = sandbox.runner.count("systemctl reload nginx");

        let report = renew(&sandbox.ctx).await.unwrap();

        assert_eq!(report.checked, 3);
        assert_eq!(report.renewed.len(), 3);
        assert_eq!(report.reloaded, vec![Backend::Nginx]);
        assert_eq!(sandbox.runner.count("systemctl reload nginx") - reloads_before, 1);
        assert!(report.state_changes.is_empty());
    }

    #[tokio::test]
    async fn test_renew_with_nothing_active_does_nothing() {
        let sandbox = Sandbox::new(Some(Backend::Nginx));
        registered(&sandbox, "a.example.test").await;
        let report = renew(&sandbox.ctx).await.unwrap();
        assert_eq!(report.checked, 0);
        assert!(sandbox.acme.calls().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_observes_expiry_and_missing_material() {
        let sandbox = Sandbox::new(Some(Backend::Nginx));
        let expired = registered(&sandbox, "old.example.test").await;
        registry_set_active(&sandbox, &expired, -2);
        let gone = registered(&sandbox, "gone.example.test").await;
        sandbox
            .registry()
            .upsert(&gone.with_ssl_state(SslState::Active))
            .unwrap();
        let plain = registered(&sandbox, "plain.example.test").await;
        write_test_certificate(
            &sandbox.ctx.cert_store().domain_dir(&plain.name),
            &plain.name,
            30,
        );

        let statuses = reconcile_all(&sandbox.ctx).await.unwrap();
        let by_name = |n: &str| statuses.iter().find(|s| s.record.name == n).unwrap();

        assert_eq!(by_name("old.example.test").observed, SslState::Expired);
        assert!(by_name("old.example.test").reconciled);
        assert_eq!(by_name("gone.example.test").observed, SslState::None);
        assert_eq!(by_name("plain.example.test").observed, SslState::None);
        assert!(!by_name("plain.example.test").reconciled);

        let registry = sandbox.registry();
        assert_eq!(registry.get("old.example.test").unwrap().ssl_state, SslState::Expired);
        assert_eq!(registry.get("gone.example.test").unwrap().ssl_state, SslState::None);
    }

    #[tokio::test]
    async fn test_remove_ssl_disables_tls_and_deletes_certificate() {
        let sandbox = Sandbox::new(Some(Backend::Nginx));
        registered(&sandbox, "example.test").await;
        sandbox.resolve_here("example.test");
        add_ssl(&sandbox.ctx, "example.test", &FakeConfirm::new(true))
            .await
            .unwrap();

        let record = remove_ssl(&sandbox.ctx, "example.test").await.unwrap();

        assert_eq!(record.ssl_state, SslState::None);
        assert!(!sandbox.ctx.cert_store().exists("example.test"));
        let conf = fs::read_to_string(sandbox.site_file(Backend::Nginx, "example.test")).unwrap();
        assert!(!conf.contains("listen 443"));
        assert!(sandbox.acme.calls().contains(&"delete example.test".to_string()));
    }

    /// Puts a certificate expiring in `days` on disk and marks the record active.
    fn registry_set_active(sandbox: &Sandbox, record: &DomainRecord, days: i64) {
        write_test_certificate(
            &sandbox.ctx.cert_store().domain_dir(&record.name),
            &record.name,
            days,
        );
        sandbox
            .registry()
            .upsert(&record.with_ssl_state(SslState::Active))
            .unwrap();
    }
}
