//! Built-in ACME client.
//!
//! Talks to the directory with instant-acme, answers HTTP-01 by writing the key
//! authorization under the domain's webroot, and stores the result in the same
//! layout certbot uses so the rest of the tool cannot tell them apart.

use crate::acme::{AcmeClient, RenewTarget, classify_failure};
use crate::certstore::CertificateStore;
use crate::interrupt::Interrupt;
use anyhow::{Result as AnyResult, anyhow};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus, RetryPolicy,
};
use sitekeeper_common::fsutil::{MODE_PRIVATE, MODE_PUBLIC, write_atomic};
use sitekeeper_common::{Result, SiteError};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const ACCOUNT_FILE: &str = "account.json";
const CHALLENGE_DIR: &str = ".well-known/acme-challenge";

pub struct NativeAcmeClient {
    directory_url: String,
    contact_email: Option<String>,
    storage_dir: PathBuf,
    store: CertificateStore,
    renew_before: Duration,
    interrupt: Interrupt,
}

impl NativeAcmeClient {
    pub fn new(
        directory_url: impl Into<String>,
        contact_email: Option<String>,
        storage_dir: impl Into<PathBuf>,
        store: CertificateStore,
        renew_before_days: u64,
        interrupt: Interrupt,
    ) -> Self {
        Self {
            directory_url: directory_url.into(),
            contact_email,
            storage_dir: storage_dir.into(),
            store,
            renew_before: Duration::days(renew_before_days as i64),
            interrupt,
        }
    }

    async fn load_or_create_account(&self) -> AnyResult<Account> {
        let path = self.storage_dir.join(ACCOUNT_FILE);
        if path.is_file() {
            let creds: AccountCredentials = serde_json::from_slice(&fs::read(&path)?)?;
            return Ok(Account::builder()?.from_credentials(creds).await?);
        }

        let email = self
            .contact_email
            .as_deref()
            .ok_or_else(|| anyhow!("an ACME contact email is required"))?;
        let contact = if email.starts_with("mailto:") {
            email.to_string()
        } else {
            format!("mailto:{}", email)
        };
        let (account, creds) = Account::builder()?
            .create(
                &NewAccount {
                    contact: &[contact.as_str()],
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                self.directory_url.clone(),
                None,
            )
            .await?;

        write_atomic(&path, &serde_json::to_vec_pretty(&creds)?, MODE_PRIVATE)?;
        info!(directory = %self.directory_url, "ACME account registered");
        Ok(account)
    }

    /// `None` when interrupted; challenge files are removed either way.
    async fn order_certificate(&self, domain: &str, webroot: &Path) -> AnyResult<Option<(String, String)>> {
        let mut written = Vec::new();
        let result = tokio::select! {
            biased;
            _ = self.interrupt.triggered() => Ok(None),
            result = async {
                let account = self.load_or_create_account().await?;
                order_certificate_inner(&account, domain, webroot, &mut written)
                    .await
                    .map(Some)
            } => result,
        };
        for path in written {
            if let Err(err) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %err, "cannot remove challenge file");
            }
        }
        result
    }

    fn store_certificate(&self, domain: &str, chain_pem: &str, key_pem: &str) -> std::io::Result<()> {
        let dir = self.store.domain_dir(domain);
        write_atomic(&dir.join("key.pem"), key_pem.as_bytes(), MODE_PRIVATE)?;
        write_atomic(&dir.join("fullchain.pem"), chain_pem.as_bytes(), MODE_PUBLIC)?;
        write_atomic(&dir.join("cert.pem"), leaf_certificate(chain_pem).as_bytes(), MODE_PUBLIC)?;
        Ok(())
    }
}

async fn order_certificate_inner(
    account: &Account,
    domain: &str,
    webroot: &Path,
    written: &mut Vec<PathBuf>,
) -> AnyResult<(String, String)> {
    let identifiers = [Identifier::Dns(domain.to_string())];
    let mut order = account.new_order(&NewOrder::new(&identifiers)).await?;

    let mut authorizations = order.authorizations();
    while let Some(result) = authorizations.next().await {
        let mut authz = result?;
        if authz.status == AuthorizationStatus::Valid {
            continue;
        }

        let mut challenge = authz
            .challenge(ChallengeType::Http01)
            .ok_or_else(|| anyhow!("missing HTTP-01 challenge"))?;

        let key_auth = challenge.key_authorization().as_str().to_string();
        let path = webroot.join(CHALLENGE_DIR).join(&challenge.token);
        write_atomic(&path, key_auth.as_bytes(), MODE_PUBLIC)?;
        written.push(path);
        challenge.set_ready().await?;
    }

    let status = order.poll_ready(&RetryPolicy::default()).await?;
    if status != OrderStatus::Ready {
        return Err(anyhow!("order not ready: {:?}", status));
    }

    let private_key_pem = order.finalize().await?;
    let cert_chain_pem = order.poll_certificate(&RetryPolicy::default()).await?;
    Ok((cert_chain_pem, private_key_pem))
}

/// First PEM block of a chain.
fn leaf_certificate(chain_pem: &str) -> String {
    const END: &str = "-----END CERTIFICATE-----";
    match chain_pem.find(END) {
        Some(idx) => format!("{}\n", &chain_pem[..idx + END.len()]),
        None => chain_pem.to_string(),
    }
}

#[async_trait]
impl AcmeClient for NativeAcmeClient {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn ensure_available(&self) -> Result<()> {
        if self.contact_email.is_none() && !self.storage_dir.join(ACCOUNT_FILE).is_file() {
            return Err(SiteError::MissingDependency(
                "SITEKEEPER_ACME_CONTACT_EMAIL is required for the native ACME client".to_string(),
            ));
        }
        Ok(())
    }

    async fn issue(&self, domain: &str, webroot: &Path) -> Result<()> {
        match self.order_certificate(domain, webroot).await {
            Ok(Some((chain, key))) => {
                self.store_certificate(domain, &chain, &key)?;
                info!(domain, "certificate issued");
                Ok(())
            }
            Ok(None) => {
                warn!(domain, "ACME order interrupted");
                Err(SiteError::Interrupted)
            }
            Err(err) => {
                let failure = classify_failure(&format!("{:#}", err));
                warn!(domain, category = failure.category(), error = %err, "ACME order failed");
                Err(SiteError::Issuance(failure))
            }
        }
    }

    async fn renew_all(&self, targets: &[RenewTarget]) -> Result<()> {
        let now = Utc::now();
        let mut failed = Vec::new();
        for target in targets {
            if let Some(expiry) = target.not_after {
                let renew_at = expiry - self.renew_before;
                if now < renew_at {
                    continue;
                }
            }
            if let Err(err) = self.issue(&target.domain, &target.webroot).await {
                if matches!(err, SiteError::Interrupted) {
                    return Err(err);
                }
                failed.push(format!("{}: {}", target.domain, err));
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("renewal failed for {}", failed.join("; ")).into())
        }
    }

    async fn delete(&self, domain: &str) -> Result<()> {
        let dir = self.store.domain_dir(domain);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(domain, "certificate material removed");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
