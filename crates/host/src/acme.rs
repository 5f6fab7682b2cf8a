//! ACME client seam and the certbot-backed implementation.

use crate::services::PackageManager;
use crate::system::{CommandRunner, CommandSpec};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use sitekeeper_common::{IssuanceFailure, Result, SiteError};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewTarget {
    pub domain: String,
    pub webroot: PathBuf,
    pub not_after: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait AcmeClient: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fails with `MissingDependency` when the client cannot run on this host.
    async fn ensure_available(&self) -> Result<()>;

    /// Obtains a certificate for `domain` through an HTTP-01 webroot challenge.
    /// Failures are reported as `SiteError::Issuance`.
    async fn issue(&self, domain: &str, webroot: &Path) -> Result<()>;

    /// Renews whatever is due among `targets`.
    async fn renew_all(&self, targets: &[RenewTarget]) -> Result<()>;

    async fn delete(&self, domain: &str) -> Result<()>;
}

pub struct CertbotClient {
    runner: Arc<dyn CommandRunner>,
    contact_email: Option<String>,
    config_dir: Option<PathBuf>,
}

impl CertbotClient {
    /// `cert_base` is the `live` directory; certbot's config dir is its parent.
    pub fn new(runner: Arc<dyn CommandRunner>, contact_email: Option<String>, cert_base: &Path) -> Self {
        Self {
            runner,
            contact_email,
            config_dir: cert_base.parent().map(Path::to_path_buf),
        }
    }

    fn command(&self, subcommand: &str) -> CommandSpec {
        let mut cmd = CommandSpec::new("certbot")
            .arg(subcommand)
            .arg("--non-interactive");
        if let Some(dir) = &self.config_dir {
            cmd = cmd.arg("--config-dir").arg(dir.display().to_string());
        }
        cmd
    }
}

#[async_trait]
impl AcmeClient for CertbotClient {
    fn name(&self) -> &'static str {
        "certbot"
    }

    async fn ensure_available(&self) -> Result<()> {
        if PackageManager::new(self.runner.as_ref())
            .is_installed("certbot")
            .await?
        {
            Ok(())
        } else {
            Err(SiteError::MissingDependency(
                "certbot is not installed (apt-get install certbot)".to_string(),
            ))
        }
    }

    async fn issue(&self, domain: &str, webroot: &Path) -> Result<()> {
        let mut cmd = self
            .command("certonly")
            .args(["--webroot", "-w"])
            .arg(webroot.display().to_string())
            .args(["-d", domain])
            .args(["--agree-tos", "--keep-until-expiring"]);
        cmd = match &self.contact_email {
            Some(email) => cmd.args(["-m", email.as_str()]),
            None => cmd.arg("--register-unsafely-without-email"),
        };

        let output = self.runner.run(&cmd).await?;
        if output.success() {
            info!(domain, "certbot issued certificate");
            return Ok(());
        }
        let failure = classify_failure(&output.combined());
        warn!(domain, category = failure.category(), "certbot issuance failed");
        Err(SiteError::Issuance(failure))
    }

    async fn renew_all(&self, targets: &[RenewTarget]) -> Result<()> {
        if targets.is_empty() {
            return Ok(());
        }
        // certbot tracks renewal config itself; the target list only gates the call.
        self.runner.run_checked(&self.command("renew")).await?;
        Ok(())
    }

    async fn delete(&self, domain: &str) -> Result<()> {
        self.runner
            .run_checked(&self.command("delete").args(["--cert-name", domain]))
            .await?;
        info!(domain, "certbot certificate deleted");
        Ok(())
    }
}

static RATE_LIMITED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(too many (certificates|failed authorizations|new orders|registrations)|rate ?limit|error:ratelimited)")
        .expect("rate limit pattern")
});

static DNS_MISMATCH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(nxdomain|dns problem|no valid (a|aaaa) records|servfail|error:dns\b|no such host)")
        .expect("dns pattern")
});

static PORT_BLOCKED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(connection refused|timeout during connect|likely firewall problem|error:connection\b|connection reset by peer)")
        .expect("port pattern")
});

/// Maps ACME client output onto a failure category. Checked from most to
/// least specific; the first matching line becomes the detail.
pub fn classify_failure(output: &str) -> IssuanceFailure {
    let patterns: [(&Regex, fn(String) -> IssuanceFailure); 3] = [
        (&*RATE_LIMITED, IssuanceFailure::RateLimited),
        (&*DNS_MISMATCH, IssuanceFailure::DnsMismatch),
        (&*PORT_BLOCKED, IssuanceFailure::PortBlocked),
    ];
    for (pattern, make) in patterns {
        if let Some(line) = output.lines().find(|line| pattern.is_match(line)) {
            return make(line.trim().to_string());
        }
    }
    let last = output
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("no output from ACME client");
    IssuanceFailure::IssuanceFailed(last.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::CommandOutput;
    use crate::test_utils::FakeRunner;

    #[test]
    fn test_classify_rate_limited() {
        let out = "Saving debug log\nAn unexpected error occurred:\n\
                   Error creating new order :: too many certificates (5) already issued for this exact set of domains\n";
        let failure = classify_failure(out);
        assert_eq!(failure.category(), "rate-limited");
        assert!(failure.detail().contains("too many certificates"));
    }

    #[test]
    fn test_classify_dns_mismatch() {
        let out = "Certbot failed to authenticate some domains\n  \
                   Detail: DNS problem: NXDOMAIN looking up A for example.test\n";
        assert_eq!(classify_failure(out).category(), "dns-mismatch");
    }

    #[test]
    fn test_classify_port_blocked() {
        let out = "  Detail: 203.0.113.10: Fetching http://example.test/.well-known/acme-challenge/x: \
                   Timeout during connect (likely firewall problem)\n";
        assert_eq!(classify_failure(out).category(), "port-blocked");
    }

    #[test]
    fn test_classify_generic_uses_last_line() {
        let failure = classify_failure("something odd\n\nfinal words\n\n");
        assert_eq!(failure, IssuanceFailure::IssuanceFailed("final words".to_string()));
        assert_eq!(
            classify_failure(""),
            IssuanceFailure::IssuanceFailed("no output from ACME client".to_string())
        );
    }

    #[tokio::test]
    async fn test_certbot_issue_builds_webroot_command() {
        let runner = Arc::new(FakeRunner::new());
        let client = CertbotClient::new(
            runner.clone(),
            Some("ops@example.test".to_string()),
            Path::new("/etc/letsencrypt/live"),
        );
        client
            .issue("example.test", Path::new("/var/www/example.test"))
            .await
            .unwrap();
        assert_eq!(
            runner.calls(),
            vec![
                "certbot certonly --non-interactive --config-dir /etc/letsencrypt --webroot -w \
                 /var/www/example.test -d example.test --agree-tos --keep-until-expiring \
                 -m ops@example.test"
                    .to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_certbot_issue_failure_is_classified() {
        let runner = Arc::new(FakeRunner::new());
        runner.on(
            "certbot certonly",
            CommandOutput::failed(1, "Detail: DNS problem: NXDOMAIN looking up A for example.test"),
        );
        let client = CertbotClient::new(runner.clone(), None, Path::new("/etc/letsencrypt/live"));
        let err = client
            .issue("example.test", Path::new("/var/www/example.test"))
            .await
            .unwrap_err();
        match err {
            SiteError::Issuance(IssuanceFailure::DnsMismatch(detail)) => {
                assert!(detail.contains("NXDOMAIN"))
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(runner.calls()[0].contains("--register-unsafely-without-email"));
    }

    #[tokio::test]
    async fn test_certbot_missing_is_missing_dependency() {
        let runner = Arc::new(FakeRunner::new());
        runner.on("dpkg-query", CommandOutput::failed(1, "no packages found matching certbot"));
        let client = CertbotClient::new(runner, None, Path::new("/etc/letsencrypt/live"));
        assert!(matches!(
            client.ensure_available().await,
            Err(SiteError::MissingDependency(_))
        ));
    }
}
