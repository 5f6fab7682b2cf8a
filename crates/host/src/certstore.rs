use anyhow::{Result as AnyResult, anyhow};
use chrono::{DateTime, Utc};
use sitekeeper_common::{CertificateRecord, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use x509_parser::pem::parse_x509_pem;

/// Reads certificate material laid out as `<base>/<domain>/{cert,fullchain,key|privkey}.pem`.
#[derive(Debug, Clone)]
pub struct CertificateStore {
    base: PathBuf,
}

impl CertificateStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn domain_dir(&self, domain: &str) -> PathBuf {
        self.base.join(domain)
    }

    pub fn exists(&self, domain: &str) -> bool {
        self.domain_dir(domain).join("cert.pem").is_file()
    }

    /// `Ok(None)` when no usable certificate exists for `domain`.
    pub fn inspect(&self, domain: &str) -> Result<Option<CertificateRecord>> {
        let dir = self.domain_dir(domain);
        let cert_path = dir.join("cert.pem");
        if !cert_path.is_file() {
            return Ok(None);
        }
        let key_path = key_path(&dir);
        if !key_path.is_file() {
            warn!(domain, dir = %dir.display(), "certificate present without private key");
            return Ok(None);
        }
        let fullchain_path = match dir.join("fullchain.pem") {
            p if p.is_file() => p,
            _ => cert_path.clone(),
        };

        let pem = fs::read(&cert_path)?;
        let (issuer, not_after) = parse_certificate(&pem).map_err(|err| {
            anyhow!("cannot parse {}: {}", cert_path.display(), err)
        })?;

        Ok(Some(CertificateRecord {
            domain: domain.to_string(),
            issuer,
            not_after,
            cert_path,
            key_path,
            fullchain_path,
        }))
    }
}

fn key_path(dir: &Path) -> PathBuf {
    let key = dir.join("key.pem");
    if key.is_file() {
        key
    } else {
        dir.join("privkey.pem")
    }
}

/// Issuer and expiry of the first certificate in a PEM bundle.
pub fn parse_certificate(pem_bytes: &[u8]) -> AnyResult<(String, DateTime<Utc>)> {
    let (_, pem) = parse_x509_pem(pem_bytes)?;
    let cert = pem.parse_x509()?;
    let not_after = cert.validity().not_after.to_datetime();
    let dt = DateTime::<Utc>::from_timestamp(not_after.unix_timestamp(), not_after.nanosecond())
        .ok_or_else(|| anyhow!("invalid certificate timestamp"))?;
    Ok((cert.issuer().to_string(), dt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::write_test_certificate;
    use chrono::Duration;
    use sitekeeper_common::SslState;

    #[test]
    fn test_inspect_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path());
        assert!(store.inspect("example.test").unwrap().is_none());
        assert!(!store.exists("example.test"));
    }

    #[test]
    fn test_inspect_reads_expiry_and_prefers_key_pem() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path());
        write_test_certificate(&store.domain_dir("example.test"), "example.test", 45);

        let cert = store.inspect("example.test").unwrap().unwrap();
        let now = Utc::now();
        assert_eq!(cert.classify(now), SslState::Active);
        assert!((cert.not_after - now - Duration::days(45)).num_days().abs() <= 1);
        assert!(cert.key_path.ends_with("key.pem"));
        assert!(cert.fullchain_path.ends_with("fullchain.pem"));
    }

    #[test]
    fn test_inspect_falls_back_to_privkey() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path());
        let domain_dir = store.domain_dir("example.test");
        write_test_certificate(&domain_dir, "example.test", 10);
        fs::rename(domain_dir.join("key.pem"), domain_dir.join("privkey.pem")).unwrap();

        let cert = store.inspect("example.test").unwrap().unwrap();
        assert!(cert.key_path.ends_with("privkey.pem"));
    }

    #[test]
    fn test_expired_certificate_classifies_expired() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path());
        write_test_certificate(&store.domain_dir("old.example.test"), "old.example.test", -3);
        let cert = store.inspect("old.example.test").unwrap().unwrap();
        assert_eq!(cert.classify(Utc::now()), SslState::Expired);
    }

    #[test]
    fn test_garbage_certificate_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path());
        let domain_dir = store.domain_dir("example.test");
        fs::create_dir_all(&domain_dir).unwrap();
        fs::write(domain_dir.join("cert.pem"), "not a certificate").unwrap();
        fs::write(domain_dir.join("key.pem"), "key").unwrap();
        assert!(store.inspect("example.test").is_err());
    }
}
