//! In-memory stand-ins for the host: scripted commands, DNS, HTTP and ACME.

use crate::acme::{AcmeClient, RenewTarget};
use crate::context::HostContext;
use crate::interrupt::Interrupt;
use crate::lifecycle::Confirm;
use crate::preflight::{DnsResolver, ReachabilityProbe};
use crate::system::{CommandOutput, CommandRunner, CommandSpec};
use async_trait::async_trait;
use chrono::{Datelike, Duration, Utc};
use rcgen::{CertificateParams, KeyPair, date_time_ymd};
use sitekeeper_common::{
    AppConfig, Backend, IssuanceFailure, Registry, Result, SiteError,
};
use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[derive(Clone)]
enum Reply {
    Output(CommandOutput),
    Interrupt,
}

/// Records every command; replies come from prefix rules (latest wins),
/// defaulting to a successful empty run.
#[derive(Default)]
pub struct FakeRunner {
    rules: Mutex<Vec<(String, Reply)>>,
    calls: Mutex<Vec<String>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, prefix: &str, output: CommandOutput) {
        self.rules
            .lock()
            .unwrap()
            .push((prefix.to_string(), Reply::Output(output)));
    }

    pub fn interrupt_on(&self, prefix: &str) {
        self.rules
            .lock()
            .unwrap()
            .push((prefix.to_string(), Reply::Interrupt));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        let line = cmd.to_string();
        self.calls.lock().unwrap().push(line.clone());
        let reply = self
            .rules
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, reply)| reply.clone());
        match reply {
            Some(Reply::Output(output)) => Ok(output),
            Some(Reply::Interrupt) => Err(SiteError::Interrupted),
            None => Ok(CommandOutput::ok("")),
        }
    }
}

#[derive(Default)]
pub struct FakeResolver {
    answers: Mutex<HashMap<String, Vec<Ipv4Addr>>>,
}

impl FakeResolver {
    pub fn set(&self, name: &str, addrs: &[&str]) {
        let addrs = addrs.iter().map(|a| a.parse().unwrap()).collect();
        self.answers.lock().unwrap().insert(name.to_string(), addrs);
    }
}

#[async_trait]
impl DnsResolver for FakeResolver {
    async fn lookup_ipv4(&self, name: &str) -> std::result::Result<Vec<Ipv4Addr>, String> {
        Ok(self
            .answers
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default())
    }
}

pub const SANDBOX_PUBLIC_IP: &str = "203.0.113.10";

pub struct FakeReachability {
    status: Mutex<std::result::Result<u16, String>>,
}

impl FakeReachability {
    pub fn set_status(&self, status: std::result::Result<u16, String>) {
        *self.status.lock().unwrap() = status;
    }
}

impl Default for FakeReachability {
    fn default() -> Self {
        Self {
            status: Mutex::new(Ok(200)),
        }
    }
}

#[async_trait]
impl ReachabilityProbe for FakeReachability {
    async fn http_status(&self, _url: &str) -> std::result::Result<u16, String> {
        self.status.lock().unwrap().clone()
    }

    async fn public_ipv4(&self) -> Option<Ipv4Addr> {
        SANDBOX_PUBLIC_IP.parse().ok()
    }
}

/// Issues self-signed certificates into the sandbox certificate base.
pub struct FakeAcme {
    cert_base: PathBuf,
    failure: Mutex<Option<IssuanceFailure>>,
    domain_failures: Mutex<HashMap<String, IssuanceFailure>>,
    calls: Mutex<Vec<String>>,
}

impl FakeAcme {
    pub fn new(cert_base: &Path) -> Self {
        Self {
            cert_base: cert_base.to_path_buf(),
            failure: Mutex::new(None),
            domain_failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_with(&self, failure: IssuanceFailure) {
        *self.failure.lock().unwrap() = Some(failure);
    }

    /// Fails issuance for `domain` only.
    pub fn fail_domain(&self, domain: &str, failure: IssuanceFailure) {
        self.domain_failures
            .lock()
            .unwrap()
            .insert(domain.to_string(), failure);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AcmeClient for FakeAcme {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn ensure_available(&self) -> Result<()> {
        Ok(())
    }

    async fn issue(&self, domain: &str, _webroot: &Path) -> Result<()> {
        self.calls.lock().unwrap().push(format!("issue {}", domain));
        if let Some(failure) = self.failure.lock().unwrap().clone() {
            return Err(SiteError::Issuance(failure));
        }
        if let Some(failure) = self.domain_failures.lock().unwrap().get(domain).cloned() {
            return Err(SiteError::Issuance(failure));
        }
        write_test_certificate(&self.cert_base.join(domain), domain, 90);
        Ok(())
    }

    async fn renew_all(&self, targets: &[RenewTarget]) -> Result<()> {
        self.calls.lock().unwrap().push("renew".to_string());
        for target in targets {
            write_test_certificate(&self.cert_base.join(&target.domain), &target.domain, 120);
        }
        Ok(())
    }

    async fn delete(&self, domain: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("delete {}", domain));
        let _ = fs::remove_dir_all(self.cert_base.join(domain));
        Ok(())
    }
}

pub struct FakeConfirm {
    answer: bool,
    prompts: Mutex<Vec<String>>,
}

impl FakeConfirm {
    pub fn new(answer: bool) -> Self {
        Self {
            answer,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl Confirm for FakeConfirm {
    fn confirm(&self, prompt: &str) -> bool {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.answer
    }
}

/// A host rooted in a temp dir with fakes wired into a [`HostContext`].
pub struct Sandbox {
    pub dir: TempDir,
    pub ctx: HostContext,
    pub runner: Arc<FakeRunner>,
    pub resolver: Arc<FakeResolver>,
    pub reachability: Arc<FakeReachability>,
    pub acme: Arc<FakeAcme>,
}

impl Sandbox {
    pub fn new(web_server: Option<Backend>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::with_root(dir.path());
        config.require_root = false;
        config.probe_timeout_secs = 2;

        let runner = Arc::new(FakeRunner::new());
        let resolver = Arc::new(FakeResolver::default());
        let reachability = Arc::new(FakeReachability::default());
        let acme = Arc::new(FakeAcme::new(&config.cert_base));

        let ctx = HostContext {
            config,
            web_server,
            web_server_conflict: false,
            php_fpm: None,
            runner: runner.clone(),
            resolver: resolver.clone(),
            reachability: reachability.clone(),
            acme: acme.clone(),
            interrupt: Interrupt::new(),
        };
        Self {
            dir,
            ctx,
            runner,
            resolver,
            reachability,
            acme,
        }
    }

    pub fn registry(&self) -> Registry {
        self.ctx.registry()
    }

    pub fn site_file(&self, backend: Backend, domain: &str) -> PathBuf {
        crate::vhost::site_file(&self.ctx.config, backend, domain)
    }

    pub fn enabled_link(&self, backend: Backend, domain: &str) -> PathBuf {
        crate::vhost::enabled_link(&self.ctx.config, backend, domain)
    }

    /// Points DNS for `domain` at the sandbox's public address.
    pub fn resolve_here(&self, domain: &str) {
        self.resolver.set(domain, &[SANDBOX_PUBLIC_IP]);
    }
}

/// Writes a self-signed `cert.pem`/`fullchain.pem`/`key.pem` set expiring
/// `days_valid` days from now (negative for already expired).
pub fn write_test_certificate(dir: &Path, domain: &str, days_valid: i64) {
    let not_after = Utc::now() + Duration::days(days_valid);
    let not_before = not_after - Duration::days(90);

    let mut params = CertificateParams::new(vec![domain.to_string()]).unwrap();
    params.not_before = date_time_ymd(
        not_before.year(),
        not_before.month() as u8,
        not_before.day() as u8,
    );
    params.not_after = date_time_ymd(
        not_after.year(),
        not_after.month() as u8,
        not_after.day() as u8,
    );
    let key_pair = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key_pair).unwrap();

    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join("cert.pem"), cert.pem()).unwrap();
    fs::write(dir.join("fullchain.pem"), cert.pem()).unwrap();
    fs::write(dir.join("key.pem"), key_pair.serialize_pem()).unwrap();
}
