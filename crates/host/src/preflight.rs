//! Advisory checks run before certificate issuance.
//!
//! Only an interrupt fails an operation here: resolution errors, unreachable
//! hosts and timeouts all become warnings the operator can accept or decline.

use crate::context::HostContext;
use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const PUBLIC_IP_ENDPOINT: &str = "https://api.ipify.org";

#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn lookup_ipv4(&self, name: &str) -> Result<Vec<Ipv4Addr>, String>;
}

#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Status of a plain GET without following redirects.
    async fn http_status(&self, url: &str) -> Result<u16, String>;

    async fn public_ipv4(&self) -> Option<Ipv4Addr>;
}

pub struct SystemResolver {
    inner: TokioAsyncResolver,
}

impl SystemResolver {
    pub fn from_system_conf() -> Self {
        let inner = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|err| {
            warn!(error = %err, "cannot read system resolver config, using defaults");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self { inner }
    }
}

#[async_trait]
impl DnsResolver for SystemResolver {
    async fn lookup_ipv4(&self, name: &str) -> Result<Vec<Ipv4Addr>, String> {
        match self.inner.lookup_ip(name).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .filter_map(|ip| match ip {
                    IpAddr::V4(v4) => Some(v4),
                    IpAddr::V6(_) => None,
                })
                .collect()),
            Err(err) => match err.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(Vec::new()),
                _ => Err(err.to_string()),
            },
        }
    }
}

pub struct HttpReachability {
    client: reqwest::Client,
}

impl HttpReachability {
    pub fn new(request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("sitekeeper/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ReachabilityProbe for HttpReachability {
    async fn http_status(&self, url: &str) -> Result<u16, String> {
        self.client
            .get(url)
            .send()
            .await
            .map(|resp| resp.status().as_u16())
            .map_err(|err| err.to_string())
    }

    async fn public_ipv4(&self) -> Option<Ipv4Addr> {
        let body = self
            .client
            .get(PUBLIC_IP_ENDPOINT)
            .send()
            .await
            .ok()?
            .text()
            .await
            .ok()?;
        body.trim().parse().ok()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PreflightReport {
    pub domain: String,
    pub resolved: Vec<Ipv4Addr>,
    pub expected_ip: Option<Ipv4Addr>,
    pub http_status: Option<u16>,
    pub warnings: Vec<String>,
}

impl PreflightReport {
    pub fn passed(&self) -> bool {
        self.warnings.is_empty()
    }
}

pub async fn run(ctx: &HostContext, domain: &str) -> sitekeeper_common::Result<PreflightReport> {
    let interrupt = &ctx.interrupt;
    let limit = Duration::from_secs(ctx.config.probe_timeout_secs);
    let mut report = PreflightReport {
        domain: domain.to_string(),
        ..Default::default()
    };

    let lookup = interrupt
        .guard(async { Ok(timeout(limit, ctx.resolver.lookup_ipv4(domain)).await) })
        .await?;
    match lookup {
        Ok(Ok(addrs)) if addrs.is_empty() => {
            report
                .warnings
                .push(format!("{} has no A record", domain));
        }
        Ok(Ok(addrs)) => report.resolved = addrs,
        Ok(Err(err)) => report
            .warnings
            .push(format!("DNS lookup for {} failed: {}", domain, err)),
        Err(_) => report
            .warnings
            .push(format!("DNS lookup for {} timed out", domain)),
    }

    report.expected_ip = match ctx.config.public_ip.as_deref() {
        Some(raw) => match raw.parse() {
            Ok(ip) => Some(ip),
            Err(_) => {
                warn!(value = raw, "configured public IP is not an IPv4 address");
                None
            }
        },
        None => interrupt
            .guard(async { Ok(timeout(limit, ctx.reachability.public_ipv4()).await) })
            .await?
            .ok()
            .flatten(),
    };
    if let Some(expected) = report.expected_ip
        && !report.resolved.is_empty()
        && !report.resolved.contains(&expected)
    {
        report.warnings.push(format!(
            "{} resolves to {} but this host's public address is {}",
            domain,
            join_addrs(&report.resolved),
            expected
        ));
    }

    let url = format!("http://{}/", domain);
    let reachable = interrupt
        .guard(async { Ok(timeout(limit, ctx.reachability.http_status(&url)).await) })
        .await?;
    match reachable {
        Ok(Ok(status)) => report.http_status = Some(status),
        Ok(Err(err)) => report
            .warnings
            .push(format!("{} is not reachable: {}", url, err)),
        Err(_) => report
            .warnings
            .push(format!("{} did not answer within {}s", url, limit.as_secs())),
    }

    if report.passed() {
        info!(domain, "pre-flight checks passed");
    } else {
        for warning in &report.warnings {
            warn!(domain, "{}", warning);
        }
    }
    debug!(?report, "pre-flight report");
    Ok(report)
}

fn join_addrs(addrs: &[Ipv4Addr]) -> String {
    addrs
        .iter()
        .map(Ipv4Addr::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
