use crate::metrics;
use crate::output;
use clap::Subcommand;
use sitekeeper_common::{Result, SiteError};
use sitekeeper_host::{Confirm, HostContext, RemoveOptions, domains, import, lifecycle, probe};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Provision a site for a domain on the active web server
    Add {
        domain: String,
        /// Document root (default: <web root>/<domain>)
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Remove a site and forget the domain
    Remove {
        domain: String,
        /// Also delete the domain's certificate
        #[arg(long)]
        purge_cert: bool,
        /// Also delete the document root (only under the web root)
        #[arg(long)]
        purge_root: bool,
    },
    /// List managed domains
    List {
        #[arg(long)]
        json: bool,
    },
    /// Obtain and install certificates
    SslAdd {
        #[arg(required = true)]
        domains: Vec<String>,
    },
    /// Renew due certificates and reload affected web servers
    SslRenew,
    /// Disable TLS for a domain and delete its certificate
    SslRemove { domain: String },
    /// Compare recorded SSL states with the certificates on disk
    SslCheck {
        #[arg(long)]
        json: bool,
    },
    /// Show a domain's record and certificate
    Status {
        domain: String,
        #[arg(long)]
        json: bool,
    },
    /// Find sites configured outside sitekeeper
    Import {
        /// Register the discovered sites (default is a dry run)
        #[arg(long)]
        apply: bool,
        /// Also register sites declaring several server names
        #[arg(long)]
        include_ambiguous: bool,
    },
    /// Report what is installed on this host
    Probe {
        #[arg(long)]
        json: bool,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Add { .. } => "add",
            Operation::Remove { .. } => "remove",
            Operation::List { .. } => "list",
            Operation::SslAdd { .. } => "ssl_add",
            Operation::SslRenew => "ssl_renew",
            Operation::SslRemove { .. } => "ssl_remove",
            Operation::SslCheck { .. } => "ssl_check",
            Operation::Status { .. } => "status",
            Operation::Import { .. } => "import",
            Operation::Probe { .. } => "probe",
        }
    }

    /// Status and ssl-check correct drifted registry entries, so they write too.
    pub fn mutates(&self) -> bool {
        match self {
            Operation::List { .. } | Operation::Probe { .. } => false,
            Operation::Import { apply, .. } => *apply,
            _ => true,
        }
    }
}

pub async fn execute(ctx: &HostContext, op: Operation, confirm: &dyn Confirm) -> Result<()> {
    let name = op.name();
    let result = dispatch(ctx, op, confirm).await;
    metrics::record_operation(name, result.is_ok());
    result
}

async fn dispatch(ctx: &HostContext, op: Operation, confirm: &dyn Confirm) -> Result<()> {
    match op {
        Operation::Add { domain, root } => {
            let record = domains::add(ctx, &domain, root.as_deref()).await?;
            println!(
                "{} is served by {} from {}",
                record.name,
                record.backend,
                record.document_root.display()
            );
        }
        Operation::Remove {
            domain,
            purge_cert,
            purge_root,
        } => {
            if purge_root
                && !confirm.confirm(&format!("Delete the document root of {} and everything in it?", domain))
            {
                return Err(SiteError::aborted("document root deletion declined"));
            }
            let options = RemoveOptions {
                purge_certificate: purge_cert,
                purge_document_root: purge_root,
            };
            let record = domains::remove(ctx, &domain, options).await?;
            println!("{} removed from {}", record.name, record.backend);
        }
        Operation::List { json } => {
            let records = domains::list(ctx)?;
            if json {
                output::print_json(&records)?;
            } else {
                output::print_records(&records);
            }
        }
        Operation::SslAdd { domains } => ssl_add(ctx, &domains, confirm).await?,
        Operation::SslRenew => {
            let report = lifecycle::renew(ctx).await?;
            output::print_renew(&report);
            observe_certificates(ctx).await?;
            if let Some(message) = report.client_error {
                return Err(SiteError::command_failed(ctx.acme.name(), 1, message));
            }
        }
        Operation::SslRemove { domain } => {
            let record = lifecycle::remove_ssl(ctx, &domain).await?;
            println!("TLS disabled for {}", record.name);
        }
        Operation::SslCheck { json } => {
            let statuses = lifecycle::reconcile_all(ctx).await?;
            for status in &statuses {
                if let Some(cert) = &status.certificate {
                    metrics::observe_certificate(&cert.domain, cert.not_after.timestamp());
                }
            }
            if json {
                output::print_json(&statuses)?;
            } else {
                output::print_ssl_check(&statuses);
            }
        }
        Operation::Status { domain, json } => {
            let status = domains::status(ctx, &domain).await?;
            if json {
                output::print_json(&status)?;
            } else {
                output::print_status(&status);
            }
        }
        Operation::Import {
            apply,
            include_ambiguous,
        } => {
            let backend = ctx.active_backend()?;
            let report = import::scan(ctx, backend)?;
            output::print_import(&report, include_ambiguous);
            if apply {
                let adopted = import::apply(ctx, &report, include_ambiguous)?;
                println!("registered {} site(s)", adopted.len());
            } else if import::adoptable(&report, include_ambiguous).next().is_some() {
                println!("dry run; pass --apply to register these sites");
            }
        }
        Operation::Probe { json } => {
            let capabilities = probe::probe(ctx.runner.as_ref(), &ctx.config).await?;
            if json {
                output::print_json(&capabilities)?;
            } else {
                output::print_capabilities(&capabilities);
            }
        }
    }
    Ok(())
}

/// Issues certificates one domain at a time. A failed domain does not stop
/// the rest; the first failure is returned once all have been tried.
async fn ssl_add(ctx: &HostContext, names: &[String], confirm: &dyn Confirm) -> Result<()> {
    let mut first_failure = None;
    for name in names {
        match lifecycle::add_ssl(ctx, name, confirm).await {
            Ok(record) => {
                println!("{} now serves HTTPS", record.name);
                if let Ok(Some(cert)) = ctx.cert_store().inspect(&record.name) {
                    metrics::observe_certificate(&cert.domain, cert.not_after.timestamp());
                }
            }
            Err(SiteError::Interrupted) => return Err(SiteError::Interrupted),
            Err(err) => {
                if names.len() > 1 {
                    error!(domain = %name, error = %err, "certificate not installed");
                }
                first_failure.get_or_insert(err);
            }
        }
    }
    match first_failure {
        Some(err) => Err(err),
        None => {
            info!(count = names.len(), "certificates installed");
            Ok(())
        }
    }
}

async fn observe_certificates(ctx: &HostContext) -> Result<()> {
    let store = ctx.cert_store();
    for record in domains::list(ctx)? {
        if let Some(cert) = store.inspect(&record.name)? {
            metrics::observe_certificate(&cert.domain, cert.not_after.timestamp());
        }
    }
    Ok(())
}
