use crate::commands::{self, Operation};
use crate::error;
use inquire::{Confirm as ConfirmPrompt, InquireError, Select, Text};
use sitekeeper_common::{Result, SiteError};
use sitekeeper_host::{Confirm, HostContext};
use std::fmt;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MenuItem {
    AddDomain,
    RemoveDomain,
    ListDomains,
    DomainStatus,
    IssueCertificate,
    RenewCertificates,
    RemoveCertificate,
    CheckCertificates,
    ImportSites,
    ProbeHost,
    Quit,
}

impl MenuItem {
    const ALL: [MenuItem; 11] = [
        MenuItem::AddDomain,
        MenuItem::RemoveDomain,
        MenuItem::ListDomains,
        MenuItem::DomainStatus,
        MenuItem::IssueCertificate,
        MenuItem::RenewCertificates,
        MenuItem::RemoveCertificate,
        MenuItem::CheckCertificates,
        MenuItem::ImportSites,
        MenuItem::ProbeHost,
        MenuItem::Quit,
    ];
}

impl fmt::Display for MenuItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MenuItem::AddDomain => "Add a domain",
            MenuItem::RemoveDomain => "Remove a domain",
            MenuItem::ListDomains => "List domains",
            MenuItem::DomainStatus => "Show domain status",
            MenuItem::IssueCertificate => "Issue a certificate",
            MenuItem::RenewCertificates => "Renew certificates",
            MenuItem::RemoveCertificate => "Remove a certificate",
            MenuItem::CheckCertificates => "Check certificates",
            MenuItem::ImportSites => "Import existing sites",
            MenuItem::ProbeHost => "Probe this host",
            MenuItem::Quit => "Quit",
        };
        f.write_str(label)
    }
}

/// Loops until the operator quits. Failed operations are reported and the
/// menu continues; fatal ones and Ctrl-C end the session.
pub async fn run(ctx: &HostContext, confirm: &dyn Confirm) -> Result<()> {
    loop {
        let choice = match Select::new("What do you want to do?", MenuItem::ALL.to_vec())
            .with_page_size(MenuItem::ALL.len())
            .prompt()
        {
            Ok(choice) => choice,
            Err(InquireError::OperationCanceled | InquireError::OperationInterrupted) => break,
            Err(InquireError::NotTTY) => {
                return Err(SiteError::aborted(
                    "the menu needs an interactive terminal; use a subcommand instead",
                ));
            }
            Err(err) => return Err(prompt_failed(err)),
        };
        if choice == MenuItem::Quit {
            break;
        }

        let Some(op) = operation_for(choice)? else {
            continue;
        };
        match commands::execute(ctx, op, confirm).await {
            Ok(()) => {}
            Err(err) if err.is_fatal() || matches!(err, SiteError::Interrupted) => return Err(err),
            Err(err) => {
                error::report(&err);
            }
        }
    }
    info!("leaving menu");
    Ok(())
}

/// Asks for the item's arguments. `None` when the operator backs out.
fn operation_for(item: MenuItem) -> Result<Option<Operation>> {
    let op = match item {
        MenuItem::AddDomain => {
            let Some(domain) = ask("Domain name:")? else {
                return Ok(None);
            };
            let Some(root) = ask_optional("Document root (empty for the default):")? else {
                return Ok(None);
            };
            Operation::Add {
                domain,
                root: root.map(PathBuf::from),
            }
        }
        MenuItem::RemoveDomain => {
            let Some(domain) = ask("Domain name:")? else {
                return Ok(None);
            };
            Operation::Remove {
                domain,
                purge_cert: ask_yes_no("Also delete its certificate?")?,
                purge_root: ask_yes_no("Also delete its document root?")?,
            }
        }
        MenuItem::ListDomains => Operation::List { json: false },
        MenuItem::DomainStatus => match ask("Domain name:")? {
            Some(domain) => Operation::Status {
                domain,
                json: false,
            },
            None => return Ok(None),
        },
        MenuItem::IssueCertificate => match ask("Domain name(s), separated by spaces:")? {
            Some(input) => Operation::SslAdd {
                domains: split_names(&input),
            },
            None => return Ok(None),
        },
        MenuItem::RenewCertificates => Operation::SslRenew,
        MenuItem::RemoveCertificate => match ask("Domain name:")? {
            Some(domain) => Operation::SslRemove { domain },
            None => return Ok(None),
        },
        MenuItem::CheckCertificates => Operation::SslCheck { json: false },
        MenuItem::ImportSites => Operation::Import {
            apply: ask_yes_no("Register the discovered sites now?")?,
            include_ambiguous: false,
        },
        MenuItem::ProbeHost => Operation::Probe { json: false },
        MenuItem::Quit => return Ok(None),
    };
    Ok(Some(op))
}

fn split_names(input: &str) -> Vec<String> {
    input
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn ask(message: &str) -> Result<Option<String>> {
    match ask_optional(message)? {
        Some(Some(value)) => Ok(Some(value)),
        _ => Ok(None),
    }
}

/// Outer `None` means cancelled, inner `None` means left empty.
fn ask_optional(message: &str) -> Result<Option<Option<String>>> {
    match Text::new(message).prompt() {
        Ok(value) => {
            let value = value.trim();
            Ok(Some((!value.is_empty()).then(|| value.to_string())))
        }
        Err(InquireError::OperationCanceled) => Ok(None),
        Err(err) => Err(prompt_failed(err)),
    }
}

fn ask_yes_no(message: &str) -> Result<bool> {
    match ConfirmPrompt::new(message).with_default(false).prompt() {
        Ok(answer) => Ok(answer),
        Err(InquireError::OperationCanceled) => Ok(false),
        Err(err) => Err(prompt_failed(err)),
    }
}

fn prompt_failed(err: InquireError) -> SiteError {
    match err {
        InquireError::OperationInterrupted => SiteError::Interrupted,
        other => SiteError::Internal(anyhow::anyhow!("prompt failed: {}", other)),
    }
}
