use chrono::Utc;
use serde::Serialize;
use sitekeeper_common::{DomainRecord, Result};
use sitekeeper_host::probe::HostCapabilities;
use sitekeeper_host::{ImportReport, ProgressEvent, ProgressFn, RenewReport, SslStatus, import};
use std::io::{IsTerminal, Write};
use std::sync::Arc;

const SPINNER: [char; 4] = ['|', '/', '-', '\\'];

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Left-aligned columns sized to the widest cell.
pub fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(width) = widths.get_mut(i) {
                *width = (*width).max(cell.chars().count());
            }
        }
    }

    let format_row = |cells: Vec<&str>| {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let mut lines = vec![format_row(headers.to_vec())];
    for row in rows {
        lines.push(format_row(row.iter().map(String::as_str).collect()));
    }
    lines.join("\n")
}

pub fn print_records(records: &[DomainRecord]) {
    if records.is_empty() {
        println!("no domains registered");
        return;
    }
    let rows: Vec<Vec<String>> = records
        .iter()
        .map(|r| {
            vec![
                r.name.clone(),
                r.backend.to_string(),
                r.ssl_state.to_string(),
                r.document_root.display().to_string(),
                r.created_at.format("%Y-%m-%d").to_string(),
            ]
        })
        .collect();
    println!(
        "{}",
        render_table(&["DOMAIN", "SERVER", "SSL", "ROOT", "ADDED"], &rows)
    );
}

pub fn print_status(status: &SslStatus) {
    let record = &status.record;
    println!("domain:        {}", record.name);
    println!("web server:    {}", record.backend);
    println!("document root: {}", record.document_root.display());
    println!("ssl:           {}", record.ssl_state);
    println!("added:         {}", record.created_at.to_rfc3339());
    println!("modified:      {}", record.last_modified_at.to_rfc3339());
    if let Some(cert) = &status.certificate {
        println!("issuer:        {}", cert.issuer);
        println!(
            "expires:       {} ({} days)",
            cert.not_after.to_rfc3339(),
            cert.days_remaining(Utc::now())
        );
    }
    if status.reconciled {
        println!("registry updated to match the certificate on disk");
    }
}

pub fn print_ssl_check(statuses: &[SslStatus]) {
    if statuses.is_empty() {
        println!("no domains registered");
        return;
    }
    let now = Utc::now();
    let rows: Vec<Vec<String>> = statuses
        .iter()
        .map(|s| {
            vec![
                s.record.name.clone(),
                s.record.ssl_state.to_string(),
                s.certificate
                    .as_ref()
                    .map(|c| c.days_remaining(now).to_string())
                    .unwrap_or_else(|| "-".to_string()),
                if s.reconciled { "updated" } else { "" }.to_string(),
            ]
        })
        .collect();
    println!(
        "{}",
        render_table(&["DOMAIN", "SSL", "DAYS LEFT", "REGISTRY"], &rows)
    );
}

pub fn print_renew(report: &RenewReport) {
    println!(
        "checked {} certificate(s), renewed {}",
        report.checked,
        report.renewed.len()
    );
    for domain in &report.renewed {
        println!("  renewed {}", domain);
    }
    for change in &report.state_changes {
        println!("  {}: {} -> {}", change.domain, change.from, change.to);
    }
    for backend in &report.reloaded {
        println!("  reloaded {}", backend);
    }
}

pub fn print_import(report: &ImportReport, include_ambiguous: bool) {
    let rows: Vec<Vec<String>> = report
        .candidates
        .iter()
        .map(|c| {
            let adopt = !c.ambiguous || include_ambiguous;
            vec![
                c.record.name.clone(),
                c.record.document_root.display().to_string(),
                c.record.ssl_state.to_string(),
                c.source.display().to_string(),
                if adopt { "import" } else { "ambiguous" }.to_string(),
            ]
        })
        .collect();

    if rows.is_empty() {
        println!("no unmanaged {} sites found", report.backend);
    } else {
        println!(
            "{}",
            render_table(&["DOMAIN", "ROOT", "SSL", "SOURCE", "ACTION"], &rows)
        );
    }
    for candidate in &report.candidates {
        for warning in &candidate.warnings {
            println!("warning: {}: {}", candidate.record.name, warning);
        }
    }
    for skipped in &report.skipped {
        println!("skipped {}: {}", skipped.source.display(), skipped.reason);
    }
    let count = import::adoptable(report, include_ambiguous).count();
    if count > 0 {
        println!("{} site(s) can be imported", count);
    }
}

pub fn print_capabilities(caps: &HostCapabilities) {
    if let Some(os) = &caps.os {
        println!(
            "os:          {}",
            os.pretty_name.as_deref().unwrap_or(os.id.as_str())
        );
    }
    let installed: Vec<String> = caps
        .installed_web_servers
        .iter()
        .map(|b| b.to_string())
        .collect();
    println!(
        "web servers: {}",
        if installed.is_empty() {
            "none".to_string()
        } else {
            installed.join(", ")
        }
    );
    match caps.web_server {
        Some(active) if caps.web_server_conflict => {
            println!("active:      {} (both running, {} managed)", active, active)
        }
        Some(active) => println!("active:      {}", active),
        None => println!("active:      none"),
    }
    println!("php-fpm:     {}", list_or_none(&caps.php_fpm));
    println!("databases:   {}", list_or_none(&caps.databases));
    println!("certbot:     {}", if caps.certbot { "installed" } else { "missing" });
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}

/// Spinner for long external commands, only when stderr is a terminal.
pub fn progress_printer() -> Option<ProgressFn> {
    if !std::io::stderr().is_terminal() {
        return None;
    }
    Some(Arc::new(|event: &ProgressEvent| {
        let mut stderr = std::io::stderr().lock();
        let _ = match event {
            ProgressEvent::Started { .. } => Ok(()),
            ProgressEvent::Tick { command, elapsed } => {
                let frame = SPINNER[(elapsed.as_secs() as usize) % SPINNER.len()];
                write!(stderr, "\r{} {} ({}s)", frame, command, elapsed.as_secs())
            }
            ProgressEvent::Finished { .. } => write!(stderr, "\r\x1b[2K"),
        };
        let _ = stderr.flush();
    }))
}
