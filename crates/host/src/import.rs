//! Discovers sites configured outside sitekeeper.
//!
//! Scanning never writes anything: it returns candidates and the operator
//! decides which to adopt with [`apply`].

use crate::context::HostContext;
use regex::Regex;
use serde::Serialize;
use sitekeeper_common::{
    Backend, DomainRecord, Result, SslState, validate_document_root, validate_domain,
};
use std::fs;
use std::path::PathBuf;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

static NGINX_SERVER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*server_name\s+([^;]+);?").expect("server_name pattern"));
static NGINX_ROOT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*root\s+([^;]+);?").expect("root pattern"));
static APACHE_SERVER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*ServerName\s+(\S+)").expect("ServerName pattern"));
static APACHE_DOCUMENT_ROOT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*DocumentRoot\s+(\S+)").expect("DocumentRoot pattern"));

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedSite {
    /// First usable name of each server-name directive, in file order.
    pub server_names: Vec<String>,
    pub roots: Vec<String>,
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportCandidate {
    pub record: DomainRecord,
    pub source: PathBuf,
    /// More than one distinct server name was declared; the first was used.
    pub ambiguous: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedSite {
    pub source: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub backend: Backend,
    pub candidates: Vec<ImportCandidate>,
    pub skipped: Vec<SkippedSite>,
}

pub fn parse_site_config(backend: Backend, content: &str) -> ParsedSite {
    let (name_re, root_re) = match backend {
        Backend::Nginx => (&*NGINX_SERVER_NAME, &*NGINX_ROOT),
        Backend::Apache => (&*APACHE_SERVER_NAME, &*APACHE_DOCUMENT_ROOT),
    };
    let mut parsed = ParsedSite::default();
    for raw in content.lines() {
        let line = strip_comment(raw);
        if let Some(caps) = name_re.captures(line) {
            let mut tokens = caps[1]
                .split_whitespace()
                .map(|t| normalize_name(backend, t))
                .filter(|t| usable_name(t));
            if let Some(first) = tokens.next()
                && !parsed.server_names.contains(&first)
            {
                parsed.server_names.push(first);
            }
            parsed.aliases.extend(tokens);
        } else if let Some(caps) = root_re.captures(line) {
            let root = caps[1].trim().trim_matches('"').trim_end_matches('/').to_string();
            if !root.is_empty() && !parsed.roots.contains(&root) {
                parsed.roots.push(root);
            }
        }
    }
    parsed
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(0) => "",
        Some(i) if line[..i].ends_with(char::is_whitespace) => &line[..i],
        _ => line,
    }
}

fn normalize_name(backend: Backend, token: &str) -> String {
    let token = token.trim_matches('"');
    let token = match backend {
        // ServerName may carry scheme and port: https://example.com:443
        Backend::Apache => {
            let token = token.split("://").last().unwrap_or(token);
            token.split(':').next().unwrap_or(token)
        }
        Backend::Nginx => token,
    };
    token.to_ascii_lowercase()
}

fn usable_name(token: &str) -> bool {
    !(token.is_empty() || token == "_" || token.starts_with('~') || token.contains('*'))
}

fn is_default_site(file_name: &str) -> bool {
    file_name.starts_with("default") || file_name.starts_with("000-default")
}

fn is_backup(file_name: &str) -> bool {
    file_name.starts_with('.')
        || file_name.ends_with('~')
        || [".bak", ".old", ".orig", ".dpkg-dist", ".dpkg-old", ".swp"]
            .iter()
            .any(|suffix| file_name.ends_with(suffix))
}

/// Reads `sites-available` for `backend` and proposes records for sites the
/// registry does not know yet.
pub fn scan(ctx: &HostContext, backend: Backend) -> Result<ImportReport> {
    let dir = &ctx.config.backend_dirs(backend).sites_available;
    let registry = ctx.registry();
    let store = ctx.cert_store();
    let mut report = ImportReport {
        backend,
        candidates: Vec::new(),
        skipped: Vec::new(),
    };

    let mut entries: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "no sites-available directory");
            return Ok(report);
        }
        Err(err) => return Err(err.into()),
    };
    entries.sort();

    for path in entries {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let skip = |report: &mut ImportReport, reason: String| {
            debug!(source = %path.display(), %reason, "import: skipped");
            report.skipped.push(SkippedSite {
                source: path.clone(),
                reason,
            });
        };

        if is_default_site(&file_name) {
            skip(&mut report, "default site".to_string());
            continue;
        }
        if is_backup(&file_name) {
            skip(&mut report, "backup or hidden file".to_string());
            continue;
        }
        if backend == Backend::Apache && !file_name.ends_with(".conf") {
            skip(&mut report, "not a .conf file".to_string());
            continue;
        }

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) => {
                skip(&mut report, format!("unreadable: {}", err));
                continue;
            }
        };
        let parsed = parse_site_config(backend, &content);
        let Some(first) = parsed.server_names.first() else {
            skip(&mut report, "no server name".to_string());
            continue;
        };
        let name = match validate_domain(first) {
            Ok(name) => name,
            Err(err) => {
                skip(&mut report, format!("server name {}: {}", first, err));
                continue;
            }
        };
        if registry.contains(&name)? {
            skip(&mut report, format!("{} is already managed", name));
            continue;
        }

        let mut warnings = Vec::new();
        let ambiguous = parsed.server_names.len() > 1;
        if ambiguous {
            warnings.push(format!(
                "multiple server names ({}), using {}",
                parsed.server_names.join(", "),
                name
            ));
        }
        if !parsed.aliases.is_empty() {
            warnings.push(format!("aliases not tracked: {}", parsed.aliases.join(", ")));
        }
        if parsed.roots.len() > 1 {
            warnings.push(format!(
                "multiple document roots ({}), using the first",
                parsed.roots.join(", ")
            ));
        }

        let root = match parsed.roots.first() {
            Some(root) => PathBuf::from(root),
            None => {
                warnings.push("no document root declared, using the default".to_string());
                ctx.config.default_document_root(&name)
            }
        };
        if let Err(err) = validate_document_root(&root) {
            skip(&mut report, format!("document root {}: {}", root.display(), err));
            continue;
        }

        let ssl_state = if store.exists(&name) {
            SslState::Active
        } else {
            SslState::None
        };
        let mut record = DomainRecord::new(name, backend, root);
        record.ssl_state = ssl_state;
        report.candidates.push(ImportCandidate {
            record,
            source: path.clone(),
            ambiguous,
            warnings,
        });
    }

    info!(
        %backend,
        candidates = report.candidates.len(),
        skipped = report.skipped.len(),
        "import scan finished"
    );
    Ok(report)
}

/// Writes the chosen candidates into the registry. Ambiguous candidates are
/// only adopted when `include_ambiguous` is set. Returns the imported names.
pub fn apply(ctx: &HostContext, report: &ImportReport, include_ambiguous: bool) -> Result<Vec<String>> {
    let registry = ctx.registry();
    let mut imported = Vec::new();
    for candidate in &report.candidates {
        if candidate.ambiguous && !include_ambiguous {
            warn!(
                domain = %candidate.record.name,
                source = %candidate.source.display(),
                "ambiguous site not imported"
            );
            continue;
        }
        if registry.contains(&candidate.record.name)? {
            continue;
        }
        registry.upsert(&candidate.record)?;
        imported.push(candidate.record.name.clone());
    }
    info!(imported = imported.len(), "import applied");
    Ok(imported)
}

/// Candidates that [`apply`] would adopt.
pub fn adoptable<'a>(report: &'a ImportReport, include_ambiguous: bool) -> impl Iterator<Item = &'a ImportCandidate> {
    report
        .candidates
        .iter()
        .filter(move |c| include_ambiguous || !c.ambiguous)
}
