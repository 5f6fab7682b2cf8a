use sitekeeper_common::{IssuanceFailure, SiteError};
use tracing::{error, warn};

/// Logs a failed operation, prints what the operator can do about it and
/// returns the process exit code.
pub fn report(err: &SiteError) -> u8 {
    if err.is_user_error() {
        warn!(error = %err, "operation not performed");
    } else {
        error!(error = %err, fatal = err.is_fatal(), "operation failed");
    }

    if let SiteError::ConfigValidationFailed { output, .. } = err
        && !output.trim().is_empty()
    {
        eprintln!("{}", output.trim_end());
    }
    if let Some(hint) = hint(err) {
        eprintln!("hint: {}", hint);
    }
    u8::try_from(err.exit_code()).unwrap_or(1)
}

fn hint(err: &SiteError) -> Option<&'static str> {
    match err {
        SiteError::NoActiveBackend => Some("start apache2 or nginx, then retry"),
        SiteError::BackendMismatch { .. } => {
            Some("re-run `sitekeeper add` to move the site to the active web server")
        }
        SiteError::Privilege(_) => Some("run as root, e.g. with sudo"),
        SiteError::ConfigValidationFailed { .. } => {
            Some("the generated configuration was discarded and the web server left untouched")
        }
        SiteError::Issuance(IssuanceFailure::DnsMismatch(_)) => {
            Some("point the domain's A record at this host and wait for DNS to propagate")
        }
        SiteError::Issuance(IssuanceFailure::PortBlocked(_)) => {
            Some("make sure port 80 is open to the internet (e.g. `ufw allow 80/tcp`)")
        }
        SiteError::Issuance(IssuanceFailure::RateLimited(_)) => {
            Some("the certificate authority is rate limiting this host; retry later")
        }
        SiteError::Interrupted => Some("the interrupted step was rolled back"),
        _ => None,
    }
}
