pub mod acme;
pub mod certstore;
pub mod context;
pub mod domains;
pub mod import;
pub mod interrupt;
pub mod lifecycle;
pub mod native_acme;
pub mod preflight;
pub mod probe;
pub mod services;
pub mod system;
pub mod templates;
pub mod transaction;
pub mod vhost;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// ============ 重新导出常用类型 ============

pub use context::HostContext;
pub use domains::RemoveOptions;
pub use import::{ImportCandidate, ImportReport};
pub use interrupt::Interrupt;
pub use lifecycle::{Confirm, RenewReport, SslStatus, StateChange};
pub use preflight::PreflightReport;
pub use probe::HostCapabilities;
pub use system::{CommandRunner, ProgressEvent, ProgressFn};
