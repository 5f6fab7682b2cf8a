pub mod config;
pub mod error;
pub mod fsutil;
pub mod lock;
pub mod models;
pub mod registry;
pub mod validation;

// ============ 重新导出常用类型 ============

// 错误处理
pub use error::{IssuanceFailure, Result, SiteError};

// 配置相关
pub use config::{AcmeClientKind, AppConfig, BackendDirs};

// 数据模型
pub use models::{Backend, CertificateRecord, DomainRecord, SslState};

// 注册表
pub use registry::{Registry, RegistryIter};

// 验证相关
pub use validation::{ValidationError, validate_document_root, validate_domain};
