//! 域名与文档根目录校验
//!
//! 所有会触碰文件系统或服务管理器的操作，都必须先通过这里的校验。

use crate::error::SiteError;
use regex::Regex;
use std::net::IpAddr;
use std::path::Path;
use std::sync::LazyLock;

/// 单个域名标签的最大长度
pub const MAX_LABEL_LEN: usize = 63;

/// 不含末尾点的域名最大长度
pub const MAX_DOMAIN_LEN: usize = 253;

static LABEL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").expect("label regex"));

/// 校验错误类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// 空域名
    Empty,

    /// 域名过长
    TooLong { len: usize },

    /// 以点结尾
    TrailingDot,

    /// IP 字面量不是域名
    IpLiteral { value: String },

    /// localhost 等保留名称
    Reserved { value: String },

    /// 只有一个标签
    NotQualified { value: String },

    /// 非法标签
    InvalidLabel { label: String },

    /// 顶级域全为数字
    NumericTld { tld: String },

    /// 文档根目录非法
    InvalidDocumentRoot { path: String, reason: &'static str },
}

impl ValidationError {
    /// 获取错误的详细描述
    pub fn description(&self) -> String {
        match self {
            Self::Empty => "domain name cannot be empty".to_string(),
            Self::TooLong { len } => {
                format!("domain name is {} characters (max {})", len, MAX_DOMAIN_LEN)
            }
            Self::TrailingDot => "domain name cannot end with a dot".to_string(),
            Self::IpLiteral { value } => format!("{} is an IP address, not a domain name", value),
            Self::Reserved { value } => format!("{} is a reserved name", value),
            Self::NotQualified { value } => {
                format!("{} is not fully qualified (expected name.tld)", value)
            }
            Self::InvalidLabel { label } => {
                let shown: String = label.chars().take(MAX_LABEL_LEN + 1).collect();
                if label.chars().count() > MAX_LABEL_LEN {
                    format!("label '{}…' exceeds {} characters", shown, MAX_LABEL_LEN)
                } else {
                    format!("invalid label '{}'", shown)
                }
            }
            Self::NumericTld { tld } => format!("top-level domain '{}' is numeric", tld),
            Self::InvalidDocumentRoot { path, reason } => {
                format!("invalid document root {}: {}", path, reason)
            }
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.description())
    }
}

impl std::error::Error for ValidationError {}

impl From<ValidationError> for SiteError {
    fn from(err: ValidationError) -> Self {
        SiteError::Validation(err.description())
    }
}

/// 校验并规范化（小写、去空白）域名
pub fn validate_domain(input: &str) -> Result<String, ValidationError> {
    let name = input.trim().to_ascii_lowercase();

    if name.is_empty() {
        return Err(ValidationError::Empty);
    }
    if name.len() > MAX_DOMAIN_LEN {
        return Err(ValidationError::TooLong { len: name.len() });
    }
    if name.ends_with('.') {
        return Err(ValidationError::TrailingDot);
    }

    let unbracketed = name.trim_start_matches('[').trim_end_matches(']');
    if unbracketed.parse::<IpAddr>().is_ok() {
        return Err(ValidationError::IpLiteral { value: name });
    }

    if name == "localhost" || name.ends_with(".localhost") {
        return Err(ValidationError::Reserved { value: name });
    }

    let labels: Vec<&str> = name.split('.').collect();
    for label in &labels {
        if !LABEL_REGEX.is_match(label) {
            return Err(ValidationError::InvalidLabel {
                label: label.to_string(),
            });
        }
    }

    if labels.len() < 2 {
        return Err(ValidationError::NotQualified { value: name });
    }

    let tld = labels[labels.len() - 1];
    if tld.chars().all(|c| c.is_ascii_digit()) {
        return Err(ValidationError::NumericTld {
            tld: tld.to_string(),
        });
    }

    Ok(name)
}

/// 校验文档根目录（注册表以 ':' 分隔字段，因此路径中不得出现 ':'）
pub fn validate_document_root(path: &Path) -> Result<(), ValidationError> {
    let shown = path.display().to_string();
    let invalid = |reason| ValidationError::InvalidDocumentRoot {
        path: shown.clone(),
        reason,
    };

    if !path.is_absolute() {
        return Err(invalid("must be an absolute path"));
    }
    if path == Path::new("/") {
        return Err(invalid("must not be the filesystem root"));
    }
    if shown.contains(':') || shown.contains('\n') {
        return Err(invalid("must not contain ':' or newlines"));
    }
    if path.components().any(|c| c == std::path::Component::ParentDir) {
        return Err(invalid("must not contain '..'"));
    }
    Ok(())
}
