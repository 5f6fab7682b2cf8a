//! sitekeeper 统一错误类型定义
//!
//! 全项目共享一个错误类型，CLI 根据错误类别决定退出码与日志级别。

use crate::models::Backend;
use thiserror::Error;

/// 证书签发失败的原因类别（从 ACME 客户端输出推断）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssuanceFailure {
    /// DNS 未指向本机或无法解析
    DnsMismatch(String),
    /// 80 端口不可达（防火墙、服务未监听）
    PortBlocked(String),
    /// 触发 Let's Encrypt 频率限制
    RateLimited(String),
    /// 无法归类
    IssuanceFailed(String),
}

impl IssuanceFailure {
    pub fn category(&self) -> &'static str {
        match self {
            Self::DnsMismatch(_) => "dns-mismatch",
            Self::PortBlocked(_) => "port-blocked",
            Self::RateLimited(_) => "rate-limited",
            Self::IssuanceFailed(_) => "issuance-failed",
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            Self::DnsMismatch(d)
            | Self::PortBlocked(d)
            | Self::RateLimited(d)
            | Self::IssuanceFailed(d) => d,
        }
    }
}

impl std::fmt::Display for IssuanceFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.category(), self.detail())
    }
}

/// sitekeeper 统一错误类型
#[derive(Error, Debug)]
pub enum SiteError {
    /// 域名或参数校验失败
    #[error("validation failed: {0}")]
    Validation(String),

    /// 记录未找到
    #[error("not found: {0}")]
    NotFound(String),

    /// 记录所属后端与当前活动后端不一致
    #[error("{domain} is owned by {owner}, but the active web server is {active}")]
    BackendMismatch {
        domain: String,
        owner: Backend,
        active: Backend,
    },

    /// 没有处于 active 状态的 Web 服务器
    #[error("no active web server (neither apache2 nor nginx is running)")]
    NoActiveBackend,

    /// 缺少外部依赖（如 certbot 未安装）
    #[error("missing dependency: {0}")]
    MissingDependency(String),

    /// 外部命令执行失败
    #[error("command `{command}` failed (exit {code}): {stderr_tail}")]
    ExternalCommandFailed {
        command: String,
        code: i32,
        stderr_tail: String,
    },

    /// 生成的配置未通过后端语法检查，已丢弃
    #[error("{backend} rejected the generated configuration: {output}")]
    ConfigValidationFailed { backend: Backend, output: String },

    /// 证书签发失败
    #[error("certificate issuance failed ({0})")]
    Issuance(IssuanceFailure),

    /// 用户取消
    #[error("aborted: {0}")]
    Aborted(String),

    /// 用户中断（Ctrl-C）
    #[error("interrupted")]
    Interrupted,

    /// 注册表文件结构损坏
    #[error("registry error: {0}")]
    Registry(String),

    /// 权限不足
    #[error("insufficient privileges: {0}")]
    Privilege(String),

    /// IO 错误
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 其他内部错误
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl SiteError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    pub fn registry(msg: impl Into<String>) -> Self {
        Self::Registry(msg.into())
    }

    pub fn aborted(msg: impl Into<String>) -> Self {
        Self::Aborted(msg.into())
    }

    pub fn command_failed(command: impl Into<String>, code: i32, stderr_tail: impl Into<String>) -> Self {
        Self::ExternalCommandFailed {
            command: command.into(),
            code,
            stderr_tail: stderr_tail.into(),
        }
    }

    /// 判断是否为用户输入类错误（不需要人工排查主机状态）
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::NotFound(_)
                | Self::BackendMismatch { .. }
                | Self::Aborted(_)
        )
    }

    /// 判断是否应终止整个进程（而不是继续下一个操作）
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Privilege(_) | Self::Registry(_))
    }

    /// 进程退出码
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) => 2,
            Self::NotFound(_) => 3,
            Self::BackendMismatch { .. } | Self::NoActiveBackend => 4,
            Self::MissingDependency(_) => 5,
            Self::ConfigValidationFailed { .. } => 6,
            Self::Issuance(_) => 7,
            Self::Aborted(_) => 8,
            Self::Privilege(_) => 77,
            Self::Interrupted => 130,
            _ => 1,
        }
    }
}

/// sitekeeper Result 类型别名
pub type Result<T> = std::result::Result<T, SiteError>;
