use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

/// 系统统一错误类型
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum PiqError {
    // === 输入错误 ===
    #[error("验证失败: {message}")]
    Validation { message: String },

    #[error("资源未找到: {resource}")]
    NotFound { resource: String },

    // === 配置错误 ===
    #[error("配置错误: {key} - {reason}")]
    Configuration { key: String, reason: String },

    // === 协作服务错误 ===
    #[error("认证失败 ({provider}): {message}")]
    Authentication { provider: String, message: String },

    #[error("嵌入服务错误 ({provider}): {message}")]
    EmbeddingService { provider: String, message: String },

    #[error("LLM 服务错误 ({provider}): {message}")]
    LlmService { provider: String, message: String },

    #[error("内容存储错误: {operation} 失败: {message}")]
    ContentStore { operation: String, message: String },

    #[error("审计日志错误: {operation} 失败: {message}")]
    AuditLog { operation: String, message: String },

    #[error("超时错误: {operation} 超过 {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("网络错误: {operation}: {message}")]
    Network { operation: String, message: String },

    #[error("序列化错误: {format}: {message}")]
    Serialization { format: String, message: String },

    // === 系统错误 ===
    #[error("内部系统错误: {message}")]
    Internal { message: String },
}

/// 错误分类，对应调用方可见的三类错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// 缺少必要的凭据或协作服务，不重试
    Configuration,
    /// 依赖调用失败，由所在阶段降级处理
    Collaborator,
    /// 输入格式错误，直接拒绝
    Validation,
    Internal,
}

/// 错误严重级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Low,      // 可预期的输入错误
    Medium,   // 协作服务失败，可降级
    High,     // 存储类错误
    Critical, // 配置或系统级错误
}

/// 错误元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetadata {
    pub error_id: String,
    pub severity: ErrorSeverity,
    pub component: String,
    pub operation: Option<String>,
    pub request_id: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub context: std::collections::BTreeMap<String, String>,
}

impl PiqError {
    pub fn validation(message: impl Into<String>) -> Self {
        PiqError::Validation {
            message: message.into(),
        }
    }

    pub fn configuration(key: impl Into<String>, reason: impl Into<String>) -> Self {
        PiqError::Configuration {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        PiqError::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// 归类到调用方可见的错误类别
    pub fn category(&self) -> ErrorCategory {
        match self {
            PiqError::Validation { .. } | PiqError::NotFound { .. } => ErrorCategory::Validation,
            PiqError::Configuration { .. } => ErrorCategory::Configuration,
            PiqError::Authentication { .. }
            | PiqError::EmbeddingService { .. }
            | PiqError::LlmService { .. }
            | PiqError::ContentStore { .. }
            | PiqError::AuditLog { .. }
            | PiqError::Timeout { .. }
            | PiqError::Network { .. }
            | PiqError::Serialization { .. } => ErrorCategory::Collaborator,
            PiqError::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// 获取错误的严重级别
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            PiqError::Validation { .. } | PiqError::NotFound { .. } => ErrorSeverity::Low,
            PiqError::Authentication { .. }
            | PiqError::EmbeddingService { .. }
            | PiqError::LlmService { .. }
            | PiqError::Timeout { .. }
            | PiqError::Network { .. } => ErrorSeverity::Medium,
            PiqError::ContentStore { .. }
            | PiqError::AuditLog { .. }
            | PiqError::Serialization { .. } => ErrorSeverity::High,
            PiqError::Configuration { .. } | PiqError::Internal { .. } => ErrorSeverity::Critical,
        }
    }

    /// 按严重级别输出一条结构化日志
    pub fn log(&self, metadata: &ErrorMetadata) {
        macro_rules! emit {
            ($level:ident, $msg:literal) => {
                $level!(
                    error_id = %metadata.error_id,
                    component = %metadata.component,
                    operation = metadata.operation.as_deref().unwrap_or("-"),
                    request_id = metadata.request_id.as_deref().unwrap_or("-"),
                    category = ?self.category(),
                    context = ?metadata.context,
                    error = %self,
                    $msg
                )
            };
        }
        match metadata.severity {
            ErrorSeverity::Low => emit!(warn, "输入错误"),
            ErrorSeverity::Medium => emit!(warn, "协作服务错误，已降级"),
            ErrorSeverity::High | ErrorSeverity::Critical => emit!(error, "严重错误"),
        }
    }

    /// 获取用户友好的错误消息
    pub fn user_message(&self) -> String {
        match self.category() {
            ErrorCategory::Validation => format!("Invalid input: {}", self.detail()),
            ErrorCategory::Configuration => {
                "Service unavailable: required backends are not configured".to_string()
            }
            ErrorCategory::Collaborator => {
                "A dependent service failed, please retry later".to_string()
            }
            ErrorCategory::Internal => {
                "Internal error, please contact the administrator".to_string()
            }
        }
    }

    fn detail(&self) -> &str {
        match self {
            PiqError::Validation { message } => message,
            PiqError::NotFound { resource } => resource,
            _ => "",
        }
    }
}

/// 创建错误元数据的便捷构造器
pub struct ErrorMetadataBuilder {
    metadata: ErrorMetadata,
}

impl ErrorMetadataBuilder {
    pub fn new(component: &str) -> Self {
        Self {
            metadata: ErrorMetadata {
                error_id: uuid::Uuid::new_v4().to_string(),
                severity: ErrorSeverity::Medium,
                component: component.to_string(),
                operation: None,
                request_id: None,
                timestamp: chrono::Utc::now(),
                context: std::collections::BTreeMap::new(),
            },
        }
    }

    pub fn operation(mut self, operation: &str) -> Self {
        self.metadata.operation = Some(operation.to_string());
        self
    }

    pub fn request_id(mut self, request_id: &str) -> Self {
        self.metadata.request_id = Some(request_id.to_string());
        self
    }

    pub fn context(mut self, key: &str, value: &str) -> Self {
        self.metadata
            .context
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(mut self, error: &PiqError) -> ErrorMetadata {
        self.metadata.severity = error.severity();
        self.metadata
    }
}

pub type Result<T> = std::result::Result<T, PiqError>;

// === 转换实现 ===

impl From<serde_json::Error> for PiqError {
    fn from(err: serde_json::Error) -> Self {
        PiqError::Serialization {
            format: "json".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for PiqError {
    fn from(err: reqwest::Error) -> Self {
        let operation = if err.is_connect() { "connect" } else { "http_request" };
        if err.is_timeout() {
            // 客户端超时未知，由调用方的 tokio 超时记录具体时长
            return PiqError::Timeout {
                operation: operation.to_string(),
                timeout_ms: 0,
            };
        }
        PiqError::Network {
            operation: operation.to_string(),
            message: err.to_string(),
        }
    }
}

impl From<uuid::Error> for PiqError {
    fn from(err: uuid::Error) -> Self {
        PiqError::Serialization {
            format: "uuid".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for PiqError {
    fn from(err: tokio::task::JoinError) -> Self {
        PiqError::Internal {
            message: format!("task join failed: {}", err),
        }
    }
}

impl From<sled::Error> for PiqError {
    fn from(err: sled::Error) -> Self {
        PiqError::AuditLog {
            operation: "sled".to_string(),
            message: err.to_string(),
        }
    }
}
