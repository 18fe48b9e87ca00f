use thiserror::Error;

/// 服务统一错误类型
///
/// `Display` 输出仅用于日志；返回给调用方的文本统一走 [`AppError::detail`]。
#[derive(Error, Debug)]
pub enum AppError {
    /// 匹配请求非法: ID 缺失/非整数、单据类型不符、公司不符、单据未解析
    #[error("invalid match request: {0}")]
    InvalidMatchRequest(String),

    /// 非匹配接口的参数错误 (上传、注册公司等)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// 必填字段无法解析，本次匹配失败
    #[error("normalization failed for {document}: field '{field}' {reason}")]
    Normalization {
        document: String,
        field: String,
        reason: String,
    },

    /// 存储或报告写入超时，可由调用方退避重试
    #[error("storage timeout during {0}")]
    StorageTimeout(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type AppResult<T> = std::result::Result<T, AppError>;

impl AppError {
    /// 机器可读的错误类别
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidMatchRequest(_) => "invalid_match_request",
            Self::InvalidRequest(_) => "invalid_request",
            Self::NotFound(_) => "not_found",
            Self::Normalization { .. } => "normalization_error",
            Self::StorageTimeout(_) => "storage_timeout",
            Self::Storage(_) => "storage",
            Self::Internal(_) => "internal",
        }
    }

    /// 面向终端用户的说明，不包含内部细节
    pub fn detail(&self) -> String {
        match self {
            Self::InvalidMatchRequest(msg) | Self::InvalidRequest(msg) | Self::NotFound(msg) => {
                msg.clone()
            }
            Self::Normalization { document, field, reason } => {
                format!("Could not read the {document}: field '{field}' {reason}. Please correct the document and try again.")
            }
            Self::StorageTimeout(_) => {
                "The document store did not respond in time. Please retry shortly.".to_string()
            }
            Self::Storage(_) => "A storage error occurred while processing the request.".to_string(),
            Self::Internal(_) => "An unexpected error occurred.".to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageTimeout(_))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut => Self::StorageTimeout("database pool acquire".to_string()),
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_detail_hides_driver_message() {
        let err = AppError::Storage("connection refused at 10.0.0.3:5432".into());
        assert_eq!(err.kind(), "storage");
        assert!(!err.detail().contains("10.0.0.3"));
    }

    #[test]
    fn pool_timeout_maps_to_retryable_storage_timeout() {
        let err: AppError = sqlx::Error::PoolTimedOut.into();
        assert_eq!(err.kind(), "storage_timeout");
        assert!(err.is_retryable());
    }

    #[test]
    fn invalid_match_request_detail_is_verbatim() {
        let err = AppError::InvalidMatchRequest("po_id must be an integer".into());
        assert_eq!(err.detail(), "po_id must be an integer");
        assert!(!err.is_retryable());
    }
}
