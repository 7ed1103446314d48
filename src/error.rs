use std::path::PathBuf;

/// 对外错误族：调用方依赖这三类语义做分流。
///
/// - `MalformedQuery`：请求本身不合法，永不重试
/// - `DataNotFound`：所有层都未命中 / 请求的 id 不存在，与 400 区分开，
///   便于调用方选择回退到更慢的权威数据源
/// - `CacheWrite`：只记日志，不向调用方冒泡（结果照常返回）
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("malformed query: {0}")]
    MalformedQuery(String),

    #[error("data not found: {0}")]
    DataNotFound(String),

    #[error("cache write failed at {path:?}: {source}")]
    CacheWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("server failed: {0}")]
    ServerFailed(String),
}

impl ApiError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        ApiError::MalformedQuery(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ApiError::DataNotFound(msg.into())
    }
}
