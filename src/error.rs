/// 自定义错误类型
///
/// 使用 thiserror 定义精确的错误类型，让调度器能够区分
/// “没有可用的中继” 与 “目标不可达” 等不同的失败原因
use std::io;
use std::time::Duration;
use thiserror::Error;

/// 代理的主要错误类型
#[derive(Error, Debug)]
pub enum ProxyError {
    /// 连接失败
    #[error("Failed to connect to {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: Duration },

    /// 没有已注册的中继会话
    #[error("No active relay session available")]
    NoActiveRelay,

    /// 中继会话正在处理另一条命令
    #[error("Relay session is busy with another tunnel")]
    RelayBusy,

    /// 中继端拒绝了隧道命令
    #[error("Relay did not confirm tunnel: {0}")]
    RelayRejected(String),

    /// 中继控制通道已关闭
    #[error("Relay control channel closed")]
    RelayClosed,

    /// 协议错误
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// 认证失败
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// TLS 错误
    #[error("TLS error: {0}")]
    Tls(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// 创建连接失败错误
    pub fn connection_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::ConnectionFailed {
            addr: addr.into(),
            source,
        }
    }

    /// 创建超时错误
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 创建协议错误
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolError(msg.into())
    }

    /// 创建认证失败错误
    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthenticationFailed(msg.into())
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// 检查是否为认证失败
    pub fn is_auth_failed(&self) -> bool {
        matches!(self, Self::AuthenticationFailed(_))
    }

    /// 中继无法服务本次请求（调度器据此返回 503 而不是直接断开）
    ///
    /// 命令等待超时只在中继路径上产生，因此同样归入此类。
    pub fn is_relay_unavailable(&self) -> bool {
        matches!(
            self,
            Self::NoActiveRelay
                | Self::RelayBusy
                | Self::RelayRejected(_)
                | Self::RelayClosed
                | Self::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = ProxyError::auth_failed("Invalid passkey");
        assert!(err.is_auth_failed());
        assert_eq!(err.to_string(), "Authentication failed: Invalid passkey");
    }

    #[test]
    fn test_timeout_error() {
        let err = ProxyError::timeout(Duration::from_secs(15));
        assert!(err.is_timeout());
        assert!(err.is_relay_unavailable());
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_connection_failed() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err = ProxyError::connection_failed("127.0.0.1:8080", io_err);
        assert!(err.to_string().contains("Failed to connect"));
        assert!(err.to_string().contains("127.0.0.1:8080"));
        assert!(!err.is_relay_unavailable());
    }

    #[test]
    fn test_relay_kinds_are_distinguishable() {
        let none = ProxyError::NoActiveRelay;
        let busy = ProxyError::RelayBusy;

        assert!(none.is_relay_unavailable());
        assert!(busy.is_relay_unavailable());
        assert!(matches!(none, ProxyError::NoActiveRelay));
        assert!(!matches!(busy, ProxyError::NoActiveRelay));
        assert_ne!(none.to_string(), busy.to_string());
    }
}
