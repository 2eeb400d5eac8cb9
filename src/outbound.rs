/// 出站连接策略
///
/// 调度器只依赖 `OutboundConnectionProvider`，不关心连接是直连还是经由中继。
use crate::error::{ProxyError, Result};
use crate::pump::BoxedStream;
use crate::server::GatewaySessionManager;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// 出站连接提供者
#[async_trait]
pub trait OutboundConnectionProvider: Send + Sync {
    /// 为 CONNECT 隧道打开出站连接
    async fn open_connect_tunnel(&self, host: &str, port: u16) -> Result<BoxedStream>;

    /// 为普通 HTTP 请求打开出站连接
    async fn open_http_connection(&self, host: &str, port: u16) -> Result<BoxedStream>;

    /// 用于日志
    fn name(&self) -> &'static str;
}

/// 直连：每个请求新建一条 TCP 连接
#[derive(Debug, Clone)]
pub struct DirectConnectionProvider {
    connect_timeout: Duration,
}

impl DirectConnectionProvider {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

/// 带超时的 TCP 连接；超时归为连接失败，而不是中继超时
pub async fn connect_with_timeout(host: &str, port: u16, limit: Duration) -> Result<TcpStream> {
    let addr = authority(host, port);
    let stream = match timeout(limit, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(ProxyError::connection_failed(addr, e)),
        Err(_) => {
            return Err(ProxyError::connection_failed(
                addr,
                io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            ))
        }
    };
    stream.set_nodelay(true).ok();
    Ok(stream)
}

fn authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[async_trait]
impl OutboundConnectionProvider for DirectConnectionProvider {
    async fn open_connect_tunnel(&self, host: &str, port: u16) -> Result<BoxedStream> {
        debug!("Direct connect to {}:{}", host, port);
        let stream = connect_with_timeout(host, port, self.connect_timeout).await?;
        Ok(Box::new(stream))
    }

    async fn open_http_connection(&self, host: &str, port: u16) -> Result<BoxedStream> {
        self.open_connect_tunnel(host, port).await
    }

    fn name(&self) -> &'static str {
        "direct"
    }
}

/// 经由当前活动中继会话出站
#[derive(Clone)]
pub struct RelayedConnectionProvider {
    manager: Arc<GatewaySessionManager>,
}

impl RelayedConnectionProvider {
    pub fn new(manager: Arc<GatewaySessionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl OutboundConnectionProvider for RelayedConnectionProvider {
    async fn open_connect_tunnel(&self, host: &str, port: u16) -> Result<BoxedStream> {
        let session = self.manager.active_or_fail()?;
        let stream = session.open_connect_tunnel(host, port).await?;
        Ok(Box::new(stream))
    }

    async fn open_http_connection(&self, host: &str, port: u16) -> Result<BoxedStream> {
        let session = self.manager.active_or_fail()?;
        let stream = session.open_http_connection(host, port).await?;
        Ok(Box::new(stream))
    }

    fn name(&self) -> &'static str {
        "relay"
    }
}
