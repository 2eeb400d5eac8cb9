use super::control_channel::GatewaySession;
use super::registry::GatewaySessionManager;
use crate::control_protocol::{write_control_line, Hello, OK_LINE};
use crate::error::{ProxyError, Result};
use crate::http::{
    bad_request, read_line_limited, resolve_http_target, service_unavailable, split_host_port,
    trim_line_end, HeaderBlock, RequestLine, CONNECTION_ESTABLISHED,
};
use crate::mitm::InterceptionHandler;
use crate::observer::RelayStatusObserver;
use crate::outbound::OutboundConnectionProvider;
use crate::pump::{self, BoxedStream};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// 接受中继注册所需的部件
pub struct GatewayAcceptor {
    pub manager: Arc<GatewaySessionManager>,
    pub passkey: String,
    pub command_timeout: Duration,
    pub status: Arc<dyn RelayStatusObserver>,
}

/// 连接调度器
///
/// 读取首行后决定：中继握手、CONNECT（拦截或隧道）、普通 HTTP 转发。
pub struct ConnectionDispatcher {
    interceptors: Vec<Arc<dyn InterceptionHandler>>,
    tunnel_outbound: Arc<dyn OutboundConnectionProvider>,
    http_outbound: Arc<dyn OutboundConnectionProvider>,
    gateway: Option<GatewayAcceptor>,
    idle_timeout: Duration,
    max_header_bytes: usize,
}

/// 调度结果（用于日志）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Gateway,
    Intercepted,
    Tunnel,
    Http,
    BadRequest,
    Unavailable,
    Closed,
}

impl ConnectionDispatcher {
    pub fn new(
        tunnel_outbound: Arc<dyn OutboundConnectionProvider>,
        http_outbound: Arc<dyn OutboundConnectionProvider>,
    ) -> Self {
        Self {
            interceptors: Vec::new(),
            tunnel_outbound,
            http_outbound,
            gateway: None,
            idle_timeout: Duration::from_secs(crate::config::IDLE_TIMEOUT_SECS),
            max_header_bytes: crate::config::MAX_HEADER_BYTES,
        }
    }

    /// 追加拦截处理器，按添加顺序匹配
    pub fn with_interceptor(mut self, handler: Arc<dyn InterceptionHandler>) -> Self {
        self.interceptors.push(handler);
        self
    }

    pub fn with_gateway(mut self, gateway: GatewayAcceptor) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_max_header_bytes(mut self, max: usize) -> Self {
        self.max_header_bytes = max;
        self
    }

    /// 处理一个已接受的连接
    ///
    /// 各分支接管客户端连接，结束时关闭；出错时连接随之释放。
    pub async fn dispatch(&self, socket: TcpStream, peer: SocketAddr) -> Route {
        socket.set_nodelay(true).ok();
        match self.route(BufReader::new(socket), peer).await {
            Ok(route) => route,
            Err(e) => {
                debug!("Connection from {} ended: {}", peer, e);
                Route::Closed
            }
        }
    }

    async fn route(&self, mut client: BufReader<TcpStream>, peer: SocketAddr) -> Result<Route> {
        // 首行保留原始字节，普通 HTTP 原样重放；解码后的副本只用于分类
        let mut head = Vec::with_capacity(256);
        if !self
            .read_raw_line(&mut client, &mut head, self.max_header_bytes)
            .await?
        {
            return Ok(Route::Closed);
        }
        let first = String::from_utf8_lossy(trim_line_end(&head)).into_owned();

        if Hello::is_hello(&first) {
            return self.accept_gateway(client, &first, peer).await;
        }

        let Some(line) = RequestLine::parse(&first) else {
            debug!("Malformed request line from {}: {:?}", peer, first);
            respond(client, &bad_request()).await?;
            return Ok(Route::BadRequest);
        };

        let mut header_text = String::new();
        loop {
            let remaining = self.max_header_bytes.saturating_sub(head.len()).max(1);
            let mut buf = Vec::new();
            if !self.read_raw_line(&mut client, &mut buf, remaining).await? {
                break;
            }
            head.extend_from_slice(&buf);
            let trimmed = trim_line_end(&buf);
            if trimmed.is_empty() {
                break;
            }
            header_text.push_str(&String::from_utf8_lossy(trimmed));
            header_text.push_str("\r\n");
        }
        let headers = HeaderBlock::parse(&header_text);

        if line.is_connect() {
            let (host, port) = split_host_port(&line.target, 443);
            self.handle_connect(client, host, port, peer).await
        } else {
            self.handle_http(client, &line, &headers, head, peer).await
        }
    }

    /// 读取一行原始字节；对端关闭时返回 false
    async fn read_raw_line(
        &self,
        client: &mut BufReader<TcpStream>,
        buf: &mut Vec<u8>,
        max: usize,
    ) -> Result<bool> {
        match timeout(self.idle_timeout, read_line_limited(client, buf, max)).await {
            Ok(Ok(Some(_))) => Ok(true),
            Ok(Ok(None)) => Ok(false),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ProxyError::timeout(self.idle_timeout)),
        }
    }

    /// 中继注册：口令不符或格式错误时不回复，直接关闭
    async fn accept_gateway(
        &self,
        mut client: BufReader<TcpStream>,
        first: &str,
        peer: SocketAddr,
    ) -> Result<Route> {
        let Some(gateway) = &self.gateway else {
            debug!("HELLO from {} but relay is disabled", peer);
            return Ok(Route::Closed);
        };

        let accepted = Hello::parse(first)
            .map(|hello| hello.accepts(&gateway.passkey))
            .unwrap_or(false);
        if !accepted {
            warn!("Gateway HELLO from {} rejected", peer);
            gateway
                .status
                .on_relay_status("Gateway HELLO rejected", false);
            return Ok(Route::Closed);
        }

        write_control_line(&mut client, OK_LINE).await?;

        // 连接连同已缓冲的字节一起交给会话
        let channel: BoxedStream = Box::new(client);
        let (session, control_reader) = GatewaySession::new(
            uuid::Uuid::new_v4().to_string(),
            peer.to_string(),
            channel,
            gateway.command_timeout,
        );
        gateway.manager.set(session.clone());
        gateway
            .status
            .on_relay_status("Relay client connected", true);
        info!("Relay client {} registered as {}", peer, session.id());

        session
            .run(control_reader, &gateway.manager, gateway.status.as_ref())
            .await;
        Ok(Route::Gateway)
    }

    async fn handle_connect(
        &self,
        mut client: BufReader<TcpStream>,
        host: String,
        port: u16,
        peer: SocketAddr,
    ) -> Result<Route> {
        // 拦截优先，其次是配置的出站策略
        if let Some(handler) = self.interceptors.iter().find(|h| h.supports(&host, port)) {
            info!("CONNECT {}:{} from {} intercepted", host, port, peer);
            handler.handle_connect(&host, port, Box::new(client)).await?;
            return Ok(Route::Intercepted);
        }

        let upstream = match self.tunnel_outbound.open_connect_tunnel(&host, port).await {
            Ok(upstream) => upstream,
            Err(e) => return outbound_failed(client, &host, port, e).await,
        };

        info!(
            "CONNECT {}:{} from {} via {}",
            host,
            port,
            peer,
            self.tunnel_outbound.name()
        );
        client.write_all(CONNECTION_ESTABLISHED).await?;
        client.flush().await?;

        let (up, down) = pump::relay(client, upstream, self.idle_timeout).await;
        debug!(
            "Tunnel {}:{} closed (sent: {} bytes, received: {} bytes)",
            host, port, up, down
        );
        Ok(Route::Tunnel)
    }

    async fn handle_http(
        &self,
        client: BufReader<TcpStream>,
        line: &RequestLine,
        headers: &HeaderBlock,
        head: Vec<u8>,
        peer: SocketAddr,
    ) -> Result<Route> {
        let Some((host, port)) = resolve_http_target(&line.target, headers) else {
            debug!("No host for {} {} from {}", line.method, line.target, peer);
            respond(client, &bad_request()).await?;
            return Ok(Route::BadRequest);
        };

        let mut upstream = match self.http_outbound.open_http_connection(&host, port).await {
            Ok(upstream) => upstream,
            Err(e) => return outbound_failed(client, &host, port, e).await,
        };

        info!(
            "{} {} from {} via {}",
            line.method,
            line.target,
            peer,
            self.http_outbound.name()
        );
        upstream.write_all(&head).await?;
        upstream.flush().await?;

        // 已缓冲的正文字节随后由转发泵送出
        let (up, down) = pump::relay(client, upstream, self.idle_timeout).await;
        debug!(
            "HTTP {}:{} closed (sent: {} bytes, received: {} bytes)",
            host,
            port,
            up + head.len() as u64,
            down
        );
        Ok(Route::Http)
    }
}

async fn respond(mut client: BufReader<TcpStream>, response: &[u8]) -> Result<()> {
    client.write_all(response).await?;
    client.flush().await?;
    client.shutdown().await.ok();
    Ok(())
}

/// 中继不可用时回复 503；直连失败只记录并关闭
async fn outbound_failed(
    client: BufReader<TcpStream>,
    host: &str,
    port: u16,
    error: ProxyError,
) -> Result<Route> {
    if error.is_relay_unavailable() {
        warn!("Relay unavailable for {}:{}: {}", host, port, error);
        respond(client, &service_unavailable(&error.to_string())).await?;
        return Ok(Route::Unavailable);
    }
    warn!("Failed to open {}:{}: {}", host, port, error);
    Ok(Route::Closed)
}
