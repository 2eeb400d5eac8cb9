/// TLS 拦截
///
/// 对受支持的 CONNECT 目标：先连上真实目标（TLS 客户端），再在客户端连接上
/// 以本地证书完成 TLS 服务端握手，尽力改写第一个请求，然后双向转发。
mod rewrite;

pub use rewrite::{Rewrite, RewriteRule, CHAT_COMPLETIONS_PATH};

use crate::config::{MitmConfig, ServerConfig};
use crate::error::{ProxyError, Result};
use crate::http::{read_head, replace_content_length, HeadStatus, RequestHead, CONNECTION_ESTABLISHED};
use crate::observer::{looks_like_json, TracingObserver, TrafficObserver};
use crate::outbound::connect_with_timeout;
use crate::pump::{self, BoxedStream};
use crate::tls::{load_mitm_server_config, load_upstream_client_config};
use crate::config::expand_path;
use anyhow::Context;
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_rustls::{rustls, TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

/// 只拦截 HTTPS 默认端口
pub const MITM_PORT: u16 = 443;

/// 拦截处理器
#[async_trait]
pub trait InterceptionHandler: Send + Sync {
    /// 是否接管该 CONNECT 目标
    fn supports(&self, host: &str, port: u16) -> bool;

    /// 接管客户端连接，负责确认、握手与关闭
    async fn handle_connect(&self, host: &str, port: u16, client: BoxedStream) -> Result<()>;
}

/// 第一个请求的读取上限
#[derive(Debug, Clone, Copy)]
pub struct InterceptLimits {
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
}

impl Default for InterceptLimits {
    fn default() -> Self {
        Self {
            max_header_bytes: crate::config::MAX_HEADER_BYTES,
            max_body_bytes: crate::config::MAX_BODY_BYTES,
        }
    }
}

/// TLS 拦截引擎
pub struct TlsInterceptionEngine {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
    hosts: HashSet<String>,
    rule: Option<RewriteRule>,
    limits: InterceptLimits,
    observer: Arc<dyn TrafficObserver>,
    connect_timeout: Duration,
    idle_timeout: Duration,
}

impl TlsInterceptionEngine {
    /// 创建拦截引擎
    ///
    /// `hosts` 为空表示拦截所有 443 端口的目标。
    pub fn new(
        server_config: Arc<rustls::ServerConfig>,
        client_config: Arc<rustls::ClientConfig>,
        hosts: &[String],
    ) -> Self {
        Self {
            acceptor: TlsAcceptor::from(server_config),
            connector: TlsConnector::from(client_config),
            hosts: hosts
                .iter()
                .map(|h| h.trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
            rule: None,
            limits: InterceptLimits::default(),
            observer: Arc::new(TracingObserver),
            connect_timeout: Duration::from_secs(crate::config::CONNECT_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(crate::config::IDLE_TIMEOUT_SECS),
        }
    }

    /// 从配置文件加载证书并创建引擎
    pub fn from_config(mitm: &MitmConfig, server: &ServerConfig) -> anyhow::Result<Self> {
        let cert_path = expand_path(&mitm.cert_path);
        let key_path = expand_path(&mitm.key_path);
        let server_config = load_mitm_server_config(&cert_path, &key_path)
            .context("Failed to load MITM certificate")?;

        let extra_ca = mitm.upstream_ca_path.as_deref().map(expand_path);
        let client_config = load_upstream_client_config(extra_ca.as_deref())
            .context("Failed to build upstream TLS config")?;

        let rule = mitm.rewrite.as_ref().and_then(RewriteRule::from_config);
        if let Some(rule) = &rule {
            info!(
                "Rewrite enabled: model={} temperature={:?}",
                rule.model, rule.temperature
            );
        }

        Ok(Self::new(server_config, client_config, &mitm.hosts)
            .with_rewrite(rule)
            .with_limits(InterceptLimits {
                max_header_bytes: mitm.max_header_bytes,
                max_body_bytes: mitm.max_body_bytes,
            })
            .with_timeouts(server.connect_timeout(), server.idle_timeout()))
    }

    pub fn with_rewrite(mut self, rule: Option<RewriteRule>) -> Self {
        self.rule = rule;
        self
    }

    pub fn with_limits(mut self, limits: InterceptLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn TrafficObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_timeouts(mut self, connect_timeout: Duration, idle_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.idle_timeout = idle_timeout;
        self
    }

    async fn connect_upstream(
        &self,
        host: &str,
        port: u16,
    ) -> Result<tokio_rustls::client::TlsStream<tokio::net::TcpStream>> {
        let server_name = ServerName::try_from(host)
            .map_err(|e| ProxyError::Tls(format!("Invalid server name {}: {}", host, e)))?
            .to_owned();

        let tcp = connect_with_timeout(host, port, self.connect_timeout).await?;
        match timeout(self.connect_timeout, self.connector.connect(server_name, tcp)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(ProxyError::Tls(format!(
                "Upstream TLS handshake with {}:{} failed: {}",
                host, port, e
            ))),
            Err(_) => Err(ProxyError::timeout(self.connect_timeout)),
        }
    }

    /// 读取第一个请求并按规则改写
    ///
    /// 从不失败：任何问题都退化为原样返回已读取的字节，由后续转发继续处理。
    pub async fn prepare_first_request<R>(&self, reader: &mut R) -> Vec<u8>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = Vec::with_capacity(4096);

        let head_end = match timeout(
            self.idle_timeout,
            read_head(reader, &mut buf, self.limits.max_header_bytes),
        )
        .await
        {
            Ok(Ok(HeadStatus::Complete(end))) => end,
            Ok(Ok(HeadStatus::TooLarge)) => {
                debug!("[MITM] Request head exceeds {} bytes", self.limits.max_header_bytes);
                return buf;
            }
            Ok(Ok(HeadStatus::Eof)) => {
                debug!("[MITM] Failed to read full request headers");
                return buf;
            }
            Ok(Err(e)) => {
                debug!("[MITM] Error reading request headers: {}", e);
                return buf;
            }
            Err(_) => return buf,
        };

        let head = latin1_decode(&buf[..head_end]);
        self.observer
            .on_traffic("client->server headers", &head, false);

        let Some(request) = RequestHead::parse(&head) else {
            return buf;
        };
        let content_length = match request.headers.content_length() {
            Some(n) if n > 0 && n <= self.limits.max_body_bytes => n,
            _ => return buf,
        };

        let body_end = head_end + content_length;
        let mut chunk = [0u8; 8192];
        while buf.len() < body_end {
            let want = chunk.len().min(body_end - buf.len());
            match timeout(self.idle_timeout, reader.read(&mut chunk[..want])).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => {
                    debug!("[MITM] Failed to read full request body");
                    return buf;
                }
                Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            }
        }

        let Ok(body) = std::str::from_utf8(&buf[head_end..body_end]) else {
            self.observer
                .on_traffic("info", "request body is not valid UTF-8", false);
            return buf;
        };
        self.observer
            .on_traffic("client->server body", body, looks_like_json(body));

        let Some(rule) = &self.rule else {
            return buf;
        };
        if !RewriteRule::matches_request(&request.line.method, &request.line.target) {
            return buf;
        }

        match rule.apply(body) {
            Ok(Rewrite::Modified(patched)) => {
                info!("[MITM] Request body modified for model={}", rule.model);
                self.observer
                    .on_traffic("client->server body (modified)", &patched, true);

                let new_head = replace_content_length(&head, patched.len());
                let mut out = latin1_encode(&new_head);
                out.extend_from_slice(patched.as_bytes());
                out.extend_from_slice(&buf[body_end..]);
                out
            }
            Ok(Rewrite::Unchanged(reason)) => {
                debug!("[MITM] Body forwarded unchanged: {}", reason);
                buf
            }
            Err(e) => {
                self.observer
                    .on_traffic("info", &format!("JSON patch failed: {}", e), false);
                buf
            }
        }
    }
}

#[async_trait]
impl InterceptionHandler for TlsInterceptionEngine {
    fn supports(&self, host: &str, port: u16) -> bool {
        port == MITM_PORT
            && (self.hosts.is_empty() || self.hosts.contains(&host.to_ascii_lowercase()))
    }

    async fn handle_connect(&self, host: &str, port: u16, mut client: BoxedStream) -> Result<()> {
        let mut upstream = self.connect_upstream(host, port).await?;
        info!("[MITM] Connected TLS to {}:{}", host, port);

        // 明文确认必须先于客户端握手送达
        client.write_all(CONNECTION_ESTABLISHED).await?;
        client.flush().await?;

        let mut client_tls = match timeout(self.connect_timeout, self.acceptor.accept(client)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                upstream.shutdown().await.ok();
                return Err(ProxyError::Tls(format!(
                    "Client TLS handshake for {} failed: {}",
                    host, e
                )));
            }
            Err(_) => {
                upstream.shutdown().await.ok();
                return Err(ProxyError::timeout(self.connect_timeout));
            }
        };
        info!("[MITM] Established TLS with client for {}:{}", host, port);

        let first = self.prepare_first_request(&mut client_tls).await;
        if !first.is_empty() {
            if let Err(e) = upstream.write_all(&first).await {
                warn!("[MITM] Failed to forward first request to {}: {}", host, e);
                client_tls.shutdown().await.ok();
                return Err(e.into());
            }
            upstream.flush().await?;
        }

        let (up, down) = pump::relay(client_tls, upstream, self.idle_timeout).await;
        debug!(
            "[MITM] Tunnel to {}:{} closed (sent: {} bytes, received: {} bytes)",
            host,
            port,
            up + first.len() as u64,
            down
        );
        Ok(())
    }
}

/// 头部按 ISO-8859-1 处理，保证字节可以原样还原
fn latin1_decode(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn latin1_encode(text: &str) -> Vec<u8> {
    text.chars().map(|c| c as u32 as u8).collect()
}
