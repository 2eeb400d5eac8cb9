mod control_channel;
mod dispatcher;
mod registry;

pub use control_channel::{ControlReader, GatewaySession, RelayedStream, SessionState};
pub use dispatcher::{ConnectionDispatcher, GatewayAcceptor, Route};
pub use registry::GatewaySessionManager;

use crate::config::ServerFullConfig;
use crate::mitm::TlsInterceptionEngine;
use crate::observer::{RelayStatusObserver, TracingObserver, TrafficObserver};
use crate::outbound::{DirectConnectionProvider, OutboundConnectionProvider, RelayedConnectionProvider};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// 服务器依赖（用于依赖注入）
pub struct ServerDependencies {
    pub sessions: Arc<GatewaySessionManager>,
    pub traffic: Arc<dyn TrafficObserver>,
    pub status: Arc<dyn RelayStatusObserver>,
}

impl ServerDependencies {
    /// 创建默认依赖（观察者只写日志）
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(GatewaySessionManager::new()),
            traffic: Arc::new(TracingObserver),
            status: Arc::new(TracingObserver),
        }
    }
}

impl Default for ServerDependencies {
    fn default() -> Self {
        Self::new()
    }
}

/// 根据配置组装调度器
pub fn build_dispatcher(
    config: &ServerFullConfig,
    deps: &ServerDependencies,
) -> Result<ConnectionDispatcher> {
    let direct: Arc<dyn OutboundConnectionProvider> =
        Arc::new(DirectConnectionProvider::new(config.server.connect_timeout()));

    let mut dispatcher = match config.active_relay() {
        Some(relay) => {
            let relayed: Arc<dyn OutboundConnectionProvider> =
                Arc::new(RelayedConnectionProvider::new(deps.sessions.clone()));
            let http = if relay.route_http {
                relayed.clone()
            } else {
                direct.clone()
            };
            info!(
                "Relay enabled (passkey: {}, plain HTTP via {})",
                if relay.passkey.trim().is_empty() { "none" } else { "set" },
                http.name()
            );
            ConnectionDispatcher::new(relayed, http).with_gateway(GatewayAcceptor {
                manager: deps.sessions.clone(),
                passkey: relay.passkey.clone(),
                command_timeout: relay.command_timeout(),
                status: deps.status.clone(),
            })
        }
        None => ConnectionDispatcher::new(direct.clone(), direct),
    };

    if let Some(mitm) = config.active_mitm() {
        let engine = TlsInterceptionEngine::from_config(mitm, &config.server)?
            .with_observer(deps.traffic.clone());
        info!(
            "TLS interception enabled for {}",
            if mitm.hosts.is_empty() {
                "all port-443 hosts".to_string()
            } else {
                mitm.hosts.join(", ")
            }
        );
        dispatcher = dispatcher.with_interceptor(Arc::new(engine));
    }

    Ok(dispatcher.with_idle_timeout(config.server.idle_timeout()))
}

/// 本地代理监听器
pub struct ProxyServer {
    listener: TcpListener,
    dispatcher: Arc<ConnectionDispatcher>,
    sessions: Arc<GatewaySessionManager>,
}

impl ProxyServer {
    /// 按配置绑定监听地址
    pub async fn bind(config: &ServerFullConfig, deps: ServerDependencies) -> Result<Self> {
        let dispatcher = build_dispatcher(config, &deps)?;
        let addr = format!("{}:{}", config.server.bind_addr, config.server.bind_port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind proxy listener on {}", addr))?;
        Ok(Self::from_parts(listener, dispatcher, deps.sessions))
    }

    pub fn from_parts(
        listener: TcpListener,
        dispatcher: ConnectionDispatcher,
        sessions: Arc<GatewaySessionManager>,
    ) -> Self {
        Self {
            listener,
            dispatcher: Arc::new(dispatcher),
            sessions,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn sessions(&self) -> &Arc<GatewaySessionManager> {
        &self.sessions
    }

    /// 接受连接直到取消；每个连接一个任务
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!("Proxy listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, peer)) => {
                            debug!("Accepted connection from {}", peer);
                            let dispatcher = Arc::clone(&self.dispatcher);
                            tokio::spawn(async move {
                                let route = dispatcher.dispatch(socket, peer).await;
                                debug!("Connection from {} finished: {:?}", peer, route);
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping proxy...");
                    break;
                }
            }
        }

        if let Some(session) = self.sessions.active() {
            session.close();
        }
        info!("Proxy stopped gracefully");
        Ok(())
    }
}

/// 运行本地代理直到 Ctrl+C
pub async fn run_server(config: ServerFullConfig) -> Result<()> {
    info!(
        "Starting proxy on {}:{}",
        config.server.bind_addr, config.server.bind_port
    );
    let server = ProxyServer::bind(&config, ServerDependencies::new()).await?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_token.cancel();
        }
    });

    info!("Waiting for connections... (Press Ctrl+C to stop)");
    server.run(shutdown).await
}
