//! Common utilities for integration tests
#![allow(dead_code)]

use relay_mitm_proxy::config::{RelayConfig, ServerFullConfig};
use relay_mitm_proxy::server::{
    ConnectionDispatcher, GatewaySessionManager, ProxyServer, ServerDependencies,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Generate temporary certificate files for testing
pub fn generate_test_certs() -> (PathBuf, PathBuf) {
    use relay_mitm_proxy::tls;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let temp_dir = std::env::temp_dir();
    let counter = COUNTER.fetch_add(1, Ordering::SeqCst);
    let unique_id = format!("{}-{}-{}", uuid::Uuid::new_v4(), counter, std::process::id());

    let cert_path = temp_dir.join(format!("test-cert-{}.pem", unique_id));
    let key_path = temp_dir.join(format!("test-key-{}.pem", unique_id));

    tls::generate_self_signed_cert(
        "localhost",
        &["localhost".to_string()],
        &cert_path,
        &key_path,
    )
    .expect("Failed to generate test certificates");

    (cert_path, key_path)
}

/// Create a simple echo server on an ephemeral port
pub async fn start_echo_server() -> (u16, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind echo server");
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    (port, handle)
}

/// 以临时端口启动本地代理
pub struct TestProxy {
    pub addr: SocketAddr,
    pub sessions: Arc<GatewaySessionManager>,
    shutdown: CancellationToken,
}

impl TestProxy {
    pub async fn start(mut config: ServerFullConfig) -> Self {
        config.server.bind_addr = "127.0.0.1".to_string();
        config.server.bind_port = 0;

        let server = ProxyServer::bind(&config, ServerDependencies::new())
            .await
            .expect("Failed to bind proxy");
        Self::spawn(server)
    }

    /// 使用自行组装的调度器启动
    pub async fn start_with(
        dispatcher: ConnectionDispatcher,
        sessions: Arc<GatewaySessionManager>,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind proxy");
        Self::spawn(ProxyServer::from_parts(listener, dispatcher, sessions))
    }

    fn spawn(server: ProxyServer) -> Self {
        let addr = server.local_addr().unwrap();
        let sessions = server.sessions().clone();

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move {
            server.run(token).await.expect("proxy failed");
        });

        Self {
            addr,
            sessions,
            shutdown,
        }
    }

    pub async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr)
            .await
            .expect("Failed to connect to proxy")
    }

    /// 等待中继会话注册完成
    pub async fn wait_for_relay(&self, max_attempts: u32) -> bool {
        for _ in 0..max_attempts {
            if self.sessions.has_active() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub fn relay_config(passkey: &str) -> RelayConfig {
    RelayConfig {
        enabled: true,
        passkey: passkey.to_string(),
        command_timeout_secs: 5,
        route_http: true,
    }
}

/// 读取直到头部结束（`\r\n\r\n`），返回头部文本
pub async fn read_response_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.expect("read failed");
        if n == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// Cleanup function for test resources
pub struct TestCleanup {
    cert_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
}

impl TestCleanup {
    pub fn new(cert_path: PathBuf, key_path: PathBuf) -> Self {
        Self {
            cert_path: Some(cert_path),
            key_path: Some(key_path),
        }
    }
}

impl Drop for TestCleanup {
    fn drop(&mut self) {
        if let Some(cert) = self.cert_path.take() {
            let _ = std::fs::remove_file(cert);
        }
        if let Some(key) = self.key_path.take() {
            let _ = std::fs::remove_file(key);
        }
    }
}
