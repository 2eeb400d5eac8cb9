mod common;

use async_trait::async_trait;
use common::{read_response_head, relay_config, start_echo_server, TestProxy};
use relay_mitm_proxy::client::run_client;
use relay_mitm_proxy::config::{ClientConfig, ServerFullConfig};
use relay_mitm_proxy::mitm::InterceptionHandler;
use relay_mitm_proxy::observer::TracingObserver;
use relay_mitm_proxy::pump::BoxedStream;
use relay_mitm_proxy::server::{build_dispatcher, ServerDependencies};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn relay_server_config(passkey: &str) -> ServerFullConfig {
    ServerFullConfig {
        relay: Some(relay_config(passkey)),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_connect_direct_tunnel() {
    let (echo_port, _echo) = start_echo_server().await;
    let proxy = TestProxy::start(ServerFullConfig::default()).await;

    timeout(TEST_TIMEOUT, async {
        let mut stream = proxy.connect().await;
        let request = format!(
            "CONNECT 127.0.0.1:{0} HTTP/1.1\r\nHost: 127.0.0.1:{0}\r\n\r\n",
            echo_port
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let head = read_response_head(&mut stream).await;
        assert_eq!(head, "HTTP/1.1 200 Connection Established\r\n\r\n");

        stream.write_all(b"raw bytes \x00\x01\x02").await.unwrap();
        let mut buf = [0u8; 13];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"raw bytes \x00\x01\x02");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_malformed_request_line_gets_400() {
    let proxy = TestProxy::start(ServerFullConfig::default()).await;

    timeout(TEST_TIMEOUT, async {
        let mut stream = proxy.connect().await;
        stream.write_all(b"GARBAGE\r\n\r\n").await.unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(response.contains("Content-Length: "));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_no_relay_session_gets_503() {
    let proxy = TestProxy::start(relay_server_config("secret")).await;

    timeout(TEST_TIMEOUT, async {
        let mut stream = proxy.connect().await;
        stream
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));

        let (_, body) = response.split_once("\r\n\r\n").unwrap();
        assert_eq!(body, "No active relay session available");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_wrong_passkey_closes_silently() {
    let proxy = TestProxy::start(relay_server_config("secret")).await;

    timeout(TEST_TIMEOUT, async {
        let mut stream = proxy.connect().await;
        stream.write_all(b"HELLO wrongkey\r\n").await.unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        assert!(response.is_empty());
        assert!(!proxy.sessions.has_active());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_new_registration_replaces_previous() {
    let proxy = TestProxy::start(relay_server_config("secret")).await;

    timeout(TEST_TIMEOUT, async {
        let mut first = BufReader::new(proxy.connect().await);
        first.get_mut().write_all(b"HELLO secret\r\n").await.unwrap();
        let mut line = String::new();
        first.read_line(&mut line).await.unwrap();
        assert_eq!(line, "OK\r\n");
        assert!(proxy.wait_for_relay(40).await);
        let first_id = proxy.sessions.active().unwrap().id().to_string();

        let mut second = BufReader::new(proxy.connect().await);
        second.get_mut().write_all(b"HELLO secret\r\n").await.unwrap();
        line.clear();
        second.read_line(&mut line).await.unwrap();
        assert_eq!(line, "OK\r\n");

        // 旧会话的控制连接被关闭
        let mut rest = Vec::new();
        first.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let active = proxy.sessions.active_or_fail().unwrap();
        assert_ne!(active.id(), first_id);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_connect_through_relay_round_trip() {
    let (echo_port, _echo) = start_echo_server().await;
    let proxy = TestProxy::start(relay_server_config("secret")).await;

    let mut client_config = ClientConfig::new("127.0.0.1", proxy.addr.port());
    client_config.passkey = "secret".to_string();
    client_config.reconnect_delay_secs = 1;

    let shutdown = CancellationToken::new();
    let client = tokio::spawn(run_client(
        client_config,
        Arc::new(TracingObserver),
        shutdown.clone(),
    ));

    timeout(TEST_TIMEOUT, async {
        assert!(proxy.wait_for_relay(100).await, "relay never registered");

        let mut stream = proxy.connect().await;
        let request = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", echo_port);
        stream.write_all(request.as_bytes()).await.unwrap();
        let head = read_response_head(&mut stream).await;
        assert_eq!(head, "HTTP/1.1 200 Connection Established\r\n\r\n");

        // 顺序与内容都必须原样到达
        for chunk in [&b"first "[..], b"second ", b"third"] {
            stream.write_all(chunk).await.unwrap();
            let mut buf = vec![0u8; chunk.len()];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, chunk);
        }
    })
    .await
    .expect("test timed out");

    shutdown.cancel();
    client.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_plain_http_forwarded_verbatim() {
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_port = origin.local_addr().unwrap().port();
    let request = format!(
        "POST http://127.0.0.1:{0}/submit HTTP/1.1\r\nHost: 127.0.0.1:{0}\r\nContent-Length: 5\r\nX-Custom: Keep\r\n\r\nhello",
        origin_port
    );

    let expected = request.clone();
    let origin_task = tokio::spawn(async move {
        let (mut socket, _) = origin.accept().await.unwrap();
        let mut received = vec![0u8; expected.len()];
        socket.read_exact(&mut received).await.unwrap();
        assert_eq!(String::from_utf8(received).unwrap(), expected);
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
            .await
            .unwrap();
    });

    let proxy = TestProxy::start(ServerFullConfig::default()).await;

    timeout(TEST_TIMEOUT, async {
        let mut stream = proxy.connect().await;
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        assert_eq!(
            response,
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok"
        );
    })
    .await
    .expect("test timed out");

    origin_task.await.unwrap();
}

#[tokio::test]
async fn test_plain_http_without_host_gets_400() {
    let proxy = TestProxy::start(ServerFullConfig::default()).await;

    timeout(TEST_TIMEOUT, async {
        let mut stream = proxy.connect().await;
        stream.write_all(b"GET /index.html HTTP/1.1\r\n\r\n").await.unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 400"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_hello_without_relay_closes_silently() {
    let proxy = TestProxy::start(ServerFullConfig::default()).await;

    timeout(TEST_TIMEOUT, async {
        let mut stream = proxy.connect().await;
        stream.write_all(b"HELLO secret\r\n").await.unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        assert!(response.is_empty());
        assert!(!proxy.sessions.has_active());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_plain_http_request_line_bytes_preserved() {
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_port = origin.local_addr().unwrap().port();

    // 非 UTF-8 字节、行尾空格与仅 LF 的换行都必须原样到达
    let mut request = format!("GET http://127.0.0.1:{}/caf", origin_port).into_bytes();
    request.push(0xE9);
    request.extend_from_slice(b" HTTP/1.1 \nHost: x\n\n");

    let expected = request.clone();
    let origin_task = tokio::spawn(async move {
        let (mut socket, _) = origin.accept().await.unwrap();
        let mut received = vec![0u8; expected.len()];
        socket.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);
        socket
            .write_all(b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
    });

    let proxy = TestProxy::start(ServerFullConfig::default()).await;

    timeout(TEST_TIMEOUT, async {
        let mut stream = proxy.connect().await;
        stream.write_all(&request).await.unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 204"));
    })
    .await
    .expect("test timed out");

    origin_task.await.unwrap();
}

/// 只接管指定主机 443 端口的拦截器，向客户端写入标记后结束
struct MarkerInterceptor {
    host: &'static str,
}

const INTERCEPTED_MARKER: &[u8] = b"intercepted";

#[async_trait]
impl InterceptionHandler for MarkerInterceptor {
    fn supports(&self, host: &str, port: u16) -> bool {
        port == 443 && host.eq_ignore_ascii_case(self.host)
    }

    async fn handle_connect(
        &self,
        _host: &str,
        _port: u16,
        mut client: BoxedStream,
    ) -> relay_mitm_proxy::Result<()> {
        client.write_all(INTERCEPTED_MARKER).await?;
        client.shutdown().await?;
        Ok(())
    }
}

async fn start_intercepting_relay_proxy() -> TestProxy {
    let deps = ServerDependencies::new();
    let dispatcher = build_dispatcher(&relay_server_config("secret"), &deps)
        .unwrap()
        .with_interceptor(Arc::new(MarkerInterceptor {
            host: "api.openai.com",
        }));
    TestProxy::start_with(dispatcher, deps.sessions.clone()).await
}

#[tokio::test]
async fn test_interception_takes_precedence_over_relay() {
    let proxy = start_intercepting_relay_proxy().await;

    timeout(TEST_TIMEOUT, async {
        // 没有中继会话，但拦截目标不走中继，因此不是 503
        let mut stream = proxy.connect().await;
        stream
            .write_all(b"CONNECT API.openai.com:443 HTTP/1.1\r\nHost: api.openai.com:443\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, INTERCEPTED_MARKER);
        assert!(!proxy.sessions.has_active());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_unsupported_targets_fall_through_to_relay() {
    let proxy = start_intercepting_relay_proxy().await;

    timeout(TEST_TIMEOUT, async {
        for target in ["api.openai.com:8443", "example.com:443"] {
            let mut stream = proxy.connect().await;
            let request = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", target);
            stream.write_all(request.as_bytes()).await.unwrap();

            let mut response = Vec::new();
            stream.read_to_end(&mut response).await.unwrap();
            let response = String::from_utf8(response).unwrap();
            assert!(
                response.starts_with("HTTP/1.1 503 Service Unavailable\r\n"),
                "{} was not sent to the relay: {}",
                target,
                response
            );
        }
    })
    .await
    .expect("test timed out");
}
