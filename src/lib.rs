/// relay-mitm-proxy 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod cli;
pub mod client;
pub mod config;
pub mod control_protocol;
pub mod error;
pub mod http;
pub mod mitm;
pub mod observer;
pub mod outbound;
pub mod pump;
pub mod server;
pub mod tls;

// 重新导出常用类型
pub use config::{AppConfig, ClientConfig, ServerFullConfig};
pub use error::{ProxyError, Result};
pub use mitm::{InterceptionHandler, RewriteRule, TlsInterceptionEngine};
pub use observer::{RelayStatusObserver, TracingObserver, TrafficObserver};
pub use outbound::{DirectConnectionProvider, OutboundConnectionProvider, RelayedConnectionProvider};
pub use server::{ConnectionDispatcher, GatewaySessionManager, ProxyServer};
