/// 流量与中继状态观察者
///
/// 控制界面之类的外部协作者通过这两个接口获知拦截到的流量
/// 以及中继连接状态；默认实现只写日志。
use tracing::{debug, info};

/// 拦截流量观察者
pub trait TrafficObserver: Send + Sync {
    /// `direction` 例如 "client->server headers"；`is_json` 为 true 时可格式化显示
    fn on_traffic(&self, direction: &str, text: &str, is_json: bool);
}

/// 中继状态观察者
pub trait RelayStatusObserver: Send + Sync {
    fn on_relay_status(&self, message: &str, connected: bool);
}

/// 日志输出的最大字符数
const MAX_LOGGED_CHARS: usize = 300;

/// 基于 tracing 的默认观察者
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl TrafficObserver for TracingObserver {
    fn on_traffic(&self, direction: &str, text: &str, is_json: bool) {
        if is_json {
            debug!("[MITM][{}] JSON len={}", direction, text.len());
        } else {
            debug!("[MITM][{}] {}", direction, truncate(text, MAX_LOGGED_CHARS));
        }
    }
}

impl RelayStatusObserver for TracingObserver {
    fn on_relay_status(&self, message: &str, connected: bool) {
        info!("Relay status: {} (connected={})", message, connected);
    }
}

/// 粗略判断文本是否为 JSON
pub fn looks_like_json(text: &str) -> bool {
    let t = text.trim();
    (t.starts_with('{') && t.ends_with('}')) || (t.starts_with('[') && t.ends_with(']'))
}

fn truncate(text: &str, max: usize) -> std::borrow::Cow<'_, str> {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]).into(),
        None => text.into(),
    }
}
