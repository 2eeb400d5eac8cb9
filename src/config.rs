use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 环境变量前缀
pub const ENV_PREFIX: &str = "RELAY_MITM_";

/// 默认监听端口
pub const DEFAULT_PORT: u16 = 8888;
/// 重连延迟（秒）- 可通过环境变量 RELAY_MITM_RECONNECT_DELAY_SECS 覆盖
pub const RECONNECT_DELAY_SECS: u64 = 5;
/// 出站连接超时（秒）
pub const CONNECT_TIMEOUT_SECS: u64 = 15;
/// 隧道空闲超时（秒）
pub const IDLE_TIMEOUT_SECS: u64 = 300;
/// 中继命令应答等待时间（秒）
pub const COMMAND_TIMEOUT_SECS: u64 = 15;
/// 拦截时请求头最大字节数
pub const MAX_HEADER_BYTES: usize = 64 * 1024;
/// 拦截时允许改写的最大请求体字节数
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout() -> u64 {
    CONNECT_TIMEOUT_SECS
}

fn default_idle_timeout() -> u64 {
    IDLE_TIMEOUT_SECS
}

fn default_command_timeout() -> u64 {
    COMMAND_TIMEOUT_SECS
}

fn default_reconnect_delay() -> u64 {
    RECONNECT_DELAY_SECS
}

fn default_max_header_bytes() -> usize {
    MAX_HEADER_BYTES
}

fn default_max_body_bytes() -> usize {
    MAX_BODY_BYTES
}

fn default_true() -> bool {
    true
}

fn default_rewrite_model() -> String {
    "gpt-5-mini".to_string()
}

/// 本地代理（接受端）配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// 监听端口
    #[serde(default = "default_port")]
    pub bind_port: u16,
    /// 直连出站的连接超时（秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// 隧道空闲超时（秒）
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            bind_port: DEFAULT_PORT,
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            idle_timeout_secs: IDLE_TIMEOUT_SECS,
        }
    }
}

impl ServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// TLS 拦截配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MitmConfig {
    /// 是否启用拦截
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 向客户端出示的证书（PEM）
    pub cert_path: PathBuf,
    /// 证书对应的私钥（PEM）
    pub key_path: PathBuf,
    /// 需要拦截的主机名（大小写不敏感，为空表示所有 443 端口主机）
    #[serde(default)]
    pub hosts: Vec<String>,
    /// 额外信任的 CA 证书（在系统根证书之外）
    #[serde(default)]
    pub upstream_ca_path: Option<PathBuf>,
    /// 请求头最大字节数
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
    /// 允许改写的最大请求体字节数
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// 请求体改写规则
    #[serde(default)]
    pub rewrite: Option<RewriteConfig>,
}

/// 请求体改写配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 目标模型名（大小写不敏感）
    #[serde(default = "default_rewrite_model")]
    pub model: String,
    /// 目标 temperature（缺省则不修改）
    #[serde(default)]
    pub temperature: Option<f64>,
}

/// 中继（网关）接受端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// 是否接受中继注册并通过中继出站
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// HELLO 口令（为空表示不校验）
    #[serde(default)]
    pub passkey: String,
    /// 隧道命令等待应答的时间（秒）
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// 普通 HTTP 请求是否也经由中继转发
    #[serde(default = "default_true")]
    pub route_http: bool,
}

impl RelayConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// 接受端完整配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerFullConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub mitm: Option<MitmConfig>,
    #[serde(default)]
    pub relay: Option<RelayConfig>,
}

impl ServerFullConfig {
    /// 已启用的拦截配置
    pub fn active_mitm(&self) -> Option<&MitmConfig> {
        self.mitm.as_ref().filter(|m| m.enabled)
    }

    /// 已启用的中继配置
    pub fn active_relay(&self) -> Option<&RelayConfig> {
        self.relay.as_ref().filter(|r| r.enabled)
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.bind_addr.trim().is_empty() {
            bail!("bind_addr cannot be empty");
        }
        if self.server.connect_timeout_secs == 0 || self.server.idle_timeout_secs == 0 {
            bail!("connect_timeout_secs and idle_timeout_secs must be greater than 0");
        }

        if let Some(mitm) = self.active_mitm() {
            if mitm.cert_path.as_os_str().is_empty() || mitm.key_path.as_os_str().is_empty() {
                bail!("mitm.cert_path and mitm.key_path must be set when interception is enabled");
            }
            if mitm.max_header_bytes == 0 {
                bail!("mitm.max_header_bytes must be greater than 0");
            }
            if let Some(rewrite) = mitm.rewrite.as_ref().filter(|r| r.enabled) {
                if rewrite.model.trim().is_empty() {
                    bail!("mitm.rewrite.model cannot be empty when rewrite is enabled");
                }
                if let Some(t) = rewrite.temperature {
                    if !t.is_finite() {
                        bail!("mitm.rewrite.temperature must be a finite number");
                    }
                }
            }
        }

        if let Some(relay) = self.active_relay() {
            if relay.command_timeout_secs == 0 {
                bail!("relay.command_timeout_secs must be greater than 0");
            }
        }

        Ok(())
    }
}

/// 中继拨号端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// 接受端地址
    pub server_addr: String,
    /// 接受端端口
    #[serde(default = "default_port")]
    pub server_port: u16,
    /// HELLO 口令
    #[serde(default)]
    pub passkey: String,
    /// 重连等待（秒）
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// 隧道空闲超时（秒）
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl ClientConfig {
    pub fn new(server_addr: impl Into<String>, server_port: u16) -> Self {
        Self {
            server_addr: server_addr.into(),
            server_port,
            passkey: String::new(),
            reconnect_delay_secs: RECONNECT_DELAY_SECS,
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            idle_timeout_secs: IDLE_TIMEOUT_SECS,
        }
    }

    /// 重连延迟，环境变量优先
    pub fn reconnect_delay(&self) -> Duration {
        let secs = std::env::var(format!("{}RECONNECT_DELAY_SECS", ENV_PREFIX))
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.reconnect_delay_secs);
        Duration::from_secs(secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server_addr.trim().is_empty() {
            bail!("server_addr cannot be empty");
        }
        if self.server_port == 0 {
            bail!("server_port cannot be 0");
        }
        if self.passkey.chars().any(char::is_whitespace) {
            bail!("passkey cannot contain whitespace");
        }
        if self.connect_timeout_secs == 0 || self.idle_timeout_secs == 0 {
            bail!("connect_timeout_secs and idle_timeout_secs must be greater than 0");
        }
        Ok(())
    }
}

/// 展开路径中的 `~` 与环境变量
pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => path.to_path_buf(),
    }
}

/// 应用配置
#[derive(Debug, Clone)]
pub enum AppConfig {
    Server(ServerFullConfig),
    Client(ClientConfig),
}

impl AppConfig {
    /// 从文件加载配置（自动检测类型）
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path))?;
        let table: toml::Table =
            toml::from_str(&content).context("Failed to parse configuration")?;

        if table.contains_key("client") {
            Ok(AppConfig::Client(Self::parse_client_config(&content)?))
        } else {
            Ok(AppConfig::Server(Self::parse_server_config(&content)?))
        }
    }

    /// 从文件加载接受端配置
    pub fn load_server_config(path: &str) -> anyhow::Result<ServerFullConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path))?;
        Self::parse_server_config(&content)
    }

    /// 从文件加载拨号端配置
    pub fn load_client_config(path: &str) -> anyhow::Result<ClientConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path))?;
        Self::parse_client_config(&content)
    }

    pub fn parse_server_config(content: &str) -> anyhow::Result<ServerFullConfig> {
        let mut config: ServerFullConfig =
            toml::from_str(content).context("Failed to parse server configuration")?;
        if let Some(mitm) = config.mitm.as_mut() {
            mitm.cert_path = expand_path(&mitm.cert_path);
            mitm.key_path = expand_path(&mitm.key_path);
            mitm.upstream_ca_path = mitm.upstream_ca_path.as_deref().map(expand_path);
        }
        config
            .validate()
            .context("Server configuration validation failed")?;
        Ok(config)
    }

    pub fn parse_client_config(content: &str) -> anyhow::Result<ClientConfig> {
        #[derive(Deserialize)]
        struct ClientConfigWrapper {
            client: ClientConfig,
        }

        let wrapper: ClientConfigWrapper =
            toml::from_str(content).context("Failed to parse client configuration")?;
        wrapper
            .client
            .validate()
            .context("Client configuration validation failed")?;
        Ok(wrapper.client)
    }
}
