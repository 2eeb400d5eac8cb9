/// 中继控制通道协议 - 基于文本行
///
/// 每条消息是一行以 CRLF 结尾的文本：
///
/// ```text
/// 拨号端 -> 接受端 : HELLO [passkey]
/// 接受端 -> 拨号端 : OK                      （握手失败时直接关闭连接，不回复）
/// 接受端 -> 拨号端 : <CONNECT|HTTP> <host> <port>
/// 拨号端 -> 接受端 : OK | ERROR              （OK 之后的字节都是隧道数据）
/// ```
use crate::http::{read_line_limited, trim_line_end};
use std::fmt;
use std::io;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};

/// 控制行最大长度
pub const MAX_CONTROL_LINE: usize = 1024;

/// 握手与命令应答中的确认
pub const OK_LINE: &str = "OK";

/// 拨号端无法建立本地连接时的应答
pub const ERROR_LINE: &str = "ERROR";

/// 握手消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub passkey: Option<String>,
}

impl Hello {
    pub fn new(passkey: &str) -> Self {
        let passkey = passkey.trim();
        Self {
            passkey: (!passkey.is_empty()).then(|| passkey.to_string()),
        }
    }

    /// 是否为握手行（调度器据此选择网关路径）
    pub fn is_hello(line: &str) -> bool {
        line.starts_with("HELLO")
    }

    /// 解析 `HELLO` 或 `HELLO <passkey>`，其他形式视为格式错误
    pub fn parse(line: &str) -> Option<Self> {
        let rest = line.trim_end().strip_prefix("HELLO")?;
        if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
            return None;
        }
        let mut tokens = rest.split_whitespace();
        let passkey = tokens.next().map(str::to_string);
        if tokens.next().is_some() {
            return None;
        }
        Some(Self { passkey })
    }

    /// 与配置的口令比较；配置为空时接受任何握手
    pub fn accepts(&self, expected: &str) -> bool {
        let expected = expected.trim();
        expected.is_empty() || self.passkey.as_deref() == Some(expected)
    }

    pub fn encode(&self) -> String {
        match &self.passkey {
            Some(key) => format!("HELLO {}\r\n", key),
            None => "HELLO\r\n".to_string(),
        }
    }
}

/// 隧道命令类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelKind {
    /// HTTPS CONNECT 隧道
    Connect,
    /// 普通 HTTP 转发
    Http,
}

impl TunnelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelKind::Connect => "CONNECT",
            TunnelKind::Http => "HTTP",
        }
    }

    /// 从字符串解析
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CONNECT" => Some(TunnelKind::Connect),
            "HTTP" => Some(TunnelKind::Http),
            _ => None,
        }
    }
}

impl fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 隧道命令：`<CONNECT|HTTP> <host> <port>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelCommand {
    pub kind: TunnelKind,
    pub host: String,
    pub port: u16,
}

impl TunnelCommand {
    pub fn new(kind: TunnelKind, host: impl Into<String>, port: u16) -> Self {
        Self {
            kind,
            host: host.into(),
            port,
        }
    }

    pub fn parse(line: &str) -> Result<Self, String> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(format!("invalid command: {}", line));
        }
        let kind =
            TunnelKind::parse(parts[0]).ok_or_else(|| format!("unknown command: {}", parts[0]))?;
        let port = parts[2]
            .parse()
            .map_err(|_| format!("invalid port in command: {}", line))?;
        Ok(Self::new(kind, parts[1], port))
    }

    pub fn encode(&self) -> String {
        format!("{} {} {}\r\n", self.kind, self.host, self.port)
    }

    /// `host:port` 形式，IPv6 地址加方括号
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// 命令应答
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelReply {
    /// 隧道就绪
    Ok,
    /// 其他任何行都视为错误
    Error(String),
}

impl TunnelReply {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line == OK_LINE {
            TunnelReply::Ok
        } else {
            TunnelReply::Error(line.to_string())
        }
    }
}

/// 读取一条控制行（去掉 CRLF）；对端关闭时返回 None
pub async fn read_control_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::with_capacity(64);
    match read_line_limited(reader, &mut buf, MAX_CONTROL_LINE).await? {
        Some(_) => Ok(Some(String::from_utf8_lossy(trim_line_end(&buf)).into_owned())),
        None => Ok(None),
    }
}

/// 写入一条控制行并刷新
pub async fn write_control_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(line.as_bytes()).await?;
    if !line.ends_with("\r\n") {
        writer.write_all(b"\r\n").await?;
    }
    writer.flush().await
}
