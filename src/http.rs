/// 最小化的 HTTP/1.1 解析工具
///
/// 只覆盖代理需要的部分：请求行、头部块、有界读取与错误响应。
/// 不处理分块编码、流水线或 trailer。
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};

/// CONNECT 成功确认
pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// 请求行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub version: String,
}

impl RequestLine {
    /// 解析 `<METHOD> <TARGET> <VERSION>`，少于三个字段返回 None
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let method = parts.next()?;
        let target = parts.next()?;
        let version = parts.next()?;
        Some(Self {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
        })
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }
}

/// 有序的头部块，允许重复字段
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderBlock {
    entries: Vec<(String, String)>,
}

impl HeaderBlock {
    /// 解析 CRLF 分隔的头部行（请求行之后、空行之前的部分）
    pub fn parse(text: &str) -> Self {
        let entries = text
            .split("\r\n")
            .filter_map(|line| {
                let colon = line.find(':')?;
                let name = line[..colon].trim();
                if name.is_empty() {
                    return None;
                }
                Some((name.to_string(), line[colon + 1..].trim().to_string()))
            })
            .collect();
        Self { entries }
    }

    /// 大小写不敏感的查找，返回第一个匹配值
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Content-Length；缺失或无法解析时返回 None
    pub fn content_length(&self) -> Option<usize> {
        self.get("content-length")?.parse().ok()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 解析后的请求头（请求行 + 头部块）
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub line: RequestLine,
    pub headers: HeaderBlock,
}

impl RequestHead {
    /// 从完整的头部文本（含结尾空行）解析
    pub fn parse(head: &str) -> Option<Self> {
        let (first, rest) = head.split_once("\r\n").unwrap_or((head, ""));
        Some(Self {
            line: RequestLine::parse(first)?,
            headers: HeaderBlock::parse(rest),
        })
    }
}

/// 查找头部结束位置（返回空行之后的偏移）
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
        .map(|pos| pos + HEAD_TERMINATOR.len())
}

/// 有界读取头部的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadStatus {
    /// 读到空行，值为头部长度（可能已多读了部分正文）
    Complete(usize),
    /// 超过上限仍未读到空行
    TooLarge,
    /// 对端在头部结束前关闭
    Eof,
}

/// 从未缓冲的流读取到头部结束
///
/// 所有读到的字节都保留在 `buf` 中，调用方在失败时可以原样转发。
pub async fn read_head<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> io::Result<HeadStatus>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(end) = find_head_end(buf) {
            return Ok(HeadStatus::Complete(end));
        }
        if buf.len() >= max {
            return Ok(HeadStatus::TooLarge);
        }
        let want = chunk.len().min(max - buf.len());
        let n = reader.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Ok(HeadStatus::Eof);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// 从缓冲流读取一行（含 CRLF），最多 `max` 字节
///
/// 返回 None 表示对端已关闭；末行可能不带换行符。
pub async fn read_line_limited<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> io::Result<Option<usize>>
where
    R: AsyncBufRead + Unpin,
{
    let start = buf.len();
    let n = (&mut *reader).take(max as u64).read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if n >= max && buf[start..].last() != Some(&b'\n') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line exceeds {} bytes", max),
        ));
    }
    Ok(Some(n))
}

/// 去掉行尾的 CR/LF
pub fn trim_line_end(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\r' | b'\n') {
        end -= 1;
    }
    &line[..end]
}

/// 用新的长度替换 Content-Length（不存在则追加），返回新的头部
pub fn replace_content_length(head: &str, new_len: usize) -> String {
    let headers_only = head.strip_suffix("\r\n\r\n").unwrap_or(head);

    let mut out = String::with_capacity(head.len() + 8);
    let mut replaced = false;
    for line in headers_only.split("\r\n") {
        let is_length = line
            .split_once(':')
            .map(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
            .unwrap_or(false);
        if is_length {
            if !replaced {
                out.push_str(&format!("Content-Length: {}\r\n", new_len));
                replaced = true;
            }
            continue;
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    if !replaced {
        out.push_str(&format!("Content-Length: {}\r\n", new_len));
    }
    out.push_str("\r\n");
    out
}

/// 拆分 `host:port`，端口缺失或无法解析时使用默认值
///
/// 支持 `[v6addr]:port` 形式，返回的主机不含方括号。
pub fn split_host_port(target: &str, default_port: u16) -> (String, u16) {
    if let Some(rest) = target.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (host.to_string(), port);
        }
    }

    match target.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            (host.to_string(), port.parse().unwrap_or(default_port))
        }
        _ => (target.to_string(), default_port),
    }
}

/// 确定普通 HTTP 请求的目标：优先绝对 URI，其次 Host 头
pub fn resolve_http_target(target: &str, headers: &HeaderBlock) -> Option<(String, u16)> {
    let lower = target.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        if let Ok(url) = url::Url::parse(target) {
            if let Some(host) = url.host_str() {
                let host = host.trim_start_matches('[').trim_end_matches(']');
                let port = url.port_or_known_default().unwrap_or(80);
                return Some((host.to_string(), port));
            }
        }
    }

    let host = headers.get("host").filter(|h| !h.is_empty())?;
    let (host, port) = split_host_port(host, 80);
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}

/// 400 响应
pub fn bad_request() -> Vec<u8> {
    plain_response("400 Bad Request", "Bad Request")
}

/// 503 响应
pub fn service_unavailable(body: &str) -> Vec<u8> {
    plain_response("503 Service Unavailable", body)
}

fn plain_response(status: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn test_request_line() {
        let line = RequestLine::parse("CONNECT example.com:443 HTTP/1.1").unwrap();
        assert!(line.is_connect());
        assert_eq!(line.target, "example.com:443");
        assert_eq!(line.version, "HTTP/1.1");

        assert!(RequestLine::parse("GET /").is_none());
        assert!(RequestLine::parse("").is_none());
    }

    #[test]
    fn test_header_block_lookup() {
        let headers = HeaderBlock::parse("Host: example.com\r\nX-A: 1\r\nx-a: 2\r\ncontent-length: 12");
        assert_eq!(headers.len(), 4);
        assert_eq!(headers.get("HOST"), Some("example.com"));
        assert_eq!(headers.get("X-A"), Some("1"));
        assert_eq!(headers.content_length(), Some(12));
        assert_eq!(HeaderBlock::default().content_length(), None);
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("example.com:8443", 443), ("example.com".into(), 8443));
        assert_eq!(split_host_port("example.com:abc", 443), ("example.com".into(), 443));
        assert_eq!(split_host_port("example.com", 443), ("example.com".into(), 443));
        assert_eq!(split_host_port("[::1]:8080", 443), ("::1".into(), 8080));
        assert_eq!(split_host_port("[::1]", 80), ("::1".into(), 80));
    }

    #[test]
    fn test_resolve_http_target() {
        let empty = HeaderBlock::default();
        assert_eq!(
            resolve_http_target("http://example.com/path", &empty),
            Some(("example.com".into(), 80))
        );
        assert_eq!(
            resolve_http_target("https://example.com/", &empty),
            Some(("example.com".into(), 443))
        );
        assert_eq!(
            resolve_http_target("http://example.com:8080/", &empty),
            Some(("example.com".into(), 8080))
        );

        let headers = HeaderBlock::parse("Host: internal:8081");
        assert_eq!(
            resolve_http_target("/index.html", &headers),
            Some(("internal".into(), 8081))
        );
        assert_eq!(resolve_http_target("/index.html", &empty), None);
    }

    #[test]
    fn test_replace_content_length() {
        let head = "POST /v1/chat/completions HTTP/1.1\r\nHost: a\r\nContent-Length: 10\r\n\r\n";
        let replaced = replace_content_length(head, 42);
        assert_eq!(
            replaced,
            "POST /v1/chat/completions HTTP/1.1\r\nHost: a\r\nContent-Length: 42\r\n\r\n"
        );

        let appended = replace_content_length("GET / HTTP/1.1\r\nHost: a\r\n\r\n", 3);
        assert!(appended.ends_with("Content-Length: 3\r\n\r\n"));
    }

    #[test]
    fn test_error_responses_carry_length() {
        let body = "Relay session is busy with another tunnel";
        let resp = String::from_utf8(service_unavailable(body)).unwrap();
        assert!(resp.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
        assert!(resp.contains(&format!("Content-Length: {}", body.len())));
        assert!(resp.ends_with(body));

        let resp = String::from_utf8(bad_request()).unwrap();
        assert!(resp.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn test_read_head_complete_with_body_prefix() {
        let data = b"POST / HTTP/1.1\r\nContent-Length: 4\r\n\r\nbody";
        let mut reader = &data[..];
        let mut buf = Vec::new();
        let status = read_head(&mut reader, &mut buf, 1024).await.unwrap();
        let HeadStatus::Complete(end) = status else {
            panic!("unexpected status {:?}", status);
        };
        assert_eq!(&buf[end..], b"body");
    }

    #[tokio::test]
    async fn test_read_head_limits() {
        let data = vec![b'a'; 100];
        let mut reader = &data[..];
        let mut buf = Vec::new();
        assert_eq!(read_head(&mut reader, &mut buf, 10).await.unwrap(), HeadStatus::TooLarge);
        assert_eq!(buf.len(), 10);

        let mut reader = &b"GET / HTTP/1.1\r\n"[..];
        let mut buf = Vec::new();
        assert_eq!(read_head(&mut reader, &mut buf, 1024).await.unwrap(), HeadStatus::Eof);
    }

    #[tokio::test]
    async fn test_read_line_limited() {
        let mut reader = BufReader::new(&b"HELLO secret\r\nrest"[..]);
        let mut buf = Vec::new();
        read_line_limited(&mut reader, &mut buf, 64).await.unwrap();
        assert_eq!(trim_line_end(&buf), b"HELLO secret");

        let mut reader = BufReader::new(&b"aaaaaaaaaaaaaaaa"[..]);
        let mut buf = Vec::new();
        assert!(read_line_limited(&mut reader, &mut buf, 8).await.is_err());

        let mut reader = BufReader::new(&b""[..]);
        let mut buf = Vec::new();
        assert!(read_line_limited(&mut reader, &mut buf, 8).await.unwrap().is_none());
    }
}
