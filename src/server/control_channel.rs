use super::registry::GatewaySessionManager;
use crate::control_protocol::{read_control_line, TunnelCommand, TunnelKind, TunnelReply};
use crate::error::{ProxyError, Result};
use crate::observer::RelayStatusObserver;
use crate::pump::BoxedStream;
use parking_lot::Mutex as SyncMutex;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 控制通道的读端（只属于会话的运行循环）
pub type ControlReader = BufReader<ReadHalf<BoxedStream>>;

/// 控制通道的写端
pub type ControlWriter = WriteHalf<BoxedStream>;

/// 命令应答：成功时运行循环交出读端
type CommandOutcome = std::result::Result<ControlReader, String>;

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// 已注册，空闲
    Registered,
    /// 命令已发出，等待应答
    CommandInFlight,
    /// 控制通道正承载隧道数据
    Piping,
    Closed,
}

/// 接受端的中继会话
///
/// 运行循环是控制通道唯一的读者；发出命令的任务通过
/// 一次性通道等待运行循环转交的应答。
pub struct GatewaySession {
    id: String,
    remote_addr: String,
    alive: AtomicBool,
    busy: AtomicBool,
    piping: AtomicBool,
    command_timeout: Duration,
    writer: Mutex<Option<ControlWriter>>,
    pending: SyncMutex<Option<oneshot::Sender<CommandOutcome>>>,
    closed: CancellationToken,
}

impl GatewaySession {
    /// 在已完成握手的控制通道上创建会话，返回会话与其读端
    pub fn new(
        id: String,
        remote_addr: String,
        channel: BoxedStream,
        command_timeout: Duration,
    ) -> (Arc<Self>, ControlReader) {
        let (read_half, write_half) = tokio::io::split(channel);
        let session = Arc::new(Self {
            id,
            remote_addr,
            alive: AtomicBool::new(true),
            busy: AtomicBool::new(false),
            piping: AtomicBool::new(false),
            command_timeout,
            writer: Mutex::new(Some(write_half)),
            pending: SyncMutex::new(None),
            closed: CancellationToken::new(),
        });
        (session, BufReader::new(read_half))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.closed.is_cancelled()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SessionState {
        if !self.is_alive() {
            SessionState::Closed
        } else if self.piping.load(Ordering::Acquire) {
            SessionState::Piping
        } else if self.is_busy() {
            SessionState::CommandInFlight
        } else {
            SessionState::Registered
        }
    }

    /// 标记失效并唤醒运行循环（被替换或显式关闭）
    pub fn invalidate(&self) {
        self.alive.store(false, Ordering::Release);
        self.closed.cancel();
    }

    /// 显式关闭
    pub fn close(&self) {
        debug!("Closing relay session {}", self.id);
        self.invalidate();
    }

    /// 通过中继打开 CONNECT 隧道
    pub async fn open_connect_tunnel(self: &Arc<Self>, host: &str, port: u16) -> Result<RelayedStream> {
        self.open_tunnel(TunnelCommand::new(TunnelKind::Connect, host, port))
            .await
    }

    /// 通过中继打开普通 HTTP 连接
    pub async fn open_http_connection(self: &Arc<Self>, host: &str, port: u16) -> Result<RelayedStream> {
        self.open_tunnel(TunnelCommand::new(TunnelKind::Http, host, port))
            .await
    }

    async fn open_tunnel(self: &Arc<Self>, command: TunnelCommand) -> Result<RelayedStream> {
        if !self.is_alive() {
            return Err(ProxyError::NoActiveRelay);
        }
        // 同一时间只允许一条命令，第二条立即失败而不是排队
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ProxyError::RelayBusy);
        }

        let (tx, mut rx) = oneshot::channel();
        *self.pending.lock() = Some(tx);

        let write_result = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(w) => write_command(w, &command).await,
                None => Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "control channel already handed over",
                )),
            }
        };
        if let Err(e) = write_result {
            warn!("Failed to send command to relay {}: {}", self.id, e);
            self.release_command();
            self.invalidate();
            return Err(ProxyError::RelayClosed);
        }

        debug!("Sent '{}' to relay {}", command.encode().trim_end(), self.id);

        match timeout(self.command_timeout, &mut rx).await {
            Err(_) => {
                warn!(
                    "Relay {} did not answer '{} {}' within {:?}",
                    self.id,
                    command.kind,
                    command.authority(),
                    self.command_timeout
                );
                self.release_command();
                self.abandon_reply(&mut rx);
                Err(ProxyError::timeout(self.command_timeout))
            }
            // 运行循环已退出，通道已关闭
            Ok(Err(_)) => {
                self.release_command();
                Err(ProxyError::RelayClosed)
            }
            Ok(Ok(Err(line))) => {
                self.release_command();
                Err(ProxyError::RelayRejected(line))
            }
            Ok(Ok(Ok(reader))) => {
                let writer = self.writer.lock().await.take();
                match writer {
                    Some(writer) => {
                        info!(
                            "Tunnel established via relay {} for {}",
                            self.id,
                            command.authority()
                        );
                        Ok(RelayedStream {
                            reader,
                            writer,
                            session: self.clone(),
                        })
                    }
                    None => {
                        self.release_command();
                        self.invalidate();
                        Err(ProxyError::RelayClosed)
                    }
                }
            }
        }
    }

    /// 放弃等待中的应答
    ///
    /// 应答可能恰在超时时送达：若读端已被转交，通道不再可用，会话随之失效。
    fn abandon_reply(&self, rx: &mut oneshot::Receiver<CommandOutcome>) {
        rx.close();
        if let Ok(Ok(_reader)) = rx.try_recv() {
            warn!(
                "Relay {} confirmed a tunnel after the deadline; closing",
                self.id
            );
            self.invalidate();
        }
    }

    fn release_command(&self) {
        self.pending.lock().take();
        self.busy.store(false, Ordering::Release);
    }

    /// 会话运行循环
    ///
    /// 控制通道的唯一读者：把每一行交给等待中的命令，或记录为意外消息。
    /// 通道关闭、显式关闭或被替换时结束；结束时清理注册表（仅当仍指向本会话）
    /// 并通知状态观察者。
    pub async fn run(
        self: Arc<Self>,
        mut reader: ControlReader,
        manager: &GatewaySessionManager,
        status: &dyn RelayStatusObserver,
    ) {
        info!("Relay session {} @ {} running", self.id, self.remote_addr);

        loop {
            let line = tokio::select! {
                _ = self.closed.cancelled() => {
                    debug!("Relay session {} closed", self.id);
                    break;
                }
                line = read_control_line(&mut reader) => line,
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!("Relay {} closed the control channel", self.id);
                    break;
                }
                Err(e) => {
                    warn!("Relay {} control channel error: {}", self.id, e);
                    break;
                }
            };

            let Some(tx) = self.pending.lock().take() else {
                warn!("Unexpected message from relay {}: {}", self.id, line);
                continue;
            };

            match TunnelReply::parse(&line) {
                TunnelReply::Ok => {
                    self.piping.store(true, Ordering::Release);
                    match tx.send(Ok(reader)) {
                        Ok(()) => {
                            // 通道已交给隧道，等待隧道结束或会话被替换
                            self.closed.cancelled().await;
                            break;
                        }
                        Err(_) => {
                            // 发出命令的任务已超时离开
                            self.piping.store(false, Ordering::Release);
                            warn!(
                                "Relay {} confirmed a tunnel nobody is waiting for; closing",
                                self.id
                            );
                            break;
                        }
                    }
                }
                TunnelReply::Error(msg) => {
                    let _ = tx.send(Err(msg));
                }
            }
        }

        self.alive.store(false, Ordering::Release);
        self.pending.lock().take();
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.shutdown().await.ok();
        }
        manager.clear_if_matches(&self);
        status.on_relay_status("No relay client connected", false);
        info!("Relay session {} @ {} ended", self.id, self.remote_addr);
    }
}

async fn write_command(writer: &mut ControlWriter, command: &TunnelCommand) -> io::Result<()> {
    writer.write_all(command.encode().as_bytes()).await?;
    writer.flush().await
}

/// 中继隧道：复用会话的控制通道
///
/// 丢弃时结束会话（一个控制通道只承载一条隧道）。
pub struct RelayedStream {
    reader: ControlReader,
    writer: ControlWriter,
    session: Arc<GatewaySession>,
}

impl RelayedStream {
    pub fn session(&self) -> &Arc<GatewaySession> {
        &self.session
    }
}

impl Drop for RelayedStream {
    fn drop(&mut self) {
        self.session.close();
    }
}

impl AsyncRead for RelayedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for RelayedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}
