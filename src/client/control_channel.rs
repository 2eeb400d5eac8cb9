use crate::config::ClientConfig;
use crate::control_protocol::{
    read_control_line, write_control_line, Hello, TunnelCommand, ERROR_LINE, OK_LINE,
};
use crate::error::{ProxyError, Result};
use crate::observer::RelayStatusObserver;
use crate::outbound::connect_with_timeout;
use crate::pump::relay_cooperative;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, info, warn};

/// 单次拨号会话的结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// 接受端关闭了控制连接
    ServerClosed,
    /// 承载过一条隧道后结束
    TunnelFinished,
}

/// 连接接受端、完成握手并服务命令
///
/// 一个控制连接只承载一条隧道；隧道结束后返回，由重连循环重新注册。
pub async fn run_client_session(
    config: &ClientConfig,
    status: &dyn RelayStatusObserver,
) -> Result<SessionEnd> {
    info!(
        "Connecting to gateway {}:{}",
        config.server_addr, config.server_port
    );
    let stream =
        connect_with_timeout(&config.server_addr, config.server_port, config.connect_timeout())
            .await?;
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let hello = Hello::new(&config.passkey);
    writer.write_all(hello.encode().as_bytes()).await?;
    writer.flush().await?;

    let ack = read_control_line(&mut reader).await?;
    match ack.as_deref().map(str::trim) {
        Some(line) if line.eq_ignore_ascii_case(OK_LINE) => {
            info!("Gateway HELLO accepted");
        }
        other => {
            warn!("Gateway HELLO rejected (server replied: {:?})", other);
            status.on_relay_status("Gateway HELLO rejected", false);
            return Err(ProxyError::auth_failed("gateway rejected HELLO"));
        }
    }

    status.on_relay_status(
        &format!(
            "Gateway client connected to {}:{}",
            config.server_addr, config.server_port
        ),
        true,
    );

    serve_commands(config, &mut reader, &mut writer, status).await
}

/// 命令循环：为每条命令打开本地连接，成功后在同一任务中转发
async fn serve_commands(
    config: &ClientConfig,
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    status: &dyn RelayStatusObserver,
) -> Result<SessionEnd> {
    loop {
        let Some(line) = read_control_line(reader).await? else {
            info!("Gateway closed the control connection");
            return Ok(SessionEnd::ServerClosed);
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let command = TunnelCommand::parse(line).map_err(ProxyError::protocol)?;
        debug!("Gateway requested {} {}", command.kind, command.authority());

        let target =
            match connect_with_timeout(&command.host, command.port, config.connect_timeout()).await
            {
                Ok(target) => target,
                Err(e) => {
                    warn!(
                        "Failed to open local connection to {}: {}",
                        command.authority(),
                        e
                    );
                    write_control_line(writer, ERROR_LINE).await?;
                    continue;
                }
            };

        write_control_line(writer, OK_LINE).await?;
        status.on_relay_status(
            &format!("Gateway tunnel connected to {}", command.authority()),
            true,
        );

        let result = relay_cooperative(reader, writer, target, config.idle_timeout()).await;
        status.on_relay_status("Gateway tunnel closed", false);

        let (to_local, to_gateway) = result?;
        info!(
            "Tunnel to {} closed (to local: {} bytes, to gateway: {} bytes)",
            command.authority(),
            to_local,
            to_gateway
        );
        return Ok(SessionEnd::TunnelFinished);
    }
}
