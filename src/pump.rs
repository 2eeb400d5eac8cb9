/// 双向字节泵
///
/// 每条隧道都以这里的函数结束：把一端读到的字节原样写到另一端，
/// 直到任意一端关闭或空闲超时。
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

/// 单次读写缓冲区大小
pub const COPY_BUFFER_SIZE: usize = 8192;

/// 代理连接抽象
///
/// 统一封装 TCP、TLS 与中继复用的控制通道
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

// 为所有满足条件的类型自动实现 ProxyStream
impl<T> ProxyStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// 类型擦除后的连接
pub type BoxedStream = Box<dyn ProxyStream>;

/// 单方向拷贝（带空闲超时），读到 EOF 后关闭写端
async fn copy_with_idle<R, W>(reader: &mut R, writer: &mut W, idle: Duration) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = match timeout(idle, reader.read(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "Connection idle timeout",
                ))
            }
        };

        if n == 0 {
            break;
        }

        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }

    writer.shutdown().await.ok();
    Ok(total)
}

/// 在两个连接之间双向转发，每个方向一个并发单元
///
/// 返回 (a → b, b → a) 的字节数。任一方向出错只结束该方向，
/// 另一方向在对端关闭后结束。
pub async fn relay<A, B>(a: A, b: B, idle: Duration) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let a_to_b = async {
        let result = copy_with_idle(&mut a_read, &mut b_write, idle).await;
        if let Err(e) = &result {
            debug!("Pump a->b ended: {}", e);
            b_write.shutdown().await.ok();
        }
        result.unwrap_or(0)
    };

    let b_to_a = async {
        let result = copy_with_idle(&mut b_read, &mut a_write, idle).await;
        if let Err(e) = &result {
            debug!("Pump b->a ended: {}", e);
            a_write.shutdown().await.ok();
        }
        result.unwrap_or(0)
    };

    // 使用 join! 而不是 select!，确保两个方向都完成传输
    tokio::join!(a_to_b, b_to_a)
}

/// 单任务协作式双向转发
///
/// 两个方向在同一个执行上下文中按可读性轮流服务，
/// 保证共享通道上只有一个读者。用于拨号端：控制通道在
/// 命令应答之后直接承载隧道数据。
pub async fn relay_cooperative<CR, CW, L>(
    control_read: &mut CR,
    control_write: &mut CW,
    local: L,
    idle: Duration,
) -> io::Result<(u64, u64)>
where
    CR: AsyncRead + Unpin + ?Sized,
    CW: AsyncWrite + Unpin + ?Sized,
    L: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let mut up = vec![0u8; COPY_BUFFER_SIZE];
    let mut down = vec![0u8; COPY_BUFFER_SIZE];
    let mut to_local = 0u64;
    let mut to_control = 0u64;

    loop {
        tokio::select! {
            r = control_read.read(&mut up) => {
                let n = r?;
                if n == 0 {
                    debug!("Control channel closed");
                    break;
                }
                local_write.write_all(&up[..n]).await?;
                local_write.flush().await?;
                to_local += n as u64;
            }
            r = local_read.read(&mut down) => {
                let n = r?;
                if n == 0 {
                    debug!("Local connection closed");
                    break;
                }
                control_write.write_all(&down[..n]).await?;
                control_write.flush().await?;
                to_control += n as u64;
            }
            _ = tokio::time::sleep(idle) => {
                debug!("Cooperative relay idle for {:?}, closing", idle);
                break;
            }
        }
    }

    local_write.shutdown().await.ok();
    control_write.shutdown().await.ok();
    Ok((to_local, to_control))
}
