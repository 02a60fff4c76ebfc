//! 连接读循环
//!
//! 反复解码数据包并交给分发表处理，直到满足任一停止条件。
//! 读循环不负责关闭连接，由调用方根据 [`StopReason`] 收尾。

use std::fmt;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::codec::PacketReader;
use crate::dispatcher::Dispatcher;
use crate::error::PacketError;
use crate::packet::Packet;
use crate::peer::Peer;

/// 读循环结束原因
#[derive(Debug)]
pub enum StopReason {
    /// 继续条件不再成立
    Condition,
    /// 处理器要求停止（例如收到关闭包）
    Handler,
    /// 被取消
    Cancelled,
    /// 超过空闲时间未收到数据包
    IdleTimeout,
    /// 解码失败或连接断开
    Error(PacketError),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Condition => write!(f, "loop condition no longer holds"),
            StopReason::Handler => write!(f, "handler requested stop"),
            StopReason::Cancelled => write!(f, "cancelled"),
            StopReason::IdleTimeout => write!(f, "idle timeout"),
            StopReason::Error(e) => write!(f, "{}", e),
        }
    }
}

/// 运行单个连接的读循环
///
/// # Arguments
/// * `reader` - 当前连接专属的数据包读取器
/// * `peer` - 传给处理器的连接句柄
/// * `dispatcher` - 处理器分发表
/// * `cancel` - 取消信号，取消时立即从阻塞读取中返回
/// * `idle_timeout` - 两个数据包之间允许的最长间隔
/// * `condition` - 每轮开始前检查的继续条件
pub async fn run_loop<R, C>(
    reader: &mut PacketReader<R>,
    peer: &Peer,
    dispatcher: &Dispatcher,
    cancel: &CancellationToken,
    idle_timeout: Option<Duration>,
    condition: C,
) -> StopReason
where
    R: AsyncRead + Unpin,
    C: Fn() -> bool,
{
    while condition() {
        let result = tokio::select! {
            _ = cancel.cancelled() => return StopReason::Cancelled,
            result = read_next(reader, idle_timeout) => result,
        };

        let packet = match result {
            Ok(Some(packet)) => packet,
            Ok(None) => return StopReason::IdleTimeout,
            Err(e) => return StopReason::Error(e),
        };

        // 同一连接内严格按到达顺序逐个处理
        if !dispatcher.dispatch(peer, &*packet) {
            return StopReason::Handler;
        }
    }
    StopReason::Condition
}

/// 读取下一个数据包，超时返回 `Ok(None)`
async fn read_next<R: AsyncRead + Unpin>(
    reader: &mut PacketReader<R>,
    idle_timeout: Option<Duration>,
) -> Result<Option<Box<dyn Packet>>, PacketError> {
    match idle_timeout {
        Some(limit) => match timeout(limit, reader.read_packet()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        },
        None => reader.read_packet().await.map(Some),
    }
}
