//! 连接句柄
//!
//! 每个连接的写入端由独立的写任务持有，[`Peer`] 只保存发送队列，
//! 因此可以被读循环、处理器和外部调用方同时克隆使用。
//! 发送队列有上限，对端读取过慢导致队列写满时连接被关闭。

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::codec::{encode_packet, PacketWriter};
use crate::error::{PacketError, Result};
use crate::packet::{ClosePacket, Packet};
use crate::OUTBOUND_QUEUE_LEN;

/// 写任务的待发送帧
struct Outbound {
    frame: Vec<u8>,
    /// 需要确认写入结果时携带
    ack: Option<oneshot::Sender<Result<()>>>,
}

struct Inner {
    id: u64,
    addr: Option<SocketAddr>,
    outbound: mpsc::Sender<Outbound>,
    token: CancellationToken,
}

/// 一条打开的连接
#[derive(Clone)]
pub struct Peer {
    inner: Arc<Inner>,
}

impl Peer {
    /// 创建连接句柄，并在 `tracker` 中启动写任务
    ///
    /// `token` 被取消时写任务关闭写入端，连接随之关闭。
    pub fn spawn<W>(
        id: u64,
        addr: Option<SocketAddr>,
        writer: W,
        token: CancellationToken,
        tracker: &TaskTracker,
    ) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE_LEN);
        tracker.spawn(write_loop(id, PacketWriter::new(writer), rx, token.clone()));
        Self {
            inner: Arc::new(Inner {
                id,
                addr,
                outbound,
                token,
            }),
        }
    }

    /// 连接 ID
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// 对端地址
    pub fn addr(&self) -> Option<SocketAddr> {
        self.inner.addr
    }

    /// 连接是否仍然打开
    pub fn is_open(&self) -> bool {
        !self.inner.token.is_cancelled() && !self.inner.outbound.is_closed()
    }

    /// 将数据包放入发送队列，不等待写入完成
    ///
    /// 供同步执行的处理器回复使用，写入失败只记录日志。
    /// 队列已满时关闭连接并返回 [`PacketError::QueueFull`]。
    pub fn send(&self, packet: &dyn Packet) -> Result<()> {
        if !self.is_open() {
            return Err(PacketError::ConnectionClosed);
        }
        let frame = encode_packet(packet)?;
        match self.inner.outbound.try_send(Outbound { frame, ack: None }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("Outbound queue of {} is full, closing connection", self);
                self.close();
                Err(PacketError::QueueFull {
                    capacity: OUTBOUND_QUEUE_LEN,
                })
            }
            Err(TrySendError::Closed(_)) => Err(PacketError::ConnectionClosed),
        }
    }

    /// 写入数据包，等待字节交给底层流
    pub async fn write(&self, packet: &dyn Packet) -> Result<()> {
        if !self.is_open() {
            return Err(PacketError::ConnectionClosed);
        }
        let frame = encode_packet(packet)?;
        let (ack, done) = oneshot::channel();
        let outbound = Outbound {
            frame,
            ack: Some(ack),
        };
        // 队列满时等待空位，连接关闭则立即返回
        let queued = tokio::select! {
            _ = self.inner.token.cancelled() => return Err(PacketError::ConnectionClosed),
            queued = self.inner.outbound.send(outbound) => queued,
        };
        queued.map_err(|_| PacketError::ConnectionClosed)?;
        done.await.map_err(|_| PacketError::ConnectionClosed)?
    }

    /// 发送关闭包（尽力而为），然后关闭连接
    ///
    /// 关闭包最多等待 `limit`，对端不读取时不会阻塞调用方。
    pub async fn close_gracefully(&self, limit: Duration) {
        match timeout(limit, self.write(&ClosePacket)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Could not write close packet to {}: {}", self, e),
            Err(_) => warn!("Timed out writing close packet to {}", self),
        }
        self.close();
    }

    /// 关闭连接
    pub fn close(&self) {
        self.inner.token.cancel();
    }

    /// 等待连接关闭
    pub async fn closed(&self) {
        tokio::select! {
            _ = self.inner.token.cancelled() => {}
            _ = self.inner.outbound.closed() => {}
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.addr {
            Some(addr) => write!(f, "#{} ({})", self.inner.id, addr),
            None => write!(f, "#{}", self.inner.id),
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.inner.id)
            .field("addr", &self.inner.addr)
            .field("open", &self.is_open())
            .finish()
    }
}

/// 写任务：按顺序写出队列中的帧，取消时关闭写入端
async fn write_loop<W: AsyncWrite + Unpin>(
    id: u64,
    mut writer: PacketWriter<W>,
    mut rx: mpsc::Receiver<Outbound>,
    token: CancellationToken,
) {
    loop {
        // 已入队的帧优先于取消信号
        let outbound = tokio::select! {
            biased;
            outbound = rx.recv() => outbound,
            _ = token.cancelled() => None,
        };
        let Some(Outbound { frame, ack }) = outbound else {
            break;
        };

        let result = tokio::select! {
            result = writer.write_frame(&frame) => result,
            _ = token.cancelled() => Err(PacketError::ConnectionClosed),
        };
        let failed = result.is_err();
        match ack {
            Some(ack) => {
                let _ = ack.send(result);
            }
            None => {
                if let Err(e) = result {
                    warn!("Failed to write to connection #{}: {}", id, e);
                }
            }
        }
        if failed {
            break;
        }
    }

    // 拒绝后续写入，再关闭写入端
    rx.close();
    token.cancel();
    if let Err(e) = writer.shutdown().await {
        debug!("Shutdown of connection #{} failed: {}", id, e);
    }
}
