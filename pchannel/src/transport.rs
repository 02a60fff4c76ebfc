//! TCP 传输
//!
//! 数据包层只依赖 `AsyncRead` / `AsyncWrite`，这里负责建立 TCP 连接、
//! 设置套接字选项并拆分读写端。

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{PacketError, Result};
use crate::CONNECT_TIMEOUT;

/// 传输层配置
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// 连接超时时间
    pub connect_timeout: Duration,
    /// 是否禁用 Nagle 算法（TCP nodelay）
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            nodelay: true, // 小包为主，减少延迟
        }
    }
}

/// 一条已建立的 TCP 连接
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    peer_addr: Option<SocketAddr>,
}

impl TcpTransport {
    /// 连接到 `addr`（"host:port"），超过 `connect_timeout` 返回 [`PacketError::ConnectionTimeout`]
    pub async fn connect(addr: &str, config: &TransportConfig) -> Result<Self> {
        let stream = timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| PacketError::ConnectionTimeout)??;
        Self::configure(stream, config)
    }

    /// 对已接受的套接字应用传输配置
    pub fn configure(stream: TcpStream, config: &TransportConfig) -> Result<Self> {
        stream.set_nodelay(config.nodelay)?;
        let peer_addr = stream.peer_addr().ok();
        Ok(Self { stream, peer_addr })
    }

    /// 对端地址，无法获取时为 None
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// 拆分为独立的读写端
    pub fn split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        self.stream.into_split()
    }
}

/// TCP 监听器
#[derive(Debug)]
pub struct TcpListener {
    listener: tokio::net::TcpListener,
    config: TransportConfig,
}

impl TcpListener {
    /// 绑定 `addr`（"host:port"）
    pub async fn bind(addr: &str, config: TransportConfig) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        Ok(Self { listener, config })
    }

    /// 本地绑定地址
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// 接受下一个连接
    ///
    /// 外层错误表示监听器本身失败；内层错误只属于这一个套接字，
    /// 调用方丢弃该连接后可以继续接受。
    pub async fn accept(&self) -> Result<(SocketAddr, Result<TcpTransport>)> {
        let (stream, addr) = self.listener.accept().await?;
        Ok((addr, TcpTransport::configure(stream, &self.config)))
    }
}
