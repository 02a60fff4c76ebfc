//! 服务端
//!
//! 每个接入的连接由独立任务运行读循环，所有任务都在同一个
//! [`TaskTracker`] 中管理，关闭时统一取消。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::codec::{PacketReader, PacketWriter};
use crate::connection::{run_loop, StopReason};
use crate::dispatcher::Dispatcher;
use crate::error::{PacketError, Result};
use crate::packet::ClosePacket;
use crate::peer::Peer;
use crate::registry::PacketRegistry;
use crate::transport::{TcpListener, TcpTransport, TransportConfig};
use crate::{CLOSE_TIMEOUT, DEFAULT_PORT, MAX_PACKET_LEN};

/// 服务端配置
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// 监听地址
    pub host: String,
    /// 监听端口
    pub port: u16,
    /// 最大连接数，None 表示不限制
    pub max_connections: Option<usize>,
    /// 连接空闲超时，None 表示不限制
    pub idle_timeout: Option<Duration>,
    /// 单个数据包负载上限
    pub max_packet_len: usize,
    /// 关闭时等待每个连接写出关闭包的最长时间
    pub close_timeout: Duration,
    /// 接入连接的套接字配置
    pub transport: TransportConfig,
}

impl ServerConfig {
    /// 监听地址，格式为 "host:port"
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_connections: None,
            idle_timeout: None,
            max_packet_len: MAX_PACKET_LEN,
            close_timeout: CLOSE_TIMEOUT,
            transport: TransportConfig::default(),
        }
    }
}

/// 检查刚接受的套接字，配置失败时丢弃该连接
fn admit(addr: SocketAddr, accepted: Result<TcpTransport>) -> Option<TcpTransport> {
    match accepted {
        Ok(transport) => Some(transport),
        Err(e) => {
            warn!("Dropping connection from {}: {}", addr, e);
            None
        }
    }
}

/// 活跃连接集合
type ActiveSet = RwLock<HashMap<u64, Peer>>;

/// 数据包服务端
///
/// ```rust,ignore
/// let server = Arc::new(Server::bind(ServerConfig::default(), |registry, dispatcher| {
///     registry.register(ID_CHAT, ChatPacket::default)?;
///     dispatcher.register(ID_CHAT, |peer: &Peer, packet: &ChatPacket| true)
/// }).await?);
/// tokio::spawn({ let server = server.clone(); async move { server.start().await } });
/// ```
pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    registry: Arc<PacketRegistry>,
    dispatcher: Arc<Dispatcher>,
    active: Arc<ActiveSet>,
    next_id: AtomicU64,
    accepting: AtomicBool,
    started: AtomicBool,
    stopped: AtomicBool,
    /// 根取消信号，每个连接持有其子信号
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Server {
    /// 绑定监听地址，并调用一次 `setup` 注册数据包和处理器
    ///
    /// setup 返回错误时不会启动监听。
    pub async fn bind<F>(config: ServerConfig, setup: F) -> Result<Self>
    where
        F: FnOnce(&mut PacketRegistry, &mut Dispatcher) -> Result<()>,
    {
        let mut registry = PacketRegistry::new();
        let mut dispatcher = Dispatcher::new();
        setup(&mut registry, &mut dispatcher)?;

        let listener = TcpListener::bind(&config.addr(), config.transport.clone()).await?;
        info!("Server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            config,
            registry: Arc::new(registry),
            dispatcher: Arc::new(dispatcher),
            active: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    /// 本地监听地址
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// 是否仍在接受新连接
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// 当前活跃连接的快照
    pub async fn active_connections(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.active.read().await.values().cloned().collect();
        peers.sort_by_key(Peer::id);
        peers
    }

    /// 当前活跃连接数
    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// 运行接受循环，直到 [`stop`](Self::stop) 被调用
    ///
    /// 监听器失败时返回错误，已建立的连接不受影响。
    /// 单个套接字配置失败只丢弃该连接。
    pub async fn start(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(PacketError::AlreadyStopped);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PacketError::AlreadyStarted);
        }

        while self.is_accepting() {
            let (addr, accepted) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.listener.accept() => result?,
            };

            // stop() 可能在 accept 返回前刚刚执行
            if !self.is_accepting() {
                break;
            }
            if let Some(transport) = admit(addr, accepted) {
                self.handle_accept(transport).await;
            }
        }

        debug!("Accept loop finished");
        Ok(())
    }

    async fn handle_accept(&self, transport: TcpTransport) {
        let addr = transport.peer_addr();

        if let Some(max) = self.config.max_connections {
            if self.active_count().await >= max {
                warn!("Connection limit reached, rejecting {:?}", addr);
                let (_reader, writer) = transport.split();
                let mut writer = PacketWriter::new(writer);
                let closed = tokio::time::timeout(self.config.close_timeout, async {
                    writer.write_packet(&ClosePacket).await?;
                    writer.shutdown().await
                })
                .await;
                match closed {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("Rejecting {:?} failed: {}", addr, e),
                    Err(_) => debug!("Timed out rejecting {:?}", addr),
                }
                return;
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (reader, writer) = transport.split();
        let token = self.shutdown.child_token();
        let peer = Peer::spawn(id, addr, writer, token.clone(), &self.tracker);

        // 先加入活跃集合，再启动读循环
        self.active.write().await.insert(id, peer.clone());
        debug!("Connected: {}", peer);

        let mut reader = PacketReader::new(reader, Arc::clone(&self.registry))
            .with_max_len(self.config.max_packet_len);
        let dispatcher = Arc::clone(&self.dispatcher);
        let active = Arc::clone(&self.active);
        let idle_timeout = self.config.idle_timeout;

        self.tracker.spawn(async move {
            let reason = run_loop(&mut reader, &peer, &dispatcher, &token, idle_timeout, || {
                peer.is_open()
            })
            .await;

            match &reason {
                StopReason::Error(PacketError::ConnectionClosed) => {
                    debug!("Connection {} closed by remote", peer)
                }
                StopReason::Error(e) => warn!("Error on connection {}: {}", peer, e),
                reason => debug!("Connection {} stopped: {}", peer, reason),
            }

            // 无论因何停止，都从活跃集合移除并关闭连接
            active.write().await.remove(&id);
            peer.close();
            debug!("Disconnect: {}", peer);
        });
    }

    /// 停止服务端
    ///
    /// 不再接受新连接，同时向所有活跃连接发送关闭包（尽力而为，
    /// 每个连接最多等待 `close_timeout`），然后取消全部连接任务。
    /// 不等待任务退出，需要时调用 [`wait_closed`](Self::wait_closed)。
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Err(PacketError::AlreadyStopped);
        }
        self.accepting.store(false, Ordering::SeqCst);
        info!("Server stopping");

        // 通知所有客户端服务端即将关闭，慢连接互不阻塞
        let mut closing = JoinSet::new();
        for peer in self.active_connections().await {
            let limit = self.config.close_timeout;
            closing.spawn(async move { peer.close_gracefully(limit).await });
        }
        while closing.join_next().await.is_some() {}

        // 取消接受循环及所有连接任务
        self.shutdown.cancel();
        self.tracker.close();
        Ok(())
    }

    /// 等待所有连接任务退出
    pub async fn wait_closed(&self) {
        self.tracker.wait().await;
    }
}
