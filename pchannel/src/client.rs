//! 客户端
//!
//! 维护一条到服务端的连接，读循环在后台任务中运行。

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::codec::PacketReader;
use crate::connection::{run_loop, StopReason};
use crate::dispatcher::Dispatcher;
use crate::error::{PacketError, Result};
use crate::packet::{AlivePacket, ClosePacket, Packet};
use crate::peer::Peer;
use crate::registry::PacketRegistry;
use crate::transport::{TcpTransport, TransportConfig};
use crate::{CLOSE_TIMEOUT, DEFAULT_PORT, MAX_PACKET_LEN};

/// 客户端配置
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// 服务端地址
    pub host: String,
    /// 服务端端口
    pub port: u16,
    /// 传输层配置
    pub transport: TransportConfig,
    /// 心跳间隔，None 表示不发送心跳
    pub keep_alive: Option<Duration>,
    /// 单个数据包负载上限
    pub max_packet_len: usize,
    /// 停止时等待关闭包写出的最长时间
    pub close_timeout: Duration,
}

impl ClientConfig {
    /// 目标地址，格式为 "host:port"
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            transport: TransportConfig::default(),
            keep_alive: None,
            max_packet_len: MAX_PACKET_LEN,
            close_timeout: CLOSE_TIMEOUT,
        }
    }
}

/// 运行中的连接
struct Running {
    peer: Peer,
    /// 只取消读循环，不关闭连接
    loop_token: CancellationToken,
    tracker: TaskTracker,
}

/// 客户端状态
enum ClientState {
    Idle,
    Running(Running),
    Stopped,
}

/// 数据包客户端
pub struct Client {
    config: ClientConfig,
    registry: Arc<PacketRegistry>,
    dispatcher: Arc<Dispatcher>,
    state: ClientState,
}

impl Client {
    /// 创建客户端，并调用一次 `setup` 注册数据包和处理器
    pub fn new<F>(config: ClientConfig, setup: F) -> Result<Self>
    where
        F: FnOnce(&mut PacketRegistry, &mut Dispatcher) -> Result<()>,
    {
        let mut registry = PacketRegistry::new();
        let mut dispatcher = Dispatcher::new();
        setup(&mut registry, &mut dispatcher)?;

        Ok(Self {
            config,
            registry: Arc::new(registry),
            dispatcher: Arc::new(dispatcher),
            state: ClientState::Idle,
        })
    }

    /// 客户端配置
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// 当前连接，未启动或已停止时返回 None
    pub fn peer(&self) -> Option<&Peer> {
        match &self.state {
            ClientState::Running(running) => Some(&running.peer),
            _ => None,
        }
    }

    /// 连接是否仍然打开
    pub fn is_connected(&self) -> bool {
        self.peer().is_some_and(Peer::is_open)
    }

    /// 连接服务端并在后台启动读循环
    ///
    /// 连接失败时客户端保持未启动状态，可以再次调用。
    pub async fn start(&mut self) -> Result<()> {
        match self.state {
            ClientState::Idle => {}
            ClientState::Running(_) => return Err(PacketError::AlreadyStarted),
            ClientState::Stopped => return Err(PacketError::AlreadyStopped),
        }

        let addr = self.config.addr();
        let transport = TcpTransport::connect(&addr, &self.config.transport).await?;
        let remote = transport.peer_addr();
        info!("Connected to {}", addr);

        let (reader, writer) = transport.split();
        let tracker = TaskTracker::new();
        let loop_token = CancellationToken::new();
        let peer = Peer::spawn(0, remote, writer, CancellationToken::new(), &tracker);

        let mut reader = PacketReader::new(reader, Arc::clone(&self.registry))
            .with_max_len(self.config.max_packet_len);
        let dispatcher = Arc::clone(&self.dispatcher);
        let loop_peer = peer.clone();
        let cancel = loop_token.clone();
        tracker.spawn(async move {
            let reason = run_loop(&mut reader, &loop_peer, &dispatcher, &cancel, None, || {
                loop_peer.is_open()
            })
            .await;

            match reason {
                // 由 stop() 取消，连接由 stop() 负责关闭
                StopReason::Cancelled => debug!("Read loop cancelled"),
                StopReason::Error(PacketError::ConnectionClosed) => {
                    info!("Server closed connection");
                    loop_peer.close();
                }
                StopReason::Error(e) => {
                    warn!("Receive error: {}", e);
                    loop_peer.close();
                }
                reason => {
                    debug!("Read loop stopped: {}", reason);
                    loop_peer.close();
                }
            }
        });

        if let Some(period) = self.config.keep_alive {
            tracker.spawn(keep_alive(peer.clone(), period));
        }

        self.state = ClientState::Running(Running {
            peer,
            loop_token,
            tracker,
        });
        Ok(())
    }

    /// 写入数据包，等待字节交给底层流
    pub async fn write(&self, packet: &dyn Packet) -> Result<()> {
        match &self.state {
            ClientState::Idle => Err(PacketError::NotStarted),
            ClientState::Stopped => Err(PacketError::AlreadyStopped),
            ClientState::Running(running) => running.peer.write(packet).await,
        }
    }

    /// 停止客户端
    ///
    /// 取消读循环，尽力发送关闭包（最多等待 `close_timeout`），
    /// 然后关闭连接并等待后台任务退出。
    pub async fn stop(&mut self) -> Result<()> {
        let running = match std::mem::replace(&mut self.state, ClientState::Stopped) {
            ClientState::Running(running) => running,
            ClientState::Idle => {
                self.state = ClientState::Idle;
                return Err(PacketError::NotStarted);
            }
            ClientState::Stopped => return Err(PacketError::AlreadyStopped),
        };

        // 先停止读取，再通知服务端
        running.loop_token.cancel();
        match timeout(self.config.close_timeout, running.peer.write(&ClosePacket)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Could not write close packet: {}", e),
            Err(_) => warn!("Timed out writing close packet"),
        }
        running.peer.close();

        running.tracker.close();
        running.tracker.wait().await;
        info!("Disconnected");
        Ok(())
    }
}

/// 周期性发送存活检测包，写入失败即关闭连接
async fn keep_alive(peer: Peer, period: Duration) {
    let mut ticker = interval(period);
    ticker.tick().await; // 跳过第一次立即触发

    loop {
        tokio::select! {
            _ = peer.closed() => break,
            _ = ticker.tick() => {
                if let Err(e) = peer.write(&AlivePacket).await {
                    warn!("Failed to send keep-alive: {}", e);
                    peer.close();
                    break;
                }
                debug!("Sent keep-alive");
            }
        }
    }
}
