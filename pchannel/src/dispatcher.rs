//! 数据包分发
//!
//! 按数据包 ID 查找处理器。处理器返回 `true` 表示继续读取，
//! `false` 表示结束当前连接的读循环。

use std::collections::HashMap;
use std::fmt;

use tracing::{error, warn};

use crate::error::{PacketError, Result};
use crate::packet::Packet;
use crate::peer::Peer;
use crate::{ID_ALIVE, ID_CLOSE};

type Handler = Box<dyn Fn(&Peer, &dyn Packet) -> bool + Send + Sync>;

/// 处理器分发表
///
/// 由 [`Server`](crate::Server) / [`Client`](crate::Client) 在构造时通过 setup 回调填充，
/// 之后放入 `Arc` 只读共享给所有连接。
pub struct Dispatcher {
    handlers: HashMap<u8, Handler>,
}

impl Dispatcher {
    /// 创建分发表，预置存活检测和关闭处理器
    pub fn new() -> Self {
        let mut handlers: HashMap<u8, Handler> = HashMap::new();
        handlers.insert(ID_ALIVE, Box::new(|_: &Peer, _: &dyn Packet| true));
        handlers.insert(ID_CLOSE, Box::new(|_: &Peer, _: &dyn Packet| false));
        Self { handlers }
    }

    /// 注册处理器
    ///
    /// 处理器按具体数据包类型 `P` 接收参数。
    /// 同一 ID 只能注册一次。
    pub fn register<P, F>(&mut self, id: u8, handler: F) -> Result<()>
    where
        P: Packet,
        F: Fn(&Peer, &P) -> bool + Send + Sync + 'static,
    {
        if self.handlers.contains_key(&id) {
            return Err(PacketError::DuplicateHandler { id });
        }
        let erased = move |peer: &Peer, packet: &dyn Packet| match packet.downcast_ref::<P>() {
            Some(packet) => handler(peer, packet),
            None => {
                // 注册表与分发表对同一 ID 的类型不一致
                error!(
                    "Handler for packet id {} expects {}, got {}",
                    id,
                    std::any::type_name::<P>(),
                    packet.name()
                );
                false
            }
        };
        self.handlers.insert(id, Box::new(erased));
        Ok(())
    }

    /// 是否已注册
    pub fn contains(&self, id: u8) -> bool {
        self.handlers.contains_key(&id)
    }

    /// 分发数据包，返回是否继续读取
    ///
    /// 没有对应处理器时记录警告并继续。
    pub fn dispatch(&self, peer: &Peer, packet: &dyn Packet) -> bool {
        match self.handlers.get(&packet.id()) {
            Some(handler) => handler(peer, packet),
            None => {
                warn!("No handler for packet: {} (id={})", packet.name(), packet.id());
                true
            }
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<u8> = self.handlers.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("Dispatcher").field("ids", &ids).finish()
    }
}
