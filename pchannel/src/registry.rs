//! 数据包注册表
//!
//! 将帧头中的数据包 ID 映射到构造器，解码时据此创建空实例。

use std::collections::HashMap;
use std::fmt;

use crate::error::{PacketError, Result};
use crate::packet::{AlivePacket, ClosePacket, Packet};
use crate::{ID_ALIVE, ID_CLOSE};

type Factory = Box<dyn Fn() -> Box<dyn Packet> + Send + Sync>;

/// 数据包注册表
///
/// 每个 [`Server`](crate::Server) / [`Client`](crate::Client) 持有自己的实例，
/// 初始化完成后放入 `Arc`，之后只读。
pub struct PacketRegistry {
    factories: HashMap<u8, Factory>,
}

impl PacketRegistry {
    /// 创建注册表，预先注册存活检测包和关闭包
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.insert(ID_ALIVE, || AlivePacket);
        registry.insert(ID_CLOSE, || ClosePacket);
        registry
    }

    fn insert<F, P>(&mut self, id: u8, factory: F)
    where
        F: Fn() -> P + Send + Sync + 'static,
        P: Packet,
    {
        self.factories
            .insert(id, Box::new(move || Box::new(factory()) as Box<dyn Packet>));
    }

    /// 注册数据包构造器
    ///
    /// 同一 ID 只能注册一次，重复注册返回错误且保留原有构造器。
    pub fn register<F, P>(&mut self, id: u8, factory: F) -> Result<()>
    where
        F: Fn() -> P + Send + Sync + 'static,
        P: Packet,
    {
        if self.factories.contains_key(&id) {
            return Err(PacketError::DuplicatePacketId { id });
        }
        self.insert(id, factory);
        Ok(())
    }

    /// 创建指定 ID 的空数据包
    pub fn resolve(&self, id: u8) -> Result<Box<dyn Packet>> {
        self.factories
            .get(&id)
            .map(|factory| factory())
            .ok_or(PacketError::UnknownPacketId { id })
    }

    /// 是否已注册
    pub fn contains(&self, id: u8) -> bool {
        self.factories.contains_key(&id)
    }

    /// 已注册的 ID（升序）
    pub fn ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.factories.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for PacketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PacketRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}
