//! 错误类型定义

use thiserror::Error;

/// 错误分类
///
/// - `Configuration`: 初始化阶段的配置错误，阻止启动
/// - `Protocol`: 线路数据不合法，只影响当前连接
/// - `Connection`: 流关闭或读写失败，只影响当前连接
/// - `Usage`: API 调用顺序错误，立即返回给调用方
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Protocol,
    Connection,
    Usage,
}

/// 数据包通道错误类型
#[derive(Error, Debug)]
pub enum PacketError {
    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// 数据包 ID 重复注册
    #[error("Packet id {id} is already registered")]
    DuplicatePacketId { id: u8 },

    /// 处理器 ID 重复注册
    #[error("Handler for packet id {id} is already registered")]
    DuplicateHandler { id: u8 },

    /// 未知数据包 ID
    #[error("Unknown packet id: {id}")]
    UnknownPacketId { id: u8 },

    /// 注册表中的构造器与帧头 ID 不一致
    #[error("Packet registered to {registered} reports id {reported}")]
    PacketIdMismatch { registered: u8, reported: u8 },

    /// 帧头长度为负数
    #[error("Invalid frame length: {length}")]
    InvalidLength { length: i32 },

    /// 帧大小超限
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// 负载内容不合法
    #[error("Malformed payload: {reason}")]
    Malformed { reason: &'static str },

    /// 字段长度超过编码上限
    #[error("Field too long: {len} bytes (max: {max})")]
    FieldTooLong { len: usize, max: usize },

    /// 连接超时
    #[error("Connection timeout")]
    ConnectionTimeout,

    /// 连接已关闭
    #[error("Connection closed")]
    ConnectionClosed,

    /// 发送队列已满，对端读取过慢
    #[error("Outbound queue full ({capacity} frames)")]
    QueueFull { capacity: usize },

    /// 尚未启动
    #[error("Not started")]
    NotStarted,

    /// 重复启动
    #[error("Already started")]
    AlreadyStarted,

    /// 已经停止
    #[error("Already stopped")]
    AlreadyStopped,
}

impl PacketError {
    /// 返回错误所属分类
    pub fn kind(&self) -> ErrorKind {
        match self {
            PacketError::DuplicatePacketId { .. } | PacketError::DuplicateHandler { .. } => {
                ErrorKind::Configuration
            }
            PacketError::Serialization(_)
            | PacketError::UnknownPacketId { .. }
            | PacketError::PacketIdMismatch { .. }
            | PacketError::InvalidLength { .. }
            | PacketError::FrameTooLarge { .. }
            | PacketError::Malformed { .. }
            | PacketError::FieldTooLong { .. } => ErrorKind::Protocol,
            PacketError::Io(_)
            | PacketError::ConnectionTimeout
            | PacketError::ConnectionClosed
            | PacketError::QueueFull { .. } => ErrorKind::Connection,
            PacketError::NotStarted | PacketError::AlreadyStarted | PacketError::AlreadyStopped => {
                ErrorKind::Usage
            }
        }
    }
}

/// 操作结果类型
pub type Result<T> = std::result::Result<T, PacketError>;
