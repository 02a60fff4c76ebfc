//! 协议常量定义

use std::time::Duration;

/// 默认端口
pub const DEFAULT_PORT: u16 = 7777;

/// 帧头大小: 1 字节 ID + 4 字节长度
pub const HEADER_SIZE: usize = 5;

/// 单个数据包负载最大大小（16 MiB）
pub const MAX_PACKET_LEN: usize = 16 * 1024 * 1024;

/// 存活检测包 ID
pub const ID_ALIVE: u8 = 0;

/// 关闭连接包 ID
pub const ID_CLOSE: u8 = 1;

/// 连接超时（秒）
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// 客户端心跳间隔（秒）
pub const KEEP_ALIVE_INTERVAL_SECS: u64 = 10;

/// 服务端空闲超时（秒）- 超过此时间无数据包则断开
pub const IDLE_TIMEOUT_SECS: u64 = 30;

/// 连接超时 Duration
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(CONNECT_TIMEOUT_SECS);

/// 心跳间隔 Duration
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(KEEP_ALIVE_INTERVAL_SECS);

/// 空闲超时 Duration
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(IDLE_TIMEOUT_SECS);

/// 关闭时等待关闭包写出的最长时间（毫秒）
pub const CLOSE_TIMEOUT_MILLIS: u64 = 2000;

/// 关闭包写出超时 Duration
pub const CLOSE_TIMEOUT: Duration = Duration::from_millis(CLOSE_TIMEOUT_MILLIS);

/// 每个连接发送队列最多容纳的帧数
pub const OUTBOUND_QUEUE_LEN: usize = 1024;
