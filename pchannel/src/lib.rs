//! 基于字节流的轻量数据包通道
//!
//! 包含:
//! - 数据包定义 (Packet, AlivePacket, ClosePacket, BincodePacket)
//! - 数据包注册表 (PacketRegistry)
//! - 帧编解码 (PacketReader, PacketWriter)
//! - 处理器分发 (Dispatcher)
//! - 连接读循环 (run_loop)
//! - TCP 传输 (TcpTransport, TcpListener)
//! - 服务端与客户端 (Server, Client)

mod client;
mod codec;
mod connection;
mod constants;
mod dispatcher;
mod error;
mod packet;
mod peer;
mod registry;
mod server;
mod transport;

pub use client::{Client, ClientConfig};
pub use codec::{encode_packet, PacketReader, PacketWriter};
pub use connection::{run_loop, StopReason};
pub use constants::*;
pub use dispatcher::Dispatcher;
pub use error::{ErrorKind, PacketError, Result};
pub use packet::{
    AlivePacket, AsAny, BincodePacket, ClosePacket, Packet, PayloadReader, PayloadWriter,
};
pub use peer::Peer;
pub use registry::PacketRegistry;
pub use server::{Server, ServerConfig};
pub use transport::{TcpListener, TcpTransport, TransportConfig};
