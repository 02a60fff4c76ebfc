//! 帧编解码
//!
//! 帧格式:
//! ```text
//! ┌────────────┬────────────────┬────────────────────────────────┐
//! │   ID (1B)  │  Length (4B)   │            Payload             │
//! │     u8     │    i32 BE      │       Packet::encode 输出       │
//! └────────────┴────────────────┴────────────────────────────────┘
//! ```

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{PacketError, Result};
use crate::packet::{Packet, PayloadReader, PayloadWriter};
use crate::registry::PacketRegistry;
use crate::{HEADER_SIZE, MAX_PACKET_LEN};

/// 将数据包编码为完整的帧
///
/// 负载直接写在帧头之后，长度字段由实际写入的字节数回填，
/// 因此声明长度与负载长度始终一致。
pub fn encode_packet(packet: &dyn Packet) -> Result<Vec<u8>> {
    encode_packet_with_limit(packet, MAX_PACKET_LEN)
}

pub(crate) fn encode_packet_with_limit(packet: &dyn Packet, max: usize) -> Result<Vec<u8>> {
    let mut out = PayloadWriter::from_vec(vec![0u8; HEADER_SIZE]);
    packet.encode(&mut out)?;
    let mut frame = out.into_vec();

    let size = frame.len() - HEADER_SIZE;
    if size > max || size > i32::MAX as usize {
        return Err(PacketError::FrameTooLarge { size, max });
    }

    frame[0] = packet.id();
    frame[1..HEADER_SIZE].copy_from_slice(&(size as i32).to_be_bytes());
    Ok(frame)
}

fn map_read_error(e: std::io::Error) -> PacketError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        PacketError::ConnectionClosed
    } else {
        PacketError::Io(e)
    }
}

/// 数据包读取器
///
/// 帧头与负载缓冲区归单个连接所有，不在连接之间共享。
pub struct PacketReader<R> {
    reader: R,
    registry: Arc<PacketRegistry>,
    header: [u8; HEADER_SIZE],
    buffer: Vec<u8>,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    /// 创建新的数据包读取器
    pub fn new(reader: R, registry: Arc<PacketRegistry>) -> Self {
        Self {
            reader,
            registry,
            header: [0u8; HEADER_SIZE],
            buffer: Vec::new(),
            max_len: MAX_PACKET_LEN,
        }
    }

    /// 设置单个负载的大小上限
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    /// 读取并解码一个数据包
    pub async fn read_packet(&mut self) -> Result<Box<dyn Packet>> {
        // 读取帧头，read_exact 会处理分段到达的情况
        self.reader
            .read_exact(&mut self.header)
            .await
            .map_err(map_read_error)?;

        let id = self.header[0];
        let length = i32::from_be_bytes([
            self.header[1],
            self.header[2],
            self.header[3],
            self.header[4],
        ]);

        // 在分配内存之前检查长度
        if length < 0 {
            return Err(PacketError::InvalidLength { length });
        }
        let length = length as usize;
        if length > self.max_len {
            return Err(PacketError::FrameTooLarge {
                size: length,
                max: self.max_len,
            });
        }

        // 读取负载（仅在需要时扩容）
        if length > 0 {
            if self.buffer.len() < length {
                self.buffer.resize(length, 0);
            }
            self.reader
                .read_exact(&mut self.buffer[..length])
                .await
                .map_err(map_read_error)?;
        }

        let mut packet = self.registry.resolve(id)?;
        if packet.id() != id {
            return Err(PacketError::PacketIdMismatch {
                registered: id,
                reported: packet.id(),
            });
        }

        let mut input = PayloadReader::new(&self.buffer[..length]);
        packet.decode(&mut input)?;
        if input.remaining() > 0 {
            return Err(PacketError::Malformed {
                reason: "trailing bytes after payload",
            });
        }

        Ok(packet)
    }
}

/// 数据包写入器
pub struct PacketWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    /// 创建新的数据包写入器
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// 编码并写入一个数据包
    pub async fn write_packet(&mut self, packet: &dyn Packet) -> Result<()> {
        let frame = encode_packet(packet)?;
        self.write_frame(&frame).await
    }

    /// 写入已编码的帧
    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.writer.write_all(frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// 关闭写入端
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
