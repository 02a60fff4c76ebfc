//! 数据包定义
//!
//! 每种数据包都有固定的 ID，并自行负责负载的编解码。
//! 负载长度由 [`Packet::encode`] 的实际输出决定，不单独维护。

use std::any::Any;
use std::fmt;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{PacketError, Result};
use crate::{ID_ALIVE, ID_CLOSE};

/// 允许从 trait 对象还原具体类型
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// 数据包
pub trait Packet: AsAny + Send + Sync + 'static {
    /// 数据包 ID
    fn id(&self) -> u8;

    /// 将负载写入 `out`
    fn encode(&self, out: &mut PayloadWriter) -> Result<()>;

    /// 从 `input` 读取负载，填充当前实例
    fn decode(&mut self, input: &mut PayloadReader<'_>) -> Result<()>;

    /// 编码后的负载长度
    fn length(&self) -> Result<usize> {
        let mut out = PayloadWriter::new();
        self.encode(&mut out)?;
        Ok(out.len())
    }

    /// 类型名，用于日志
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

impl dyn Packet {
    /// 还原为具体数据包类型
    pub fn downcast_ref<P: Packet>(&self) -> Option<&P> {
        AsAny::as_any(self).downcast_ref::<P>()
    }
}

impl fmt::Debug for dyn Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("id", &self.id())
            .field("type", &self.name())
            .finish()
    }
}

/// 存活检测包，无负载
///
/// 写入失败即说明对端已断开。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlivePacket;

impl Packet for AlivePacket {
    fn id(&self) -> u8 {
        ID_ALIVE
    }

    fn encode(&self, _out: &mut PayloadWriter) -> Result<()> {
        Ok(())
    }

    fn decode(&mut self, _input: &mut PayloadReader<'_>) -> Result<()> {
        Ok(())
    }
}

/// 关闭连接包，无负载
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClosePacket;

impl Packet for ClosePacket {
    fn id(&self) -> u8 {
        ID_CLOSE
    }

    fn encode(&self, _out: &mut PayloadWriter) -> Result<()> {
        Ok(())
    }

    fn decode(&mut self, _input: &mut PayloadReader<'_>) -> Result<()> {
        Ok(())
    }
}

/// 以 bincode 编码负载的数据包
///
/// ```rust,ignore
/// type ChatPacket = BincodePacket<String, 2>;
/// let packet = ChatPacket::new("ping".to_string());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BincodePacket<T, const ID: u8> {
    pub payload: T,
}

impl<T, const ID: u8> BincodePacket<T, ID> {
    pub fn new(payload: T) -> Self {
        Self { payload }
    }

    pub fn into_inner(self) -> T {
        self.payload
    }
}

impl<T: Default, const ID: u8> Default for BincodePacket<T, ID> {
    fn default() -> Self {
        Self {
            payload: T::default(),
        }
    }
}

impl<T, const ID: u8> Packet for BincodePacket<T, ID>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn id(&self) -> u8 {
        ID
    }

    fn encode(&self, out: &mut PayloadWriter) -> Result<()> {
        let bytes = bincode::serialize(&self.payload)?;
        out.put_slice(&bytes);
        Ok(())
    }

    fn decode(&mut self, input: &mut PayloadReader<'_>) -> Result<()> {
        self.payload = bincode::deserialize(input.take_rest())?;
        Ok(())
    }
}

/// 负载写入器（大端序）
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在已有缓冲区末尾追加写入
    pub(crate) fn from_vec(buf: Vec<u8>) -> Self {
        Self { buf }
    }

    pub(crate) fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.push(value as u8);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// 原样写入字节，不带长度前缀
    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// 写入 u16 长度前缀 + 字节
    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let len = u16::try_from(bytes.len()).map_err(|_| PacketError::FieldTooLong {
            len: bytes.len(),
            max: u16::MAX as usize,
        })?;
        self.put_u16(len);
        self.put_slice(bytes);
        Ok(())
    }

    /// 写入 u16 长度前缀 + UTF-8 字符串
    pub fn put_str(&mut self, value: &str) -> Result<()> {
        self.put_bytes(value.as_bytes())
    }
}

/// 负载读取器（大端序）
#[derive(Debug)]
pub struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// 剩余未读字节数
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(PacketError::Malformed {
                reason: "unexpected end of payload",
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// 取出全部剩余字节
    pub fn take_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(PacketError::Malformed {
                reason: "invalid bool",
            }),
        }
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    /// 读取 u16 长度前缀 + 字节
    pub fn get_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.get_u16()? as usize;
        self.take(len)
    }

    /// 读取 u16 长度前缀 + UTF-8 字符串
    pub fn get_string(&mut self) -> Result<String> {
        let bytes = self.get_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| PacketError::Malformed {
            reason: "invalid utf-8 string",
        })
    }
}
