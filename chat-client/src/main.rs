//! 聊天室客户端
//!
//! 从标准输入逐行读取消息发送给服务端，输入 /quit 退出

use anyhow::Result;
use pchannel::{BincodePacket, Client, ClientConfig, Peer, DEFAULT_PORT, KEEP_ALIVE_INTERVAL};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const ID_CHAT: u8 = 2;

/// 聊天消息
type ChatPacket = BincodePacket<String, { ID_CHAT }>;

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("chat_client=debug".parse()?)
                .add_directive("pchannel=info".parse()?),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port = match args.next() {
        Some(port) => port.parse()?,
        None => DEFAULT_PORT,
    };

    let config = ClientConfig {
        host,
        port,
        keep_alive: Some(KEEP_ALIVE_INTERVAL),
        ..ClientConfig::default()
    };

    let mut client = Client::new(config, |registry, dispatcher| {
        registry.register(ID_CHAT, ChatPacket::default)?;
        dispatcher.register(ID_CHAT, |_: &Peer, packet: &ChatPacket| {
            info!("Server: {}", packet.payload);
            true
        })
    })?;
    client.start().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line == "/quit" {
            break;
        }
        if line.is_empty() {
            continue;
        }
        if !client.is_connected() {
            info!("Connection lost");
            break;
        }
        if let Err(e) = client.write(&ChatPacket::new(line.to_string())).await {
            warn!("Failed to send message: {}", e);
            break;
        }
    }

    client.stop().await?;
    Ok(())
}
