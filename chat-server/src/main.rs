//! 聊天室服务端
//!
//! 基于 pchannel 的演示服务器，收到包含 "ping" 的消息时回复 "pong!"

use std::sync::Arc;

use anyhow::Result;
use pchannel::{BincodePacket, Peer, Server, ServerConfig, DEFAULT_PORT, IDLE_TIMEOUT};
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
                .add_directive("chat_server=debug".parse()?)
                .add_directive("pchannel=debug".parse()?),
        )
        .init();

    let port = match std::env::args().nth(1) {
        Some(port) => port.parse()?,
        None => DEFAULT_PORT,
    };
    let config = ServerConfig {
        port,
        idle_timeout: Some(IDLE_TIMEOUT),
        ..ServerConfig::default()
    };

    info!("Chat Server starting on {}", config.addr());

    let server = Arc::new(
        Server::bind(config, |registry, dispatcher| {
            registry.register(ID_CHAT, ChatPacket::default)?;
            dispatcher.register(ID_CHAT, |peer: &Peer, packet: &ChatPacket| {
                info!("[{}] {}", peer, packet.payload);
                if packet.payload.contains("ping") {
                    if let Err(e) = peer.send(&ChatPacket::new("pong!".to_string())) {
                        warn!("Failed to reply to {}: {}", peer, e);
                    }
                }
                true
            })
        })
        .await?,
    );

    let accept = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.start().await }
    });

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, shutting down");

    server.stop().await?;
    accept.await??;
    server.wait_closed().await;

    info!("Chat Server stopped");
    Ok(())
}
