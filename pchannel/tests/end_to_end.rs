//! 服务端与客户端的端到端测试

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pchannel::{
    encode_packet, BincodePacket, Client, ClientConfig, Dispatcher, PacketError, PacketRegistry,
    Peer, Result, Server, ServerConfig,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const ID_CHAT: u8 = 2;
const ID_SEQ: u8 = 3;
const ID_BULK: u8 = 4;
const ID_UNREGISTERED: u8 = 9;
const BULK_LEN: usize = 4 * 1024 * 1024;

type ChatPacket = BincodePacket<String, { ID_CHAT }>;
/// (客户端编号, 序号)
type SeqPacket = BincodePacket<(u32, u32), { ID_SEQ }>;
type StrayPacket = BincodePacket<u8, { ID_UNREGISTERED }>;
type BulkPacket = BincodePacket<Vec<u8>, { ID_BULK }>;

type Log<T> = Arc<Mutex<Vec<T>>>;

fn log<T>() -> Log<T> {
    Arc::new(Mutex::new(Vec::new()))
}

async fn within<F: Future<Output = ()>>(what: &str, fut: F) {
    timeout(Duration::from_secs(5), fut)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

async fn spawn_server<F>(
    config: ServerConfig,
    setup: F,
) -> (Arc<Server>, SocketAddr, JoinHandle<Result<()>>)
where
    F: FnOnce(&mut PacketRegistry, &mut Dispatcher) -> Result<()>,
{
    let config = ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..config
    };
    let server = Arc::new(Server::bind(config, setup).await.unwrap());
    let addr = server.local_addr().unwrap();
    let handle = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.start().await }
    });
    (server, addr, handle)
}

fn client_config(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        ..ClientConfig::default()
    }
}

/// 服务端 setup：记录收到的聊天消息，收到 ping 时回复 pong!
fn chat_server(seen: Log<String>) -> impl FnOnce(&mut PacketRegistry, &mut Dispatcher) -> Result<()> {
    move |registry, dispatcher| {
        registry.register(ID_CHAT, ChatPacket::default)?;
        dispatcher.register(ID_CHAT, move |peer: &Peer, packet: &ChatPacket| {
            seen.lock().unwrap().push(packet.payload.clone());
            if packet.payload.contains("ping") {
                peer.send(&ChatPacket::new("pong!".to_string())).unwrap();
            }
            true
        })
    }
}

/// 客户端 setup：记录收到的聊天消息
fn chat_client(seen: Log<String>) -> impl FnOnce(&mut PacketRegistry, &mut Dispatcher) -> Result<()> {
    move |registry, dispatcher| {
        registry.register(ID_CHAT, ChatPacket::default)?;
        dispatcher.register(ID_CHAT, move |_: &Peer, packet: &ChatPacket| {
            seen.lock().unwrap().push(packet.payload.clone());
            true
        })
    }
}

async fn wait_active(server: &Server, count: usize) {
    within("active connection count", async {
        while server.active_count().await != count {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}

async fn wait_disconnected(client: &Client) {
    within("client disconnect", async {
        while client.is_connected() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}

#[tokio::test]
async fn test_ping_pong() {
    let server_seen = log();
    let client_seen = log();
    let (server, addr, _handle) =
        spawn_server(ServerConfig::default(), chat_server(Arc::clone(&server_seen))).await;

    let mut client = Client::new(client_config(addr), chat_client(Arc::clone(&client_seen))).unwrap();
    client.start().await.unwrap();
    assert!(client.is_connected());

    client
        .write(&ChatPacket::new("ping".to_string()))
        .await
        .unwrap();

    within("pong reply", async {
        while client_seen.lock().unwrap().is_empty() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    assert_eq!(*server_seen.lock().unwrap(), vec!["ping"]);
    assert_eq!(*client_seen.lock().unwrap(), vec!["pong!"]);

    client.stop().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_client_stop_removes_connection() {
    let server_seen = log();
    let (server, addr, _handle) =
        spawn_server(ServerConfig::default(), chat_server(Arc::clone(&server_seen))).await;

    let mut client = Client::new(client_config(addr), chat_client(log())).unwrap();
    client.start().await.unwrap();
    wait_active(&server, 1).await;

    client.write(&ChatPacket::new("hello".to_string())).await.unwrap();
    client.stop().await.unwrap();
    wait_active(&server, 0).await;

    // 停止后不能再写，也不会再有数据包被处理
    assert!(matches!(
        client.write(&ChatPacket::new("late".to_string())).await,
        Err(PacketError::AlreadyStopped)
    ));
    assert!(matches!(client.stop().await, Err(PacketError::AlreadyStopped)));
    sleep(Duration::from_millis(50)).await;
    assert_eq!(*server_seen.lock().unwrap(), vec!["hello"]);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_server_stop_closes_clients() {
    let (server, addr, handle) = spawn_server(ServerConfig::default(), chat_server(log())).await;

    let mut first = Client::new(client_config(addr), chat_client(log())).unwrap();
    let mut second = Client::new(client_config(addr), chat_client(log())).unwrap();
    first.start().await.unwrap();
    second.start().await.unwrap();
    wait_active(&server, 2).await;
    assert_eq!(server.active_connections().await.len(), 2);

    server.stop().await.unwrap();
    assert!(!server.is_accepting());

    wait_disconnected(&first).await;
    wait_disconnected(&second).await;

    // 客户端的 stop 不会因连接已断开而挂起
    within("first client stop", async { first.stop().await.unwrap() }).await;
    within("second client stop", async { second.stop().await.unwrap() }).await;

    within("accept loop exit", async { handle.await.unwrap().unwrap() }).await;
    within("server drain", server.wait_closed()).await;
    assert_eq!(server.active_count().await, 0);
}

#[tokio::test]
async fn test_concurrent_clients_keep_per_connection_order() {
    const CLIENTS: u32 = 8;
    const PACKETS: u32 = 50;

    let received: Log<(u64, u32, u32)> = log();
    let sink = Arc::clone(&received);
    let (server, addr, _handle) = spawn_server(ServerConfig::default(), move |registry, dispatcher| {
        registry.register(ID_SEQ, SeqPacket::default)?;
        dispatcher.register(ID_SEQ, move |peer: &Peer, packet: &SeqPacket| {
            let (client, seq) = packet.payload;
            sink.lock().unwrap().push((peer.id(), client, seq));
            true
        })
    })
    .await;

    let mut clients = Vec::new();
    for _ in 0..CLIENTS {
        let mut client = Client::new(client_config(addr), |registry, _| {
            registry.register(ID_SEQ, SeqPacket::default)
        })
        .unwrap();
        client.start().await.unwrap();
        clients.push(client);
    }
    wait_active(&server, CLIENTS as usize).await;

    let mut senders = Vec::new();
    for (index, client) in clients.into_iter().enumerate() {
        senders.push(tokio::spawn(async move {
            for seq in 0..PACKETS {
                client
                    .write(&SeqPacket::new((index as u32, seq)))
                    .await
                    .unwrap();
            }
            client
        }));
    }
    let mut clients = Vec::new();
    for sender in senders {
        clients.push(sender.await.unwrap());
    }

    within("all packets", async {
        while received.lock().unwrap().len() < (CLIENTS * PACKETS) as usize {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert_eq!(server.active_count().await, CLIENTS as usize);

    let received = received.lock().unwrap().clone();
    assert_eq!(received.len(), (CLIENTS * PACKETS) as usize);
    for client in 0..CLIENTS {
        let mine: Vec<&(u64, u32, u32)> = received.iter().filter(|(_, c, _)| *c == client).collect();
        // 同一客户端的数据包来自同一连接，且按发送顺序恰好处理一次
        let peer_id = mine[0].0;
        assert!(mine.iter().all(|(id, _, _)| *id == peer_id));
        let seqs: Vec<u32> = mine.iter().map(|(_, _, seq)| *seq).collect();
        assert_eq!(seqs, (0..PACKETS).collect::<Vec<_>>());
    }

    for client in &mut clients {
        client.stop().await.unwrap();
    }
    wait_active(&server, 0).await;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_packet_without_handler_keeps_connection() {
    let server_seen = log();
    let seen = Arc::clone(&server_seen);
    let (server, addr, _handle) = spawn_server(ServerConfig::default(), move |registry, dispatcher| {
        registry.register(ID_SEQ, SeqPacket::default)?;
        chat_server(seen)(registry, dispatcher)
    })
    .await;

    let mut client = Client::new(client_config(addr), |registry, _| {
        registry.register(ID_SEQ, SeqPacket::default)?;
        registry.register(ID_CHAT, ChatPacket::default)
    })
    .unwrap();
    client.start().await.unwrap();

    client.write(&SeqPacket::new((0, 0))).await.unwrap();
    client.write(&ChatPacket::new("still here".to_string())).await.unwrap();

    within("chat after unhandled packet", async {
        while server_seen.lock().unwrap().is_empty() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert_eq!(server.active_count().await, 1);

    client.stop().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_unregistered_packet_drops_connection() {
    let (server, addr, _handle) = spawn_server(ServerConfig::default(), chat_server(log())).await;

    let mut client = Client::new(client_config(addr), |registry, _| {
        registry.register(ID_UNREGISTERED, StrayPacket::default)
    })
    .unwrap();
    client.start().await.unwrap();
    wait_active(&server, 1).await;

    client.write(&StrayPacket::new(1)).await.unwrap();
    wait_active(&server, 0).await;
    wait_disconnected(&client).await;

    // 其他连接不受影响
    let mut other = Client::new(client_config(addr), chat_client(log())).unwrap();
    other.start().await.unwrap();
    wait_active(&server, 1).await;

    other.stop().await.unwrap();
    client.stop().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_idle_timeout_and_keep_alive() {
    let config = ServerConfig {
        idle_timeout: Some(Duration::from_millis(150)),
        ..ServerConfig::default()
    };
    let (server, addr, _handle) = spawn_server(config, chat_server(log())).await;

    let mut quiet = Client::new(client_config(addr), chat_client(log())).unwrap();
    let mut chatty = Client::new(
        ClientConfig {
            keep_alive: Some(Duration::from_millis(30)),
            ..client_config(addr)
        },
        chat_client(log()),
    )
    .unwrap();
    quiet.start().await.unwrap();
    chatty.start().await.unwrap();
    wait_active(&server, 2).await;

    // 没有心跳的连接被空闲超时断开，有心跳的保持连接
    wait_disconnected(&quiet).await;
    wait_active(&server, 1).await;
    sleep(Duration::from_millis(300)).await;
    assert!(chatty.is_connected());
    assert_eq!(server.active_count().await, 1);

    quiet.stop().await.unwrap();
    chatty.stop().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_connection_limit() {
    let config = ServerConfig {
        max_connections: Some(1),
        ..ServerConfig::default()
    };
    let (server, addr, _handle) = spawn_server(config, chat_server(log())).await;

    let mut first = Client::new(client_config(addr), chat_client(log())).unwrap();
    first.start().await.unwrap();
    wait_active(&server, 1).await;

    // 超出上限的连接收到关闭包后断开
    let mut second = Client::new(client_config(addr), chat_client(log())).unwrap();
    second.start().await.unwrap();
    wait_disconnected(&second).await;
    assert!(first.is_connected());
    assert_eq!(server.active_count().await, 1);

    first.stop().await.unwrap();
    second.stop().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_server_stop_with_stalled_peer() {
    let handled = log();
    let sink = Arc::clone(&handled);
    let config = ServerConfig {
        close_timeout: Duration::from_millis(200),
        ..ServerConfig::default()
    };
    // 每个请求都回复 4 MiB，对端不读取时写入端很快被塞满
    let (server, addr, handle) = spawn_server(config, move |registry, dispatcher| {
        registry.register(ID_CHAT, ChatPacket::default)?;
        dispatcher.register(ID_CHAT, move |peer: &Peer, packet: &ChatPacket| {
            sink.lock().unwrap().push(packet.payload.clone());
            let _ = peer.send(&BulkPacket::new(vec![0; BULK_LEN]));
            true
        })
    })
    .await;

    let mut stalled = TcpStream::connect(addr).await.unwrap();
    for _ in 0..4 {
        let frame = encode_packet(&ChatPacket::new("bulk".to_string())).unwrap();
        stalled.write_all(&frame).await.unwrap();
    }
    let mut healthy = Client::new(client_config(addr), chat_client(log())).unwrap();
    healthy.start().await.unwrap();
    wait_active(&server, 2).await;

    within("stalled requests handled", async {
        while handled.lock().unwrap().len() < 4 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    timeout(Duration::from_secs(3), server.stop())
        .await
        .expect("stop blocked on a peer that does not read")
        .unwrap();

    wait_disconnected(&healthy).await;
    within("accept loop exit", async { handle.await.unwrap().unwrap() }).await;
    within("server drain", server.wait_closed()).await;
    assert_eq!(server.active_count().await, 0);

    healthy.stop().await.unwrap();
    drop(stalled);
}

#[tokio::test]
async fn test_client_stop_with_stalled_server() {
    // 只接受连接、从不读取的服务端
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepting = tokio::spawn(async move { listener.accept().await.unwrap().0 });

    let mut client = Client::new(
        ClientConfig {
            close_timeout: Duration::from_millis(200),
            ..client_config(addr)
        },
        |_, _| Ok(()),
    )
    .unwrap();
    client.start().await.unwrap();
    let _server_side = accepting.await.unwrap();

    let peer = client.peer().unwrap().clone();
    for _ in 0..4 {
        peer.send(&BulkPacket::new(vec![0; BULK_LEN])).unwrap();
    }

    timeout(Duration::from_secs(3), client.stop())
        .await
        .expect("stop blocked on a server that does not read")
        .unwrap();
    assert!(!peer.is_open());
}
