use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use netgate::{
    AppError, DispatchRegistry, EndpointConfig, EngineConfig, Frame, FrameCodec, HandlerContext,
    NetworkEngine,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const ECHO_ID: u16 = 1;
const PING_ID: u16 = 2;
const PONG_ID: u16 = 3;

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.network.listeners = vec![EndpointConfig {
        ip: "127.0.0.1".to_string(),
        port: 0,
    }];
    config.network.max_connection = 8;
    config.outbound.num_channels = 2;
    config.pool.max_retained = 8;
    config.pool.preallocate = 2;
    config
}

fn echo_dispatch() -> DispatchRegistry {
    let mut dispatch = DispatchRegistry::new();
    dispatch.register(ECHO_ID, |ctx: &HandlerContext<'_>| {
        ctx.reply(ECHO_ID, ctx.body)
    });
    dispatch
}

async fn start_engine(config: EngineConfig, dispatch: DispatchRegistry) -> NetworkEngine {
    let mut engine = NetworkEngine::new(config, dispatch).unwrap();
    engine.start().await.unwrap();
    engine
}

async fn write_frame(stream: &mut TcpStream, codec: &FrameCodec, frame: &Frame) {
    let encoded = codec.encode_to_bytes(frame).unwrap();
    stream.write_all(&encoded).await.unwrap();
    stream.flush().await.unwrap();
}

async fn read_frame(stream: &mut TcpStream, codec: &FrameCodec) -> (u16, Vec<u8>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let decoded = match codec.decode(&buf).unwrap() {
            Some((view, consumed)) => Some((view.message_id, view.body.to_vec(), consumed)),
            None => None,
        };
        if let Some((id, body, consumed)) = decoded {
            buf.drain(..consumed);
            return (id, body);
        }
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed while waiting for a frame");
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, predicate: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !predicate() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_end_to_end_echo() {
    let engine = start_engine(test_config(), echo_dispatch()).await;
    let addr = engine.listen_addrs()[0];
    let codec = FrameCodec::new(16 * 1024);

    let mut client = TcpStream::connect(addr).await.unwrap();
    write_frame(
        &mut client,
        &codec,
        &Frame::new(ECHO_ID, Bytes::from_static(b"hello engine")),
    )
    .await;

    let (id, body) = read_frame(&mut client, &codec).await;
    assert_eq!(id, ECHO_ID);
    assert_eq!(body, b"hello engine");

    let registry = engine.registry();
    assert_eq!(registry.count(), 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_admission_holds_second_connection_until_slot_frees() {
    let mut config = test_config();
    config.network.max_connection = 1;
    let engine = start_engine(config, echo_dispatch()).await;
    let addr = engine.listen_addrs()[0];
    let codec = FrameCodec::new(16 * 1024);

    let mut first = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut first, &codec, &Frame::new(ECHO_ID, Bytes::from_static(b"one"))).await;
    let (_, body) = read_frame(&mut first, &codec).await;
    assert_eq!(body, b"one");

    // the second connect lands in the listen backlog; the engine does not
    // process it while the only slot is taken
    let mut second = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut second, &codec, &Frame::new(ECHO_ID, Bytes::from_static(b"two"))).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(engine.registry().count(), 1);

    // freeing the slot admits the held connection, which is then served
    drop(first);
    let (_, body) = read_frame(&mut second, &codec).await;
    assert_eq!(body, b"two");
    assert_eq!(engine.registry().count(), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_close_hook_fires_exactly_once_per_connection() {
    let engine = start_engine(test_config(), echo_dispatch()).await;
    let addr = engine.listen_addrs()[0];

    let closes = Arc::new(AtomicUsize::new(0));
    {
        let closes = closes.clone();
        engine.set_close_hook(Arc::new(move |_, _| {
            closes.fetch_add(1, Ordering::SeqCst);
        }));
    }

    let first = TcpStream::connect(addr).await.unwrap();
    let second = TcpStream::connect(addr).await.unwrap();
    wait_until("both connections registered", || engine.registry().count() == 2).await;

    // race an explicit close against the peer dropping
    let ids: Vec<u64> = engine.registry().snapshot().iter().map(|c| c.id()).collect();
    drop(first);
    drop(second);
    for id in ids {
        engine.close_connection(id);
    }

    wait_until("registry drained", || engine.registry().count() == 0).await;
    wait_until("close hooks fired", || closes.load(Ordering::SeqCst) == 2).await;
    // exactly once per connection, never again
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(closes.load(Ordering::SeqCst), 2);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_connector_between_two_engines() {
    // server side replies PONG to every PING
    let mut server_dispatch = DispatchRegistry::new();
    server_dispatch.register(PING_ID, |ctx: &HandlerContext<'_>| {
        ctx.reply(PONG_ID, ctx.body)
    });
    let server = start_engine(test_config(), server_dispatch).await;
    let server_addr = server.listen_addrs()[0];

    // client side records the PONGs it receives
    let pongs = Arc::new(AtomicUsize::new(0));
    let mut client_dispatch = DispatchRegistry::new();
    {
        let pongs = pongs.clone();
        client_dispatch.register(PONG_ID, move |ctx: &HandlerContext<'_>| {
            assert_eq!(ctx.body, b"are you there");
            pongs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }
    let mut client_config = test_config();
    client_config.network.listeners = Vec::new();
    let client = NetworkEngine::new(client_config, client_dispatch).unwrap();

    let conn = client.connect(server_addr).await.unwrap();
    assert_eq!(conn.remote_addr(), server_addr);
    conn.send(PING_ID, b"are you there").unwrap();

    wait_until("pong received", || pongs.load(Ordering::SeqCst) == 1).await;

    // the same endpoint cannot be connected twice
    let err = client.connect(server_addr).await.unwrap_err();
    assert!(matches!(err, AppError::DuplicatePeer(_)));

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_queue_send_through_outbound_workers() {
    let engine = start_engine(test_config(), echo_dispatch()).await;
    let addr = engine.listen_addrs()[0];
    let codec = FrameCodec::new(16 * 1024);

    let mut client = TcpStream::connect(addr).await.unwrap();
    wait_until("connection registered", || engine.registry().count() == 1).await;
    let conn = engine.registry().snapshot().pop().unwrap();

    for i in 0..10u8 {
        engine
            .queue_send(conn.clone(), Frame::new(40, Bytes::from(vec![i])))
            .await
            .unwrap();
    }
    for i in 0..10u8 {
        let (id, body) = read_frame(&mut client, &codec).await;
        assert_eq!(id, 40);
        assert_eq!(body, vec![i]);
    }

    engine.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_active_connections() {
    let engine = start_engine(test_config(), echo_dispatch()).await;
    let addr = engine.listen_addrs()[0];

    let mut client = TcpStream::connect(addr).await.unwrap();
    wait_until("connection registered", || engine.registry().count() == 1).await;

    engine.shutdown().await;

    // the engine side closed; the client observes EOF
    let mut chunk = [0u8; 16];
    let n = client.read(&mut chunk).await.unwrap();
    assert_eq!(n, 0);
}
