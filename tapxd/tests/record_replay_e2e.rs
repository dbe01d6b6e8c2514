use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tapx_core::config::{
    Config, DestinationConfig, FactoryConfig, ProxyConfig, RuntimeConfig, SessionConfig,
    SessionMode, SystemLogConfig,
};
use tapx_core::models::{MockKind, MockSpec};
use tapx_core::storage::{InMemoryMockStore, MockReader, SessionWriter};
use tapxd::runtime::RuntimeState;
use tapxd::{net, proxy};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const SESSION: &str = "e2e";

fn test_config(mode: SessionMode, upstream: Option<String>) -> Config {
    Config {
        version: 1,
        session: SessionConfig {
            name: SESSION.to_string(),
            mode,
        },
        proxy: ProxyConfig {
            listen: "127.0.0.1:0".to_string(),
            peek_bytes: 32,
            peek_timeout_ms: 200,
            dial_timeout_ms: 1_000,
            destination: DestinationConfig {
                mode: "static".to_string(),
                static_targets: Vec::new(),
                fallback: upstream,
            },
            mysql_ports: vec![3306],
        },
        runtime: RuntimeConfig {
            acceptor_tasks_per_listener: Some(1),
            ..RuntimeConfig::default()
        },
        system_log: SystemLogConfig::default(),
        metrics: None,
        factory: FactoryConfig::default(),
    }
}

async fn spawn_upstream() -> Result<std::net::SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1_024];
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let reply: &[u8] = if &buf[..n] == b"ping" {
                                b"pong"
                            } else {
                                b"unexpected"
                            };
                            if sock.write_all(reply).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    Ok(addr)
}

async fn wait_for_mocks(store: &InMemoryMockStore, count: usize) -> Result<()> {
    for _ in 0..100 {
        if store.load(SESSION).await?.len() >= count {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    anyhow::bail!("expected {count} recorded mocks");
}

#[tokio::test]
async fn generic_record_then_replay_over_loopback() -> Result<()> {
    let upstream_addr = spawn_upstream().await?;
    let store = Arc::new(InMemoryMockStore::new());

    // Record: the dispatcher resolves the upstream, classifies the traffic
    // as generic, tees it, and emits one mock for the exchange.
    let record_token = CancellationToken::new();
    let (mock_tx, mut mock_rx) = mpsc::channel(32);
    let writer = Arc::new(SessionWriter::new(SESSION, mock_tx));
    let config = test_config(SessionMode::Record, Some(upstream_addr.to_string()));
    let state = Arc::new(RuntimeState::build(config, writer)?);
    let listeners = net::bind_tcp_listeners("127.0.0.1:0".parse()?, &state.config.runtime)?;
    let proxy_addr = listeners[0].local_addr()?;
    let record_serve = tokio::spawn(proxy::serve(
        state.clone(),
        record_token.clone(),
        listeners,
    ));
    let collector_store = store.clone();
    tokio::spawn(async move {
        while let Some(mock) = mock_rx.recv().await {
            collector_store.append(SESSION, mock);
        }
    });

    let mut client = TcpStream::connect(proxy_addr).await?;
    client.write_all(b"ping").await?;
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).await?;
    assert_eq!(&reply, b"pong");
    client.shutdown().await?;
    drop(client);

    wait_for_mocks(&store, 1).await?;
    let recorded = store.load(SESSION).await?;
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].kind, MockKind::Generic);
    assert_eq!(recorded[0].name, "mock-0");
    match &recorded[0].spec {
        MockSpec::Generic(spec) => {
            assert_eq!(spec.request, b"ping");
            assert_eq!(spec.response, b"pong");
        }
        other => panic!("unexpected spec: {other:?}"),
    }

    record_token.cancel();
    record_serve.await??;

    // Replay: no upstream dial; the recorded response is served from the
    // mock DB and a second identical request finds nothing.
    let replay_token = CancellationToken::new();
    let (mock_tx, _mock_rx) = mpsc::channel(32);
    let writer = Arc::new(SessionWriter::new(SESSION, mock_tx));
    let config = test_config(SessionMode::Replay, None);
    let state = Arc::new(RuntimeState::build(config, writer)?);
    state.mock_db.set_mocks(store.load(SESSION).await?, Vec::new());
    let listeners = net::bind_tcp_listeners("127.0.0.1:0".parse()?, &state.config.runtime)?;
    let proxy_addr = listeners[0].local_addr()?;
    let replay_serve = tokio::spawn(proxy::serve(
        state.clone(),
        replay_token.clone(),
        listeners,
    ));

    let mut client = TcpStream::connect(proxy_addr).await?;
    client.write_all(b"ping").await?;
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).await?;
    assert_eq!(&reply, b"pong");
    client.shutdown().await?;
    drop(client);

    // The only mock is consumed now; the same request cannot match again.
    let mut client = TcpStream::connect(proxy_addr).await?;
    client.write_all(b"ping").await?;
    let mut leftovers = Vec::new();
    client.read_to_end(&mut leftovers).await?;
    assert!(leftovers.is_empty(), "no mock should remain to serve");

    assert_eq!(state.mock_db.consumed_names(), vec!["mock-0".to_string()]);

    replay_token.cancel();
    replay_serve.await??;
    Ok(())
}
