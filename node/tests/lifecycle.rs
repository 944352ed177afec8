use chainlib::chain::{Chain, TxPool};
use chainlib::consensus;
use chainlib::db::{DbBackend, open_db};
use chainlib::store::Store;
use chainlib::types::Block;
use chrono::Utc;
use node_lib::error::{NodeError, RpcError, ServiceError};
use node_lib::service::ServiceState;
use node_lib::{Config, Node};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use wallet::account::{DELETE_SPENTS_PIN_NAME, PIN_NAME};

fn durable_config(home: &Path) -> Config {
    let mut config = Config::test_config(home);
    config.base.db_backend = DbBackend::Sled;
    config
}

// writes genesis plus `height - 1` empty blocks into the node's txdb
fn prefill_store(config: &Config, height: u64) {
    let db = open_db("txdb", DbBackend::Sled, &config.db_dir()).unwrap();
    let store = Arc::new(Store::new(db));
    let genesis = consensus::init_block();
    let chain = Chain::new(genesis.hash(), store, Arc::new(TxPool::new())).unwrap();
    chain.add_block(&genesis).unwrap();
    let mut prev = genesis;
    while chain.height() < height {
        let next = Block::next(&prev, vec![], Utc::now());
        chain.add_block(&next).unwrap();
        prev = next;
    }
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    String::from_utf8_lossy(&buf).into_owned()
}

#[tokio::test]
async fn fresh_node_bootstraps_genesis_and_pins() {
    let home = tempfile::tempdir().unwrap();
    let node = Node::new(Arc::new(Config::test_config(home.path())))
        .await
        .unwrap();

    assert_eq!(node.state(), ServiceState::Created);
    assert_eq!(node.store().height(), 1);
    let pins = node.pin_store().unwrap();
    // nothing has yielded since construction, so the indexers have not run
    assert_eq!(pins.height(PIN_NAME), 0);
    assert_eq!(pins.height(DELETE_SPENTS_PIN_NAME), 0);
    assert_eq!(
        node.switch().reactor_names(),
        vec!["BLOCKCHAIN".to_string(), "PEX".to_string()]
    );
}

#[tokio::test]
async fn existing_store_keeps_height_and_pins_one_below_tip() {
    let home = tempfile::tempdir().unwrap();
    let config = durable_config(home.path());
    prefill_store(&config, 50);

    let node = Node::new(Arc::new(config)).await.unwrap();
    assert_eq!(node.store().height(), 50);
    let pins = node.pin_store().unwrap();
    assert_eq!(pins.height(PIN_NAME), 49);
    assert_eq!(pins.height(DELETE_SPENTS_PIN_NAME), 49);
}

#[tokio::test]
async fn genesis_is_added_once_across_restarts() {
    let home = tempfile::tempdir().unwrap();
    let config = Arc::new(durable_config(home.path()));

    let first = Node::new(config.clone()).await.unwrap();
    assert_eq!(first.store().height(), 1);
    first.start().await.unwrap();
    first.stop().await.unwrap();
    drop(first);

    let second = Node::new(config).await.unwrap();
    assert_eq!(second.store().height(), 1);
    assert_eq!(
        second.store().get_block(1).unwrap().unwrap().hash(),
        consensus::init_block().hash()
    );
}

#[tokio::test]
async fn wallet_disabled_has_no_pins() {
    let home = tempfile::tempdir().unwrap();
    let mut config = Config::test_config(home.path());
    config.wallet.enable = false;
    config.p2p.pex = false;
    let node = Node::new(Arc::new(config)).await.unwrap();
    assert!(node.pin_store().is_none());
    assert!(node.addr_book().is_none());
    assert_eq!(node.switch().reactor_names(), vec!["BLOCKCHAIN".to_string()]);
}

#[tokio::test]
async fn start_and_stop_are_guarded() {
    let home = tempfile::tempdir().unwrap();
    let node = Node::new(Arc::new(Config::test_config(home.path())))
        .await
        .unwrap();

    assert!(matches!(
        node.stop().await,
        Err(NodeError::Service(ServiceError::NotRunning(_)))
    ));

    node.start().await.unwrap();
    assert!(node.is_running());
    assert!(node.switch().is_accepting());
    let info = node.node_info().unwrap();
    assert_eq!(info.network, consensus::NETWORK);
    assert!(!info.listen_addr.is_empty());
    assert!(info.get("rpc_addr").is_some());
    assert!(matches!(
        node.start().await,
        Err(NodeError::Service(ServiceError::AlreadyStarted(_)))
    ));

    node.stop().await.unwrap();
    assert_eq!(node.state(), ServiceState::Stopped);
    assert!(!node.switch().is_running());
    assert!(node.rpc_addrs().is_empty());
    assert!(matches!(
        node.stop().await,
        Err(NodeError::Service(ServiceError::AlreadyStopped(_)))
    ));
}

#[tokio::test]
async fn rpc_bind_failure_aborts_start_and_releases_listeners() {
    let home = tempfile::tempdir().unwrap();
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let free = probe.local_addr().unwrap();
    drop(probe);
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let taken = occupied.local_addr().unwrap();

    let mut config = Config::test_config(home.path());
    config.rpc.laddr = format!("tcp://{free},tcp://{taken}");
    let node = Node::new(Arc::new(config)).await.unwrap();

    let err = node.start().await.unwrap_err();
    assert!(matches!(err, NodeError::Rpc(RpcError::Bind { .. })));
    assert_eq!(node.state(), ServiceState::Stopped);
    assert!(!node.switch().is_running());
    TcpListener::bind(free).await.unwrap();
}

#[tokio::test]
async fn core_server_redirects_root_and_serves_handler() {
    let home = tempfile::tempdir().unwrap();
    let node = Node::new(Arc::new(Config::test_config(home.path())))
        .await
        .unwrap();
    let addr = node.core_addr();

    let root = http_get(addr, "/").await;
    assert!(root.starts_with("HTTP/1.1 302"));
    assert!(root.to_ascii_lowercase().contains("location: /dashboard/"));

    let info = http_get(addr, "/info").await;
    assert!(info.starts_with("HTTP/1.1 200"));
    assert!(info.contains("\"height\":1"));
    assert!(info.to_ascii_lowercase().contains("x-request-id"));
}

#[tokio::test]
async fn fatal_init_error_is_returned() {
    let home = tempfile::tempdir().unwrap();
    // a file where the key directory should be
    std::fs::write(home.path().join("keystore"), b"not a directory").unwrap();
    let err = Node::new(Arc::new(Config::test_config(home.path())))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, NodeError::Hsm(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nodes_connect_through_seeds() {
    let home_a = tempfile::tempdir().unwrap();
    let a = Node::new(Arc::new(Config::test_config(home_a.path())))
        .await
        .unwrap();
    a.start().await.unwrap();
    let a_addr = a.switch().listeners()[0].internal_address();

    let home_b = tempfile::tempdir().unwrap();
    let mut config_b = Config::test_config(home_b.path());
    config_b.p2p.seeds = a_addr.to_string();
    let b = Node::new(Arc::new(config_b)).await.unwrap();
    b.start().await.unwrap();

    time::timeout(Duration::from_secs(10), async {
        while a.switch().peers().is_empty() || b.switch().peers().is_empty() {
            time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(b.switch().num_peers().0, 1);
    assert_eq!(a.switch().num_peers().1, 1);

    b.stop().await.unwrap();
    a.stop().await.unwrap();
}
