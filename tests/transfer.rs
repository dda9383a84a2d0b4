//! End-to-end transfers against a real server on a loopback port

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use tempfile::TempDir;

use blockxfer::cipher::KeyPair;
use blockxfer::protocol::ExchangeState;
use blockxfer::{
    BlockCipher, Client, ClientConfig, ClientSession, DigestScope, Error, IntegrityPolicy, Server,
    ServerConfig,
};

fn keys() -> Arc<KeyPair> {
    static KEYS: OnceLock<Arc<KeyPair>> = OnceLock::new();
    KEYS.get_or_init(|| Arc::new(KeyPair::generate(1024).unwrap()))
        .clone()
}

struct Harness {
    addr: SocketAddr,
    root: TempDir,
    scope: DigestScope,
}

impl Harness {
    async fn start(cache_capacity: usize, scope: DigestScope) -> Self {
        let root = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            storage_dir: root.path().join("store"),
            cache_capacity,
            keys: keys(),
            digest_scope: scope,
            integrity_policy: IntegrityPolicy::Warn,
            max_file_size: 1024 * 1024,
        };

        let server = Server::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        Self { addr, root, scope }
    }

    async fn session(&self) -> ClientSession {
        let client = Client::new(ClientConfig {
            server_host: self.addr.ip().to_string(),
            port: self.addr.port(),
            keys: keys(),
            digest_scope: self.scope,
            show_progress: false,
        });
        client.connect().await.unwrap()
    }

    fn store(&self) -> std::path::PathBuf {
        self.root.path().join("store")
    }
}

#[tokio::test]
async fn test_empty_file_round_trip() {
    let harness = Harness::start(10, DigestScope::Plaintext).await;
    let local = harness.root.path().join("empty.txt");
    std::fs::write(&local, b"").unwrap();

    let mut session = harness.session().await;
    let receipt = session.put(&local, "empty.txt").await.unwrap();
    assert_eq!(receipt.size, 0);
    assert_eq!(receipt.digest, "d41d8cd98f00b204e9800998ecf8427e");
    assert_eq!(std::fs::read(harness.store().join("empty.txt")).unwrap(), b"");

    let save_as = harness.root.path().join("downloaded.txt");
    let receipt = session.get("empty.txt", &save_as).await.unwrap();
    assert_eq!(receipt.size, 0);
    assert_eq!(receipt.digest, "d41d8cd98f00b204e9800998ecf8427e");
    assert_eq!(std::fs::read(&save_as).unwrap(), b"");
    assert_eq!(session.state(), ExchangeState::Done);
}

#[tokio::test]
async fn test_exact_block_round_trip() {
    let harness = Harness::start(10, DigestScope::Plaintext).await;
    let block_size = BlockCipher::new(keys()).block_size();
    let content: Vec<u8> = (0..block_size).map(|i| (i * 7) as u8).collect();

    let mut session = harness.session().await;
    session.put_bytes("block.bin", content.clone()).await.unwrap();

    let (downloaded, receipt) = session.get_bytes("block.bin").await.unwrap();
    assert_eq!(downloaded, content);
    assert_eq!(receipt.size as usize, block_size);
}

#[tokio::test]
async fn test_multi_block_with_ciphertext_digest() {
    let harness = Harness::start(10, DigestScope::Ciphertext).await;
    let block_size = BlockCipher::new(keys()).block_size();
    let content: Vec<u8> = (0..block_size * 3 + 5).map(|i| (i % 251) as u8).collect();

    let mut session = harness.session().await;
    session.put_bytes("nested/data.bin", content.clone()).await.unwrap();
    assert_eq!(
        std::fs::read(harness.store().join("nested/data.bin")).unwrap(),
        content
    );

    let (downloaded, _) = session.get_bytes("nested/data.bin").await.unwrap();
    assert_eq!(downloaded, content);
}

#[tokio::test]
async fn test_traversal_is_rejected() {
    let harness = Harness::start(10, DigestScope::Plaintext).await;
    std::fs::write(harness.root.path().join("secret"), b"outside").unwrap();

    let mut session = harness.session().await;
    let save_as = harness.root.path().join("stolen");
    let err = session.get("../secret", &save_as).await.unwrap_err();

    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Rejected(_))));
    assert_eq!(session.state(), ExchangeState::Failed);
    assert!(!save_as.exists());
    assert_eq!(
        std::fs::read(harness.root.path().join("secret")).unwrap(),
        b"outside"
    );

    // A failed session refuses further requests
    assert!(session.get_bytes("anything").await.is_err());

    // The server is still serving
    let mut fresh = harness.session().await;
    fresh.put_bytes("ok.txt", b"fine".to_vec()).await.unwrap();
}

#[tokio::test]
async fn test_missing_file_is_rejected() {
    let harness = Harness::start(10, DigestScope::Plaintext).await;

    let mut session = harness.session().await;
    let err = session.get_bytes("nope.txt").await.unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Rejected(_))));
}

#[tokio::test]
async fn test_last_put_wins_across_connections() {
    let harness = Harness::start(10, DigestScope::Plaintext).await;

    let mut first = harness.session().await;
    first.put_bytes("shared.txt", b"first".to_vec()).await.unwrap();
    drop(first);

    let mut second = harness.session().await;
    second.put_bytes("shared.txt", b"second".to_vec()).await.unwrap();

    let mut reader = harness.session().await;
    let (content, _) = reader.get_bytes("shared.txt").await.unwrap();
    assert_eq!(content, b"second");
}

#[tokio::test]
async fn test_cached_file_is_replaced_by_put() {
    let harness = Harness::start(2, DigestScope::Plaintext).await;
    let mut session = harness.session().await;

    session.put_bytes("doc.txt", b"v1".to_vec()).await.unwrap();
    let (content, _) = session.get_bytes("doc.txt").await.unwrap();
    assert_eq!(content, b"v1");

    session.put_bytes("doc.txt", b"v2".to_vec()).await.unwrap();
    let (content, _) = session.get_bytes("doc.txt").await.unwrap();
    assert_eq!(content, b"v2");
}

#[tokio::test]
async fn test_uncached_server_serves_from_disk() {
    let harness = Harness::start(0, DigestScope::Plaintext).await;
    std::fs::write(harness.store().join("disk.txt"), b"on disk").unwrap();

    let mut session = harness.session().await;
    let (content, receipt) = session.get_bytes("disk.txt").await.unwrap();
    assert_eq!(content, b"on disk");
    assert_eq!(receipt.size, 7);
}

#[tokio::test]
async fn test_concurrent_clients() {
    let harness = Arc::new(Harness::start(4, DigestScope::Plaintext).await);

    let mut tasks = Vec::new();
    for i in 0..4u8 {
        let harness = harness.clone();
        tasks.push(tokio::spawn(async move {
            let name = format!("client-{}.bin", i);
            let content = vec![i; 300 + i as usize];
            let mut session = harness.session().await;
            session.put_bytes(&name, content.clone()).await.unwrap();
            let (downloaded, _) = session.get_bytes(&name).await.unwrap();
            assert_eq!(downloaded, content);
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn test_upload_from_and_download_to_disk() {
    let harness = Harness::start(10, DigestScope::Plaintext).await;
    let local = harness.root.path().join("report.txt");
    std::fs::write(&local, b"quarterly numbers\n").unwrap();

    let mut session = harness.session().await;
    session.put(&local, "report.txt").await.unwrap();

    let save_as = harness.root.path().join("out/report-copy.txt");
    session.get("report.txt", &save_as).await.unwrap();
    assert_eq!(std::fs::read(&save_as).unwrap(), b"quarterly numbers\n");
    assert!(!harness.root.path().join("out/.report-copy.txt.part").exists());
}

#[tokio::test]
async fn test_multiline_name_refused_before_sending() {
    let harness = Harness::start(10, DigestScope::Plaintext).await;
    let mut session = harness.session().await;

    for result in [
        session.put_bytes("bad\nname", b"x".to_vec()).await.map(|_| ()),
        session.get_bytes("bad\nname").await.map(|_| ()),
    ] {
        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InvalidFilename(_))
        ));
    }
    assert_eq!(session.state(), ExchangeState::Idle);

    // Nothing reached the server, so the connection is still usable
    session.put_bytes("good.txt", b"fine".to_vec()).await.unwrap();
    let (content, _) = session.get_bytes("good.txt").await.unwrap();
    assert_eq!(content, b"fine");
}
