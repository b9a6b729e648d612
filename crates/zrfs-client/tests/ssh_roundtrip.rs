//! End-to-end tests over a real SSH connection.
//!
//! A russh server on an ephemeral port serves the `zrfs` subsystem from an
//! in-memory tree, using generated keys on both sides.

mod common;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use common::MemoryServer;
use russh::keys::{Algorithm, PrivateKey, ssh_key};
use russh::server::{self, Auth, Msg, Server as _, Session};
use russh::ChannelId;
use tokio::net::TcpListener;
use zrfs_client::{KeySource, SshConfig};

fn host_key() -> PrivateKey {
    PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519).unwrap()
}

struct TestServer {
    fs: Arc<MemoryServer>,
}

impl server::Server for TestServer {
    type Handler = ConnectionHandler;

    fn new_client(&mut self, _peer_addr: Option<SocketAddr>) -> Self::Handler {
        ConnectionHandler {
            fs: self.fs.clone(),
            channels: HashMap::new(),
        }
    }
}

struct ConnectionHandler {
    fs: Arc<MemoryServer>,
    channels: HashMap<ChannelId, russh::Channel<Msg>>,
}

impl server::Handler for ConnectionHandler {
    type Error = russh::Error;

    async fn channel_open_session(
        &mut self,
        channel: russh::Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        match (name, self.channels.remove(&channel)) {
            ("zrfs", Some(ch)) => {
                session.channel_success(channel)?;
                tokio::spawn(common::serve(ch.into_stream(), self.fs.clone()));
            }
            _ => session.channel_failure(channel)?,
        }
        Ok(())
    }

    async fn auth_publickey(
        &mut self,
        _user: &str,
        _public_key: &ssh_key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }
}

/// Start a server for `fs` and return its address.
async fn start_server(fs: Arc<MemoryServer>, key: PrivateKey) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = Arc::new(server::Config {
        auth_rejection_time: std::time::Duration::from_secs(1),
        auth_rejection_time_initial: Some(std::time::Duration::from_secs(0)),
        keys: vec![key],
        ..Default::default()
    });

    tokio::spawn(async move {
        let mut server = TestServer { fs };
        if let Err(e) = server.run_on_socket(config, &listener).await {
            log::error!("test server stopped: {}", e);
        }
    });
    addr
}

fn client_config(addr: SocketAddr) -> SshConfig {
    SshConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        username: "test_user".to_string(),
        server_key: None,
        key_source: KeySource::ephemeral().unwrap(),
    }
}

#[tokio::test]
async fn test_file_round_trip_over_ssh() {
    common::init_logging();
    let fs = MemoryServer::new();
    let addr = start_server(fs.clone(), host_key()).await;

    let session = zrfs_client::connect(client_config(addr)).await.unwrap();
    session.mkdir_all("/a/b").await.unwrap();
    session.write_file("/a/b/hello.txt", "over the wire").await.unwrap();

    assert_eq!(
        session.read_to_string("/a/b/hello.txt").await.unwrap(),
        "over the wire"
    );
    assert_eq!(session.readdir("/a/b").await.unwrap(), vec!["hello.txt"]);
    assert!(session.stat("/a/missing").await.unwrap_err().is_not_found());
    assert_eq!(fs.file("/a/b/hello.txt").unwrap(), b"over the wire");

    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_requests_share_one_channel() {
    let fs = MemoryServer::new();
    for i in 0..8 {
        fs.add_file(&format!("/f{i}"), format!("file {i}"));
    }
    let addr = start_server(fs.clone(), host_key()).await;
    let session = zrfs_client::connect(client_config(addr)).await.unwrap();

    let reads = (0..8).map(|i| {
        let session = session.clone();
        async move { session.read_to_string(&format!("/f{i}")).await }
    });
    let contents = futures::future::try_join_all(reads).await.unwrap();
    for (i, text) in contents.iter().enumerate() {
        assert_eq!(text, &format!("file {i}"));
    }
}

#[tokio::test]
async fn test_pinned_server_key_is_accepted() {
    let key = host_key();
    let public = key.public_key().to_openssh().unwrap();
    let fs = MemoryServer::new();
    let addr = start_server(fs, key).await;

    let config = client_config(addr).with_server_key(&public).unwrap();
    let session = zrfs_client::connect(config).await.unwrap();
    session.access("/").await.unwrap();
}

#[tokio::test]
async fn test_wrong_server_key_is_rejected() {
    let other = host_key().public_key().to_openssh().unwrap();
    let fs = MemoryServer::new();
    let addr = start_server(fs.clone(), host_key()).await;

    let config = client_config(addr).with_server_key(&other).unwrap();
    assert!(zrfs_client::connect(config).await.is_err());
    assert_eq!(fs.count(zrfs_proto::Opcode::Access), 0);
}
