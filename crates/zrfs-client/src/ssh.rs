//! SSH transport for the ZRFS subsystem.
//!
//! Uses russh for the secure channel. The server is authenticated by its
//! public key; the client authenticates with an explicit key or with every
//! identity the SSH agent offers. A single session channel is opened and
//! switched to the `zrfs` subsystem, which then carries tagged request and
//! reply frames (see [`crate::transport`]).

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, Config, Handle, Msg};
use russh::keys::agent::client::AgentClient;
use russh::keys::{Algorithm, HashAlg, PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelStream, Disconnect};

use crate::constants::{
    DEFAULT_SSH_HOST, DEFAULT_SSH_PORT, SSH_INACTIVITY_TIMEOUT, SSH_KEEPALIVE_INTERVAL,
    SSH_KEEPALIVE_MAX, ZRFS_SUBSYSTEM,
};
use crate::transport::{Channel, FramedChannel, TransportError};

/// How the client proves its identity.
#[derive(Clone, Default)]
pub enum KeySource {
    /// Offer each identity held by the SSH agent (`SSH_AUTH_SOCK`).
    #[default]
    Agent,
    /// Sign with an in-memory private key.
    Key(Arc<PrivateKey>),
}

impl KeySource {
    /// A fresh Ed25519 key, for servers that accept any client.
    pub fn ephemeral() -> Result<Self, SshError> {
        let key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)
            .map_err(|e| SshError::InvalidKey(e.to_string()))?;
        Ok(KeySource::Key(Arc::new(key)))
    }

    /// Load an OpenSSH private key file.
    pub fn from_file(path: impl AsRef<Path>, passphrase: Option<&str>) -> Result<Self, SshError> {
        let key = russh::keys::load_secret_key(path, passphrase)
            .map_err(|e| SshError::InvalidKey(e.to_string()))?;
        Ok(KeySource::Key(Arc::new(key)))
    }
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::Agent => f.write_str("Agent"),
            KeySource::Key(key) => {
                let fingerprint = key.public_key().fingerprint(HashAlg::Sha256).to_string();
                f.debug_tuple("Key").field(&fingerprint).finish()
            }
        }
    }
}

/// SSH connection configuration
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Expected server identity. `None` accepts any key, with a warning.
    pub server_key: Option<PublicKey>,
    pub key_source: KeySource,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_SSH_HOST.into(),
            port: DEFAULT_SSH_PORT,
            username: whoami::username(),
            server_key: None,
            key_source: KeySource::default(),
        }
    }
}

impl SshConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Pin the server identity from an OpenSSH public key line
    /// (`ssh-ed25519 AAAA... comment`).
    pub fn with_server_key(mut self, openssh: &str) -> Result<Self, SshError> {
        let key = PublicKey::from_openssh(openssh.trim())
            .map_err(|e| SshError::InvalidKey(e.to_string()))?;
        self.server_key = Some(key);
        Ok(self)
    }

    pub fn with_key_source(mut self, key_source: KeySource) -> Self {
        self.key_source = key_source;
        self
    }
}

/// Client handler for russh - handles server key verification
struct ClientHandler {
    expected: Option<PublicKey>,
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256);
        match &self.expected {
            Some(expected) if expected.key_data() == server_public_key.key_data() => {
                log::debug!("Server key verified: {}", fingerprint);
                Ok(true)
            }
            Some(expected) => {
                log::error!(
                    "Server key mismatch: expected {}, got {}",
                    expected.fingerprint(HashAlg::Sha256),
                    fingerprint
                );
                Ok(false)
            }
            None => {
                log::warn!("Accepting server key without verification: {}", fingerprint);
                Ok(true)
            }
        }
    }
}

/// SSH client wrapper
pub struct SshClient {
    config: SshConfig,
}

impl SshClient {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    /// Connect, authenticate and open the `zrfs` subsystem.
    pub async fn connect(self) -> Result<SshChannel, SshError> {
        let config = Config {
            inactivity_timeout: Some(SSH_INACTIVITY_TIMEOUT),
            keepalive_interval: Some(SSH_KEEPALIVE_INTERVAL),
            keepalive_max: SSH_KEEPALIVE_MAX,
            ..<_>::default()
        };

        let handler = ClientHandler {
            expected: self.config.server_key.clone(),
        };
        let addr = (self.config.host.as_str(), self.config.port);
        let mut session = client::connect(Arc::new(config), addr, handler)
            .await
            .map_err(|e| SshError::ConnectionFailed(e.to_string()))?;

        log::info!(
            "Connected to {}:{}, attempting authentication",
            self.config.host,
            self.config.port
        );

        match &self.config.key_source {
            KeySource::Agent => self.authenticate_with_agent(&mut session).await?,
            KeySource::Key(key) => self.authenticate_with_key(&mut session, key.clone()).await?,
        }

        let channel = session
            .channel_open_session()
            .await
            .map_err(|e| SshError::ChannelFailed(format!("session: {}", e)))?;
        channel
            .request_subsystem(true, ZRFS_SUBSYSTEM)
            .await
            .map_err(|e| SshError::ChannelFailed(format!("subsystem {}: {}", ZRFS_SUBSYSTEM, e)))?;

        log::info!("Opened {} subsystem channel", ZRFS_SUBSYSTEM);

        Ok(SshChannel {
            frames: FramedChannel::new(channel.into_stream()),
            session: tokio::sync::Mutex::new(Some(session)),
        })
    }

    async fn authenticate_with_key(
        &self,
        session: &mut Handle<ClientHandler>,
        key: Arc<PrivateKey>,
    ) -> Result<(), SshError> {
        let hash_alg = rsa_hash(session).await;
        let fingerprint = key.public_key().fingerprint(HashAlg::Sha256);

        let result = session
            .authenticate_publickey(
                &self.config.username,
                PrivateKeyWithHashAlg::new(key, hash_alg),
            )
            .await?;

        if result.success() {
            log::info!("Authenticated as {} with key {}", self.config.username, fingerprint);
            Ok(())
        } else {
            Err(SshError::AuthFailed(format!("key {} rejected", fingerprint)))
        }
    }

    async fn authenticate_with_agent(
        &self,
        session: &mut Handle<ClientHandler>,
    ) -> Result<(), SshError> {
        fn agent_err(e: impl fmt::Display) -> SshError {
            SshError::AgentFailed(e.to_string())
        }

        let mut agent = AgentClient::connect_env().await.map_err(agent_err)?;
        let identities = agent.request_identities().await.map_err(agent_err)?;
        if identities.is_empty() {
            return Err(SshError::NoKeysAvailable);
        }

        log::debug!("SSH agent offers {} identities", identities.len());
        let user = &self.config.username;

        for identity in identities {
            let fingerprint = identity.fingerprint(HashAlg::Sha256);
            let hash_alg = rsa_hash(session).await;
            match session
                .authenticate_publickey_with(user, identity, hash_alg, &mut agent)
                .await
            {
                Ok(result) if result.success() => {
                    log::info!("Authenticated as {} with agent key {}", user, fingerprint);
                    return Ok(());
                }
                Ok(_) => log::debug!("Agent key {} rejected", fingerprint),
                Err(e) => log::warn!("Agent key {} failed: {}", fingerprint, e),
            }
        }

        Err(SshError::AuthFailed(format!(
            "no agent identity accepted for {}",
            user
        )))
    }
}

/// RSA signature hash the server prefers, if it says.
async fn rsa_hash(session: &Handle<ClientHandler>) -> Option<HashAlg> {
    session
        .best_supported_rsa_hash()
        .await
        .ok()
        .flatten()
        .flatten()
}

/// The `zrfs` subsystem channel of an authenticated SSH session.
pub struct SshChannel {
    frames: FramedChannel<ChannelStream<Msg>>,
    session: tokio::sync::Mutex<Option<Handle<ClientHandler>>>,
}

#[async_trait]
impl Channel for SshChannel {
    async fn request(&self, frame: Bytes) -> Result<Bytes, TransportError> {
        self.frames.request(frame).await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if let Err(e) = self.frames.disconnect().await {
            log::debug!("Closing subsystem channel: {}", e);
        }
        if let Some(session) = self.session.lock().await.take() {
            session
                .disconnect(Disconnect::ByApplication, "zrfs session closed", "en")
                .await
                .map_err(|e| TransportError::Ssh(e.to_string()))?;
        }
        Ok(())
    }
}

/// Failures while setting up the SSH transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SshError {
    #[error("cannot reach server: {0}")]
    ConnectionFailed(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("cannot open zrfs channel: {0}")]
    ChannelFailed(String),
    #[error("SSH agent: {0}")]
    AgentFailed(String),
    #[error("SSH agent holds no identities")]
    NoKeysAvailable,
    #[error("bad key: {0}")]
    InvalidKey(String),
}

impl From<russh::Error> for SshError {
    fn from(e: russh::Error) -> Self {
        SshError::ConnectionFailed(e.to_string())
    }
}
