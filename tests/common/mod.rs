#![allow(dead_code)]

use std::{
    io,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering::Relaxed},
    time::Duration,
};

use blake2::{Blake2s256, Digest};
use bytes::{Bytes, BytesMut};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use peerwire::{
    packet, Config, ConnectionSide, Established, Handshake, Node, Session, SessionError, Signal,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    time::timeout,
};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use x25519_dalek::{PublicKey, StaticSecret};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const HELLO_LEN: usize = 2 * KEY_LEN;

pub fn start_logger(default_level: LevelFilter) {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        _ => EnvFilter::default().add_directive(default_level.into()),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .without_time()
        .with_target(false)
        .try_init();
}

fn derive(label: &[u8], input: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Blake2s256::new().chain_update(label).chain_update(input).finalize());
    out
}

/// The static keys of a test node, derived from its name.
pub struct Keypair {
    signing: SigningKey,
    exchange: StaticSecret,
}

impl Keypair {
    pub fn from_name(name: &str) -> Self {
        Self {
            signing: SigningKey::from_bytes(&derive(b"sign", name.as_bytes())),
            exchange: StaticSecret::from(derive(b"exchange", name.as_bytes())),
        }
    }

    /// The ed25519 public key, which doubles as the node's identity.
    pub fn public_key(&self) -> [u8; KEY_LEN] {
        self.signing.verifying_key().to_bytes()
    }

    fn hello(&self) -> [u8; HELLO_LEN] {
        let mut hello = [0u8; HELLO_LEN];
        hello[..KEY_LEN].copy_from_slice(&self.public_key());
        hello[KEY_LEN..].copy_from_slice(PublicKey::from(&self.exchange).as_bytes());
        hello
    }

    /// Derives a session from the remote side's hello message.
    pub fn session(
        &self,
        remote_hello: &[u8; HELLO_LEN],
        side: ConnectionSide,
    ) -> io::Result<TestSession> {
        let mut remote_key = [0u8; KEY_LEN];
        remote_key.copy_from_slice(&remote_hello[..KEY_LEN]);
        let verifying = VerifyingKey::from_bytes(&remote_key)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut remote_exchange = [0u8; KEY_LEN];
        remote_exchange.copy_from_slice(&remote_hello[KEY_LEN..]);
        let shared = self
            .exchange
            .diffie_hellman(&PublicKey::from(remote_exchange));

        let i2r = derive(b"initiator->responder", shared.as_bytes());
        let r2i = derive(b"responder->initiator", shared.as_bytes());
        let (tx, rx) = match side {
            ConnectionSide::Initiator => (i2r, r2i),
            ConnectionSide::Responder => (r2i, i2r),
        };

        Ok(TestSession {
            remote_key,
            verifying,
            signing: self.signing.clone(),
            tx: ChaCha20Poly1305::new(Key::from_slice(&tx)),
            rx: ChaCha20Poly1305::new(Key::from_slice(&rx)),
            nonce: AtomicU64::new(0),
        })
    }
}

/// An ed25519-signed, ChaCha20-Poly1305-encrypted session.
///
/// Every digest starts with its nonce, so they can be decrypted in any order.
pub struct TestSession {
    remote_key: [u8; KEY_LEN],
    verifying: VerifyingKey,
    signing: SigningKey,
    tx: ChaCha20Poly1305,
    rx: ChaCha20Poly1305,
    nonce: AtomicU64,
}

impl Session for TestSession {
    fn remote_public_key(&self) -> &[u8] {
        &self.remote_key
    }

    fn encrypt(&self, dst: &mut BytesMut, plaintext: &[u8]) -> Result<(), SessionError> {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[4..].copy_from_slice(&self.nonce.fetch_add(1, Relaxed).to_be_bytes());

        let ciphertext = self
            .tx
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| SessionError::new(e.to_string()))?;
        dst.extend_from_slice(&nonce);
        dst.extend_from_slice(&ciphertext);

        Ok(())
    }

    fn decrypt(&self, dst: &mut BytesMut, digest: &[u8]) -> Result<(), SessionError> {
        if digest.len() < NONCE_LEN {
            return Err(SessionError::new("the digest is too short"));
        }
        let (nonce, ciphertext) = digest.split_at(NONCE_LEN);

        let plaintext = self
            .rx
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| SessionError::new(e.to_string()))?;
        dst.extend_from_slice(&plaintext);

        Ok(())
    }

    fn sign(&self, digest: &[u8]) -> Bytes {
        Bytes::copy_from_slice(&self.signing.sign(digest).to_bytes())
    }

    fn verify(&self, digest: &[u8], signature: &[u8]) -> bool {
        Signature::from_slice(signature)
            .map(|sig| self.verifying.verify(digest, &sig).is_ok())
            .unwrap_or(false)
    }
}

/// Exchanges the static public keys in the clear; good enough for tests.
pub struct TestHandshake(pub Keypair);

impl TestHandshake {
    pub fn new(name: &str) -> Self {
        Self(Keypair::from_name(name))
    }
}

#[async_trait::async_trait]
impl Handshake for TestHandshake {
    async fn perform_handshake(
        &self,
        _addr: SocketAddr,
        stream: TcpStream,
        side: ConnectionSide,
    ) -> io::Result<Established> {
        let (session, stream) = hello(&self.0, stream, side).await?;
        Ok(Established::new(session, stream))
    }
}

/// Performs the test handshake over a raw stream, e.g. for a hand-driven remote end.
pub async fn hello(
    keypair: &Keypair,
    mut stream: TcpStream,
    side: ConnectionSide,
) -> io::Result<(TestSession, TcpStream)> {
    stream.write_all(&keypair.hello()).await?;
    let mut remote_hello = [0u8; HELLO_LEN];
    stream.read_exact(&mut remote_hello).await?;

    Ok((keypair.session(&remote_hello, side)?, stream))
}

/// Encodes a signed, encrypted frame the way a well-behaved peer would.
pub fn frame(session: &TestSession, message: &[u8]) -> BytesMut {
    let mut digest = BytesMut::new();
    session.encrypt(&mut digest, message).unwrap();
    let signature = session.sign(&digest);

    let mut frame = BytesMut::new();
    packet::encode_frame(&signature, &digest, &mut frame).unwrap();
    frame
}

pub fn test_config(name: &str) -> Config {
    Config {
        name: Some(name.into()),
        ..Default::default()
    }
}

/// Waits for the next signal, failing the test if it takes too long.
pub async fn next_signal(signals: &mut mpsc::Receiver<Signal>) -> Signal {
    timeout(Duration::from_secs(3), signals.recv())
        .await
        .expect("timed out waiting for a signal")
        .expect("the signal channel was closed")
}

#[macro_export]
macro_rules! test_node {
    ($name: expr) => {
        $crate::common::test_node_with_config($crate::common::test_config($name))
    };
    ($name: expr, $config: expr) => {
        $crate::common::test_node_with_config(peerwire::Config {
            name: Some($name.into()),
            ..$config
        })
    };
}

pub fn test_node_with_config(config: Config) -> Node {
    let name = config.name.clone().unwrap_or_default();
    Node::new(config, TestHandshake::new(&name))
}

/// Connects to the node by hand, without a node on this side; returns the session, the stream and
/// the address the node sees the connection as coming from.
pub async fn raw_peer(node: &Node, name: &str) -> (TestSession, TcpStream, SocketAddr) {
    let target = node.listening_addr().unwrap();
    let stream = TcpStream::connect(target).await.unwrap();
    let addr = stream.local_addr().unwrap();
    let (session, stream) = hello(&Keypair::from_name(name), stream, ConnectionSide::Initiator)
        .await
        .unwrap();

    (session, stream, addr)
}
