//! Signed challenge/response identity handshake
//!
//! Used over byte streams whose carrier cannot vouch for the remote end,
//! such as relay circuits. Each side sends its public key and a random
//! nonce, then signs the other side's nonce. The verified identity is
//! derived from the key that produced a valid signature.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::codec::{read_frame, write_frame};
use crate::error::TransportError;
use crate::identity::{Keypair, PeerId, verify_signature};
use crate::transport::{BoxedIo, SecureUpgrade};

const DOMAIN: &[u8] = b"indras-handshake-v1";

/// Default bound on one handshake exchange
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize, Deserialize)]
enum HandshakeMessage {
    Hello { public_key: Vec<u8>, nonce: [u8; 32] },
    Proof { signature: Vec<u8> },
}

/// [`SecureUpgrade`] backed by an ed25519 keypair
#[derive(Debug, Clone)]
pub struct SignedHandshake {
    keypair: Keypair,
    timeout: Duration,
}

impl SignedHandshake {
    pub fn new(keypair: Keypair) -> Self {
        Self {
            keypair,
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn local_peer(&self) -> PeerId {
        self.keypair.peer_id()
    }

    async fn exchange(&self, io: &mut BoxedIo) -> Result<PeerId, TransportError> {
        let own_key = self.keypair.public().to_bytes().to_vec();
        let own_nonce: [u8; 32] = rand::random();

        write_frame(
            io,
            &HandshakeMessage::Hello {
                public_key: own_key.clone(),
                nonce: own_nonce,
            },
        )
        .await?;

        let (remote_key, remote_nonce) = match read_frame(io).await? {
            HandshakeMessage::Hello { public_key, nonce } => (public_key, nonce),
            HandshakeMessage::Proof { .. } => {
                return Err(TransportError::HandshakeFailed(
                    "expected hello, got proof".into(),
                ));
            }
        };

        let signature = self
            .keypair
            .sign(&transcript(&remote_nonce, &own_key));
        write_frame(io, &HandshakeMessage::Proof { signature }).await?;

        let signature = match read_frame(io).await? {
            HandshakeMessage::Proof { signature } => signature,
            HandshakeMessage::Hello { .. } => {
                return Err(TransportError::HandshakeFailed(
                    "expected proof, got hello".into(),
                ));
            }
        };

        verify_signature(&remote_key, &transcript(&own_nonce, &remote_key), &signature)
            .map_err(|e| TransportError::HandshakeFailed(e.to_string()))
    }

    async fn run(&self, mut io: BoxedIo) -> Result<(BoxedIo, PeerId), TransportError> {
        let verified = tokio::time::timeout(self.timeout, self.exchange(&mut io))
            .await
            .map_err(|_| TransportError::Timeout)??;
        Ok((io, verified))
    }
}

fn transcript(nonce: &[u8; 32], signer_key: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(DOMAIN.len() + nonce.len() + signer_key.len());
    msg.extend_from_slice(DOMAIN);
    msg.extend_from_slice(nonce);
    msg.extend_from_slice(signer_key);
    msg
}

#[async_trait]
impl SecureUpgrade for SignedHandshake {
    async fn upgrade_outbound(
        &self,
        io: BoxedIo,
        expected: PeerId,
    ) -> Result<(BoxedIo, PeerId), TransportError> {
        let (io, verified) = self.run(io).await?;
        if verified != expected {
            warn!(
                expected = %expected.short_id(),
                actual = %verified.short_id(),
                "Handshake verified an unexpected identity"
            );
            return Err(TransportError::IdentityMismatch {
                expected,
                actual: verified,
            });
        }
        debug!(peer = %verified.short_id(), "Outbound handshake complete");
        Ok((io, verified))
    }

    async fn upgrade_inbound(&self, io: BoxedIo) -> Result<(BoxedIo, PeerId), TransportError> {
        let (io, verified) = self.run(io).await?;
        debug!(peer = %verified.short_id(), "Inbound handshake complete");
        Ok((io, verified))
    }
}
