//! Signaling channel
//!
//! Small coordination messages between two peers that cannot reach each
//! other directly yet, carried on a stream over a control circuit. Every
//! message travels in a [`SignalEnvelope`] naming sender and target.
//! Requests carry a correlation id and the matching reply names it in
//! `reply_to`, so callers get request/response with a timeout instead of
//! sharing state across the relay.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use indras_core::codec::{read_frame, write_frame};
use indras_core::{AsyncIo, PeerId};

use crate::error::SignalingError;

/// Default deadline for a signaling request's reply
pub const DEFAULT_SIGNALING_TIMEOUT: Duration = Duration::from_secs(5);

const INCOMING_BACKLOG: usize = 32;

/// One signaling message on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub id: u64,
    /// Correlation id of the request this answers
    pub reply_to: Option<u64>,
    pub from: PeerId,
    pub to: PeerId,
    /// Opaque to the channel
    pub payload: Vec<u8>,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Vec<u8>>>>>;

/// Request/response messaging with one remote peer
pub struct SignalingChannel {
    local: PeerId,
    remote: PeerId,
    timeout: Duration,
    next_id: AtomicU64,
    pending: Pending,
    outbound: mpsc::UnboundedSender<SignalEnvelope>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<SignalEnvelope>>,
    closed: CancellationToken,
}

impl SignalingChannel {
    /// Run a channel over `io`. Must be called within a tokio runtime.
    pub fn new<T: AsyncIo>(io: T, local: PeerId, remote: PeerId) -> Self {
        let (reader, writer) = tokio::io::split(io);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming) = mpsc::channel(INCOMING_BACKLOG);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();

        tokio::spawn(write_loop(writer, outbound_rx, closed.clone()));
        tokio::spawn(read_loop(
            reader,
            local,
            remote,
            pending.clone(),
            incoming_tx,
            closed.clone(),
        ));

        Self {
            local,
            remote,
            timeout: DEFAULT_SIGNALING_TIMEOUT,
            next_id: AtomicU64::new(1),
            pending,
            outbound,
            incoming: tokio::sync::Mutex::new(incoming),
            closed,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    fn envelope(&self, reply_to: Option<u64>, payload: Vec<u8>) -> SignalEnvelope {
        SignalEnvelope {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            reply_to,
            from: self.local,
            to: self.remote,
            payload,
        }
    }

    fn push(&self, envelope: SignalEnvelope) -> Result<u64, SignalingError> {
        if self.is_closed() {
            return Err(SignalingError::Closed);
        }
        let id = envelope.id;
        self.outbound
            .send(envelope)
            .map_err(|_| SignalingError::Closed)?;
        Ok(id)
    }

    /// Send a message that expects no reply. Returns its id.
    pub fn send<M: Serialize>(&self, msg: &M) -> Result<u64, SignalingError> {
        let payload = encode(msg)?;
        self.push(self.envelope(None, payload))
    }

    /// Answer the message with id `to`
    pub fn reply<M: Serialize>(&self, to: u64, msg: &M) -> Result<(), SignalingError> {
        let payload = encode(msg)?;
        self.push(self.envelope(Some(to), payload)).map(|_| ())
    }

    /// Send a request and wait for the correlated reply
    pub async fn request<Req, Resp>(&self, msg: &Req) -> Result<Resp, SignalingError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = encode(msg)?;
        let envelope = self.envelope(None, payload);
        let id = envelope.id;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if let Err(e) = self.push(envelope) {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        let reply = tokio::select! {
            biased;
            reply = tokio::time::timeout(self.timeout, rx) => match reply {
                Ok(Ok(payload)) => Ok(payload),
                Ok(Err(_)) => Err(SignalingError::Closed),
                Err(_) => Err(SignalingError::Timeout),
            },
            _ = self.closed.cancelled() => Err(SignalingError::Closed),
        };
        if reply.is_err() {
            self.pending.lock().remove(&id);
        }
        decode(&reply?)
    }

    /// Next message that is not a reply to one of our requests
    ///
    /// Returns the message id alongside the decoded payload so the caller
    /// can [`reply`](Self::reply) to it.
    pub async fn recv<M: DeserializeOwned>(&self) -> Result<(u64, M), SignalingError> {
        let mut incoming = self.incoming.lock().await;
        let envelope = tokio::select! {
            biased;
            envelope = incoming.recv() => envelope.ok_or(SignalingError::Closed)?,
            _ = self.closed.cancelled() => return Err(SignalingError::Closed),
        };
        Ok((envelope.id, decode(&envelope.payload)?))
    }

    /// Like [`recv`](Self::recv) but gives up after the channel timeout
    pub async fn recv_timeout<M: DeserializeOwned>(&self) -> Result<(u64, M), SignalingError> {
        tokio::time::timeout(self.timeout, self.recv())
            .await
            .map_err(|_| SignalingError::Timeout)?
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

impl std::fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn encode<M: Serialize>(msg: &M) -> Result<Vec<u8>, SignalingError> {
    postcard::to_allocvec(msg).map_err(|e| SignalingError::Codec(e.to_string()))
}

fn decode<M: DeserializeOwned>(payload: &[u8]) -> Result<M, SignalingError> {
    postcard::from_bytes(payload).map_err(|e| SignalingError::Codec(e.to_string()))
}

async fn write_loop<T: AsyncIo>(
    mut writer: WriteHalf<T>,
    mut outbound: mpsc::UnboundedReceiver<SignalEnvelope>,
    closed: CancellationToken,
) {
    loop {
        // Queued messages go out before a close is noticed
        let envelope = tokio::select! {
            biased;
            envelope = outbound.recv() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
            _ = closed.cancelled() => break,
        };
        if let Err(e) = write_frame(&mut writer, &envelope).await {
            debug!(error = %e, "Signaling write failed");
            break;
        }
    }
    closed.cancel();
    let _ = tokio::io::AsyncWriteExt::shutdown(&mut writer).await;
}

async fn read_loop<T: AsyncIo>(
    mut reader: ReadHalf<T>,
    local: PeerId,
    remote: PeerId,
    pending: Pending,
    incoming: mpsc::Sender<SignalEnvelope>,
    closed: CancellationToken,
) {
    loop {
        let envelope: SignalEnvelope = tokio::select! {
            _ = closed.cancelled() => break,
            frame = read_frame(&mut reader) => match frame {
                Ok(envelope) => envelope,
                Err(e) => {
                    trace!(error = %e, "Signaling channel ended");
                    break;
                }
            },
        };

        if envelope.from != remote || envelope.to != local {
            warn!(
                from = %envelope.from.short_id(),
                to = %envelope.to.short_id(),
                "Dropping misaddressed signaling message"
            );
            continue;
        }

        match envelope.reply_to {
            Some(id) => {
                let waiter = pending.lock().remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(envelope.payload);
                    }
                    None => trace!(id, "Late signaling reply dropped"),
                }
            }
            None => {
                tokio::select! {
                    sent = incoming.send(envelope) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                    _ = closed.cancelled() => break,
                }
            }
        }
    }
    closed.cancel();
    pending.lock().clear();
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    enum Msg {
        Ping(u32),
        Pong(u32),
    }

    fn peer(b: u8) -> PeerId {
        PeerId::from_bytes([b; 32])
    }

    fn pair() -> (SignalingChannel, SignalingChannel) {
        let (a, b) = tokio::io::duplex(4096);
        (
            SignalingChannel::new(a, peer(1), peer(2)),
            SignalingChannel::new(b, peer(2), peer(1)),
        )
    }

    #[tokio::test]
    async fn test_request_reply_correlation() {
        let (a, b) = pair();

        let responder = tokio::spawn(async move {
            for _ in 0..2 {
                let (id, msg): (u64, Msg) = b.recv().await.unwrap();
                let Msg::Ping(n) = msg else { panic!("expected ping") };
                b.reply(id, &Msg::Pong(n * 10)).unwrap();
            }
            b
        });

        let (r1, r2) = tokio::join!(
            a.request::<_, Msg>(&Msg::Ping(1)),
            a.request::<_, Msg>(&Msg::Ping(2)),
        );
        assert_eq!(r1.unwrap(), Msg::Pong(10));
        assert_eq!(r2.unwrap(), Msg::Pong(20));
        let _b = responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let (a, _b) = pair();
        let a = a.with_timeout(Duration::from_millis(50));
        assert_eq!(
            a.request::<_, Msg>(&Msg::Ping(1)).await.unwrap_err(),
            SignalingError::Timeout
        );
    }

    #[tokio::test]
    async fn test_remote_drop_closes_channel() {
        let (a, b) = pair();
        drop(b);
        assert_eq!(
            a.request::<_, Msg>(&Msg::Ping(1)).await.unwrap_err(),
            SignalingError::Closed
        );
        assert!(a.is_closed());
    }

    #[tokio::test]
    async fn test_queued_messages_flush_before_close() {
        let (a, b) = pair();
        a.send(&Msg::Ping(7)).unwrap();
        a.close();
        let (_, msg): (u64, Msg) = b.recv().await.unwrap();
        assert_eq!(msg, Msg::Ping(7));
    }

    #[tokio::test]
    async fn test_misaddressed_messages_are_dropped() {
        let (raw, b_io) = tokio::io::duplex(4096);
        let b = SignalingChannel::new(b_io, peer(2), peer(1));
        let (_r, mut w) = tokio::io::split(raw);

        let forged = SignalEnvelope {
            id: 1,
            reply_to: None,
            from: peer(3),
            to: peer(2),
            payload: postcard::to_allocvec(&Msg::Ping(0)).unwrap(),
        };
        write_frame(&mut w, &forged).await.unwrap();
        let genuine = SignalEnvelope {
            id: 2,
            from: peer(1),
            ..forged
        };
        write_frame(&mut w, &genuine).await.unwrap();

        let (id, _msg): (u64, Msg) = b.recv().await.unwrap();
        assert_eq!(id, 2);
    }
}
