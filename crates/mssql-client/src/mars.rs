//! MARS (Multiple Active Result Sets) session multiplexing.
//!
//! When PRELOGIN negotiates MARS, the physical connection stops carrying a
//! single TDS stream and instead carries several, interleaved frame by
//! frame behind a 16-byte SMP header (see [`tds_protocol::smp`]). This
//! module owns that demultiplexing: [`SmpBridge`] runs the background pump
//! that reads physical frames and routes them to the right logical session,
//! and [`SessionFactory`] hands out [`MarsSession`] handles that read and
//! write like an ordinary connection while the bridge does the routing.
//!
//! This mirrors the split-I/O shape of [`mssql_codec::connection::Connection`]:
//! a single mutex-guarded writer shared by every session, and a reader that
//! runs on its own task so no session can starve another while blocked on
//! a read.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tds_protocol::smp::{SmpFlags, SmpHeader, SMP_HEADER_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::{Error, Result};

/// Receive window advertised for every session this driver opens.
///
/// MARS flow control is frame-counted rather than byte-counted; a window of
/// a few frames is enough since the driver processes sessions as fast as
/// they arrive rather than batching.
const SESSION_WINDOW: u32 = 4;

/// One pending or established logical session tracked by the bridge.
enum SessionSlot {
    /// Waiting for the server's SYN+ACK to complete the handshake.
    Pending(oneshot::Sender<()>),
    /// Established; inbound DATA frame payloads are forwarded here.
    Open(mpsc::UnboundedSender<Bytes>),
}

struct BridgeState {
    sessions: HashMap<u16, SessionSlot>,
    next_sequence: HashMap<u16, u32>,
}

impl BridgeState {
    fn next_sequence(&mut self, session_id: u16) -> u32 {
        let seq = self.next_sequence.entry(session_id).or_insert(0);
        let current = *seq;
        *seq = seq.wrapping_add(1);
        current
    }
}

/// Owns the physical connection and multiplexes it into logical MARS
/// sessions.
///
/// Cloning an `SmpBridge` is cheap; every clone shares the same writer and
/// session registry, matching the way [`crate::cancel::CancelHandle`]
/// shares a single underlying handle across tasks.
#[derive(Clone)]
pub struct SmpBridge {
    writer: Arc<Mutex<Box<dyn AsyncWrite + Unpin + Send>>>,
    state: Arc<Mutex<BridgeState>>,
}

impl SmpBridge {
    /// Split `transport` and spawn the background pump task.
    ///
    /// Session 0 (the session the driver logged in on) is pre-registered
    /// as open so callers can immediately construct its [`MarsSession`]
    /// without a handshake.
    pub fn spawn<T>(transport: T) -> (Self, MarsSession)
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, write_half): (ReadHalf<T>, WriteHalf<T>) = tokio::io::split(transport);

        let (tx0, rx0) = mpsc::unbounded_channel();
        let mut sessions = HashMap::new();
        sessions.insert(0, SessionSlot::Open(tx0));

        let state = Arc::new(Mutex::new(BridgeState {
            sessions,
            next_sequence: HashMap::new(),
        }));
        let writer: Arc<Mutex<Box<dyn AsyncWrite + Unpin + Send>>> =
            Arc::new(Mutex::new(Box::new(write_half)));

        let bridge = Self {
            writer: Arc::clone(&writer),
            state: Arc::clone(&state),
        };

        tokio::spawn(Self::pump(read_half, state));

        let session0 = MarsSession {
            session_id: 0,
            bridge: bridge.clone(),
            inbox: rx0,
        };

        (bridge, session0)
    }

    /// Open a new logical session, performing the SMP SYN/SYN-ACK
    /// handshake and returning a handle once the server has acknowledged it.
    pub async fn open_session(&self, session_id: u16) -> Result<MarsSession> {
        let (ready_tx, ready_rx) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            if state.sessions.contains_key(&session_id) {
                return Err(Error::Protocol(format!(
                    "MARS session {session_id} already in use"
                )));
            }
            state.sessions.insert(session_id, SessionSlot::Pending(ready_tx));
        }

        self.send_frame(SmpHeader::syn(session_id, SESSION_WINDOW), Bytes::new())
            .await?;

        ready_rx
            .await
            .map_err(|_| Error::Protocol("MARS session handshake channel closed".into()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock().await;
            state.sessions.insert(session_id, SessionSlot::Open(tx));
        }

        Ok(MarsSession {
            session_id,
            bridge: self.clone(),
            inbox: rx,
        })
    }

    /// Close a logical session with a FIN frame and drop its registry entry.
    pub async fn close_session(&self, session_id: u16) -> Result<()> {
        let sequence = {
            let mut state = self.state.lock().await;
            state.sessions.remove(&session_id);
            state.next_sequence(session_id)
        };
        self.send_frame(
            SmpHeader::fin(session_id, sequence, SESSION_WINDOW),
            Bytes::new(),
        )
        .await
    }

    /// Send a TDS message payload as one DATA frame on `session_id`.
    ///
    /// The caller (`MarsSession`) is responsible for any TDS-level packet
    /// chunking; the SMP layer treats the payload as an opaque blob.
    async fn send_data(&self, session_id: u16, payload: Bytes) -> Result<()> {
        let sequence = {
            let mut state = self.state.lock().await;
            state.next_sequence(session_id)
        };
        let header = SmpHeader::data(session_id, sequence, SESSION_WINDOW, payload.len() as u32);
        self.send_frame(header, payload).await
    }

    async fn send_frame(&self, header: SmpHeader, payload: Bytes) -> Result<()> {
        let mut buf = BytesMut::with_capacity(SMP_HEADER_SIZE + payload.len());
        header.encode(&mut buf);
        buf.extend_from_slice(&payload);

        let mut writer = self.writer.lock().await;
        writer.write_all(&buf).await.map_err(Error::from)?;
        writer.flush().await.map_err(Error::from)
    }

    /// Background task: read SMP frames off the physical connection and
    /// route each to its session's slot.
    async fn pump<T>(mut read_half: ReadHalf<T>, state: Arc<Mutex<BridgeState>>)
    where
        T: AsyncRead + Unpin + Send + 'static,
    {
        let mut header_buf = [0u8; SMP_HEADER_SIZE];

        loop {
            if read_half.read_exact(&mut header_buf).await.is_err() {
                tracing::debug!("MARS physical connection closed, stopping SMP pump");
                return;
            }

            let mut cursor = &header_buf[..];
            let header = match SmpHeader::decode(&mut cursor) {
                Ok(h) => h,
                Err(e) => {
                    tracing::warn!(error = %e, "malformed SMP header, stopping SMP pump");
                    return;
                }
            };

            let payload_len = header.payload_length();
            let mut payload = BytesMut::zeroed(payload_len);
            if payload_len > 0 && read_half.read_exact(&mut payload).await.is_err() {
                tracing::debug!("MARS physical connection closed mid-frame, stopping SMP pump");
                return;
            }

            Self::dispatch(&state, header, payload.freeze()).await;
        }
    }

    async fn dispatch(state: &Arc<Mutex<BridgeState>>, header: SmpHeader, payload: Bytes) {
        let mut state = state.lock().await;
        let Some(slot) = state.sessions.get_mut(&header.session_id) else {
            tracing::warn!(session_id = header.session_id, "SMP frame for unknown session, dropping");
            return;
        };

        if header.flags.contains(SmpFlags::ACK) && header.flags.contains(SmpFlags::SYN) {
            let pending = std::mem::replace(slot, SessionSlot::Pending(oneshot::channel().0));
            if let SessionSlot::Pending(ready_tx) = pending {
                let _ = ready_tx.send(());
            }
            return;
        }

        if header.flags.contains(SmpFlags::FIN) {
            state.sessions.remove(&header.session_id);
            return;
        }

        if header.flags.contains(SmpFlags::DATA) {
            if let SessionSlot::Open(tx) = slot {
                let _ = tx.send(payload);
            }
        }
    }
}

/// A single logical session multiplexed over a MARS-enabled physical
/// connection.
///
/// `MarsSession` exposes the same request/response shape that
/// `mssql_codec::connection::Connection` exposes for a non-MARS connection,
/// so a future `ConnectionHandle::Mars` variant can hold one directly.
pub struct MarsSession {
    session_id: u16,
    bridge: SmpBridge,
    inbox: mpsc::UnboundedReceiver<Bytes>,
}

impl MarsSession {
    /// The logical session identifier this handle addresses.
    #[must_use]
    pub fn session_id(&self) -> u16 {
        self.session_id
    }

    /// Send a complete TDS message (already packetized by the caller) on
    /// this session.
    pub async fn send_message(&self, payload: Bytes) -> Result<()> {
        self.bridge.send_data(self.session_id, payload).await
    }

    /// Receive the next demultiplexed TDS payload addressed to this
    /// session, or `None` if the session has been closed.
    pub async fn recv_message(&mut self) -> Option<Bytes> {
        self.inbox.recv().await
    }

    /// Close this logical session.
    pub async fn close(&self) -> Result<()> {
        self.bridge.close_session(self.session_id).await
    }
}

impl std::fmt::Debug for MarsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarsSession")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// Issues new logical sessions over a MARS-enabled physical connection.
///
/// A `SessionFactory` is constructed once login has completed and both
/// sides have confirmed MARS support; `Client` holds it alongside its
/// primary `ConnectionHandle` and uses it to open extra sessions for
/// concurrent result sets.
#[derive(Clone)]
pub struct SessionFactory {
    bridge: SmpBridge,
    next_session_id: Arc<std::sync::atomic::AtomicU16>,
}

impl SessionFactory {
    /// Take ownership of `transport` and start multiplexing it.
    ///
    /// Returns the factory together with the session handle for session 0,
    /// the session the login sequence already ran on.
    pub fn new<T>(transport: T) -> (Self, MarsSession)
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (bridge, session0) = SmpBridge::spawn(transport);
        (
            Self {
                bridge,
                next_session_id: Arc::new(std::sync::atomic::AtomicU16::new(1)),
            },
            session0,
        )
    }

    /// Open a new logical session for an additional concurrent result set.
    pub async fn open_session(&self) -> Result<MarsSession> {
        let id = self
            .next_session_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.bridge.open_session(id).await
    }
}

impl std::fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactory").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_state_sequence_increments_per_session() {
        let mut state = BridgeState {
            sessions: HashMap::new(),
            next_sequence: HashMap::new(),
        };
        assert_eq!(state.next_sequence(1), 0);
        assert_eq!(state.next_sequence(1), 1);
        assert_eq!(state.next_sequence(2), 0);
        assert_eq!(state.next_sequence(1), 2);
    }

    #[tokio::test]
    async fn test_session0_is_open_without_handshake() {
        let (client_io, _server_io) = tokio::io::duplex(4096);
        let (_factory, mut session0) = SessionFactory::new(client_io);
        assert_eq!(session0.session_id(), 0);
        // No data has arrived yet; recv should simply park rather than error.
        assert!(tokio::time::timeout(std::time::Duration::from_millis(20), session0.recv_message())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_open_session_completes_on_syn_ack() {
        let (client_io, mut server_io) = tokio::io::duplex(4096);
        let (factory, _session0) = SessionFactory::new(client_io);

        let server_task = tokio::spawn(async move {
            // Read the client's SYN.
            let mut header_buf = [0u8; SMP_HEADER_SIZE];
            server_io.read_exact(&mut header_buf).await.unwrap();
            let mut cursor = &header_buf[..];
            let syn = SmpHeader::decode(&mut cursor).unwrap();
            assert!(syn.flags.contains(SmpFlags::SYN));

            // Reply with SYN+ACK on the same session.
            let ack = SmpHeader {
                flags: SmpFlags::SYN | SmpFlags::ACK,
                session_id: syn.session_id,
                length: SMP_HEADER_SIZE as u32,
                sequence_number: 0,
                window: SESSION_WINDOW,
            };
            let bytes = ack.encode_to_bytes();
            server_io.write_all(&bytes).await.unwrap();
        });

        let session = tokio::time::timeout(std::time::Duration::from_millis(500), factory.open_session())
            .await
            .expect("handshake should complete")
            .unwrap();
        assert_eq!(session.session_id(), 1);

        server_task.await.unwrap();
    }
}
