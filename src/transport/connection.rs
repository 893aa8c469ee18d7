//! Peer Connection
//!
//! Presents one socket as a framed, bidirectional message channel and
//! owns that socket's lifecycle. A read task decodes frames and hands
//! each message to the registered [`MessageHandler`]; writes go through a
//! per-connection lock so frames never interleave.

use crate::domain::ports::{MessageEndpoint, MessageHandler};
use crate::domain::value_objects::{CloseReason, ConnectionId, ConnectionState, PeerRole};
use crate::error::TransportError;
use crate::transport::codec::{encode_frame, Frame, FrameDecoder, FrameKind};
use crate::transport::config::TransportConfig;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

/// Messages held for a connection that has no handler yet.
pub const MAX_PENDING_MESSAGES: usize = 1024;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Inbound delivery state, guarded as one unit so a close can never
/// race a delivery. The lock is reentrant so a handler may swap itself
/// out from inside a callback; no `RefCell` borrow is held while a
/// callback runs.
struct Inbound {
    handler: Option<Arc<dyn MessageHandler>>,
    pending: VecDeque<Bytes>,
    closed: bool,
}

/// One live transport connection.
pub struct PeerConnection {
    id: ConnectionId,
    role: PeerRole,
    peer_addr: Option<SocketAddr>,
    max_frame_size: usize,
    read_buffer_size: usize,
    close_flush_timeout: Duration,
    state_tx: watch::Sender<ConnectionState>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    inbound: ReentrantMutex<RefCell<Inbound>>,
    close_reason: parking_lot::Mutex<Option<CloseReason>>,
    last_error: parking_lot::Mutex<Option<String>>,
}

impl PeerConnection {
    /// Wrap an accepted TCP socket and start reading from it.
    pub fn open(stream: TcpStream, config: &TransportConfig) -> Arc<Self> {
        let peer_addr = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("failed to set TCP_NODELAY: {:?}", e);
        }
        Self::open_io(stream, peer_addr, PeerRole::Passive, config)
    }

    /// Wrap any byte stream and start reading from it.
    pub fn open_io<S>(
        io: S,
        peer_addr: Option<SocketAddr>,
        role: PeerRole,
        config: &TransportConfig,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn = Self::connecting(role, peer_addr, config);
        conn.attach(io);
        conn
    }

    /// Create a connection that has no socket yet.
    pub(crate) fn connecting(
        role: PeerRole,
        peer_addr: Option<SocketAddr>,
        config: &TransportConfig,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        Arc::new(Self {
            id: ConnectionId::new(),
            role,
            peer_addr,
            max_frame_size: config.max_frame_size,
            read_buffer_size: config.read_buffer_size,
            close_flush_timeout: config.close_flush_timeout,
            state_tx,
            writer: tokio::sync::Mutex::new(None),
            inbound: ReentrantMutex::new(RefCell::new(Inbound {
                handler: None,
                pending: VecDeque::new(),
                closed: false,
            })),
            close_reason: parking_lot::Mutex::new(None),
            last_error: parking_lot::Mutex::new(None),
        })
    }

    /// Attach the socket, move to `Open` and spawn the read task.
    pub(crate) fn attach<S>(self: &Arc<Self>, io: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        match self.writer.try_lock() {
            Ok(mut guard) => {
                let writer: BoxedWriter = Box::new(writer);
                *guard = Some(writer);
            }
            Err(_) => {
                tracing::error!("connection {} attached twice", self.id);
                return;
            }
        }

        let opened = self.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Open;
                true
            } else {
                false
            }
        });
        if !opened {
            tracing::debug!("connection {} closed before it opened", self.id);
            return;
        }

        tracing::debug!(
            "connection {} open ({}, peer {:?})",
            self.id,
            self.role,
            self.peer_addr
        );

        let decoder = FrameDecoder::with_capacity(self.max_frame_size, self.read_buffer_size);
        let conn = self.clone();
        tokio::spawn(async move {
            conn.read_pump(reader, decoder).await;
        });
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Reason the connection closed, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().clone()
    }

    /// Last transport error seen on this connection.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Resolve once the connection reaches `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|state| *state == ConnectionState::Closed).await;
    }

    /// Register the consumer of inbound messages.
    ///
    /// Messages that arrived before registration are delivered first, in
    /// order. May be called from inside a handler callback.
    pub fn set_handler(&self, handler: Arc<dyn MessageHandler>) -> Result<(), TransportError> {
        let inbound = self.inbound.lock();
        {
            let mut state = inbound.borrow_mut();
            if state.closed {
                return Err(TransportError::ConnectionClosed);
            }
            state.handler = Some(handler);
        }

        // A callback may clear the handler; the rest stays queued.
        loop {
            let next = {
                let mut state = inbound.borrow_mut();
                match state.handler.clone() {
                    Some(handler) => state.pending.pop_front().map(|m| (handler, m)),
                    None => None,
                }
            };
            match next {
                Some((handler, message)) => handler.on_receive(message),
                None => break,
            }
        }
        Ok(())
    }

    /// Detach the current consumer without closing the connection.
    ///
    /// Messages arriving afterwards are queued for the next handler.
    pub fn clear_handler(&self) -> Option<Arc<dyn MessageHandler>> {
        let inbound = self.inbound.lock();
        let handler = inbound.borrow_mut().handler.take();
        handler
    }

    /// Encode and write one message.
    ///
    /// A close cancels a write blocked on a peer that stopped reading; the
    /// half-written frame is abandoned together with the socket.
    pub async fn send(&self, message: Bytes) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        let frame = encode_frame(&Frame::data(message), self.max_frame_size)?;
        let mut state_rx = self.state_tx.subscribe();

        let mut guard = self.writer.lock().await;
        let outcome = match guard.as_mut() {
            Some(writer) => tokio::select! {
                result = write_frame(writer, &frame) => Some(result),
                _ = wait_closing(&mut state_rx) => None,
            },
            None => return Err(TransportError::ConnectionClosed),
        };
        let result = match outcome {
            Some(result) => result,
            None => {
                tracing::debug!("close interrupted a write on connection {}", self.id);
                guard.take();
                return Err(TransportError::ConnectionClosed);
            }
        };
        drop(guard);

        if let Err(e) = result {
            tracing::warn!("write failed on connection {}: {:?}", self.id, e);
            self.close(CloseReason::TransportError(e.to_string())).await;
            return Err(TransportError::Io(e));
        }
        Ok(())
    }

    /// Close the connection.
    ///
    /// Only the first call does anything: it flushes pending writes (bounded
    /// by the close flush timeout), releases the socket, stops the read task
    /// and notifies the handler once.
    pub async fn close(&self, reason: CloseReason) {
        let started = self.state_tx.send_if_modified(|state| match state {
            ConnectionState::Connecting | ConnectionState::Open => {
                *state = ConnectionState::Closing;
                true
            }
            ConnectionState::Closing | ConnectionState::Closed => false,
        });
        if !started {
            return;
        }

        tracing::info!("closing connection {}: {}", self.id, reason);
        if let CloseReason::TransportError(e) = &reason {
            *self.last_error.lock() = Some(e.clone());
        }

        let notice = match reason {
            CloseReason::LocalRequested => Some(Frame::close("local requested")),
            _ => None,
        };
        if tokio::time::timeout(self.close_flush_timeout, self.release_writer(notice))
            .await
            .is_err()
        {
            tracing::warn!(
                "connection {} did not flush within {:?}",
                self.id,
                self.close_flush_timeout
            );
            if let Ok(mut guard) = self.writer.try_lock() {
                guard.take();
            }
        }

        let handler = {
            let inbound = self.inbound.lock();
            let mut state = inbound.borrow_mut();
            state.closed = true;
            state.pending.clear();
            state.handler.take()
        };

        *self.close_reason.lock() = Some(reason.clone());
        self.state_tx.send_replace(ConnectionState::Closed);

        if let Some(handler) = handler {
            handler.on_close(&reason);
        }
    }

    async fn release_writer(&self, notice: Option<Frame>) {
        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            if let Some(frame) = notice {
                if let Ok(bytes) = encode_frame(&frame, self.max_frame_size) {
                    let _ = writer.write_all(&bytes).await;
                }
            }
            let _ = writer.flush().await;
            let _ = writer.shutdown().await;
        }
    }

    /// Hand a message to the handler, or queue it. Returns false when the
    /// pending queue overflowed.
    fn deliver(&self, message: Bytes) -> bool {
        let inbound = self.inbound.lock();
        let handler = {
            let mut state = inbound.borrow_mut();
            if state.closed {
                return true;
            }
            match state.handler.clone() {
                Some(handler) => handler,
                None => {
                    if state.pending.len() >= MAX_PENDING_MESSAGES {
                        return false;
                    }
                    state.pending.push_back(message);
                    return true;
                }
            }
        };
        handler.on_receive(message);
        true
    }

    async fn read_pump<R>(self: Arc<Self>, mut reader: R, mut decoder: FrameDecoder)
    where
        R: AsyncRead + Unpin,
    {
        let mut state_rx = self.state_tx.subscribe();

        let reason = loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => match frame.kind {
                    FrameKind::Data => {
                        if !self.deliver(frame.payload) {
                            break CloseReason::TransportError(format!(
                                "more than {} messages pending without a handler",
                                MAX_PENDING_MESSAGES
                            ));
                        }
                        continue;
                    }
                    FrameKind::Close => {
                        tracing::debug!(
                            "peer closed connection {}: {}",
                            self.id,
                            frame.close_reason().unwrap_or_default()
                        );
                        break CloseReason::PeerInitiated;
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("framing error on connection {}: {}", self.id, e);
                    break CloseReason::TransportError(e.to_string());
                }
            }

            tokio::select! {
                result = reader.read_buf(decoder.buffer_mut()) => match result {
                    Ok(0) => {
                        if decoder.buffered() > 0 {
                            tracing::debug!(
                                "connection {} ended with {} bytes of a partial frame",
                                self.id,
                                decoder.buffered()
                            );
                        }
                        break CloseReason::PeerInitiated;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!("read failed on connection {}: {:?}", self.id, e);
                        break CloseReason::TransportError(e.to_string());
                    }
                },
                _ = wait_closing(&mut state_rx) => {
                    // A local close owns the rest of the sequence.
                    return;
                }
            }
        };

        drop(reader);
        self.close(reason).await;
    }
}

async fn write_frame(writer: &mut BoxedWriter, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Resolve once a close has begun.
async fn wait_closing(state_rx: &mut watch::Receiver<ConnectionState>) {
    let _ = state_rx
        .wait_for(|state| matches!(state, ConnectionState::Closing | ConnectionState::Closed))
        .await;
}

#[async_trait]
impl MessageEndpoint for PeerConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn state(&self) -> ConnectionState {
        PeerConnection::state(self)
    }

    async fn send(&self, message: Bytes) -> Result<(), TransportError> {
        PeerConnection::send(self, message).await
    }

    async fn close(&self, reason: CloseReason) {
        PeerConnection::close(self, reason).await
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::codec::encode_frame_into;
    use bytes::BytesMut;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    #[derive(Debug, PartialEq)]
    enum Seen {
        Message(Bytes),
        Closed(CloseReason),
    }

    struct RecordingHandler {
        tx: mpsc::UnboundedSender<Seen>,
    }

    impl MessageHandler for RecordingHandler {
        fn on_receive(&self, message: Bytes) {
            let _ = self.tx.send(Seen::Message(message));
        }

        fn on_close(&self, reason: &CloseReason) {
            let _ = self.tx.send(Seen::Closed(reason.clone()));
        }
    }

    fn recording_handler() -> (Arc<RecordingHandler>, mpsc::UnboundedReceiver<Seen>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(RecordingHandler { tx }), rx)
    }

    fn config() -> TransportConfig {
        TransportConfig::default()
            .max_frame_size(64 * 1024)
            .close_flush_timeout(Duration::from_millis(200))
    }

    fn pair() -> (Arc<PeerConnection>, DuplexStream) {
        let (local, remote) = tokio::io::duplex(1024 * 1024);
        let conn = PeerConnection::open_io(local, None, PeerRole::Passive, &config());
        (conn, remote)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for handler callback")
            .expect("handler channel closed")
    }

    async fn write_frames(remote: &mut DuplexStream, frames: &[Frame]) {
        let mut wire = BytesMut::new();
        for frame in frames {
            encode_frame_into(frame, 64 * 1024, &mut wire).unwrap();
        }
        remote.write_all(&wire).await.unwrap();
    }

    async fn read_frames(remote: &mut DuplexStream, count: usize) -> Vec<Frame> {
        let mut decoder = FrameDecoder::new(64 * 1024);
        let mut frames = Vec::new();
        let mut buf = [0u8; 4096];
        while frames.len() < count {
            let n = remote.read(&mut buf).await.unwrap();
            assert!(n > 0, "stream ended after {} frames", frames.len());
            frames.extend(decoder.decode(&buf[..n]).unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn test_open_connection_state() {
        let (conn, _remote) = pair();
        assert_eq!(conn.state(), ConnectionState::Open);
        assert!(conn.is_open());
        assert_eq!(conn.role(), PeerRole::Passive);
        assert!(conn.close_reason().is_none());
    }

    #[tokio::test]
    async fn test_send_writes_one_frame() {
        let (conn, mut remote) = pair();

        conn.send(Bytes::from_static(b"rev-1")).await.unwrap();

        let frames = read_frames(&mut remote, 1).await;
        assert_eq!(frames, vec![Frame::data(Bytes::from_static(b"rev-1"))]);
    }

    #[tokio::test]
    async fn test_send_rejects_oversized_message_without_closing() {
        let (conn, _remote) = pair();

        let result = conn.send(Bytes::from(vec![0u8; 64 * 1024 + 1])).await;
        assert!(matches!(result, Err(TransportError::Framing(_))));
        assert!(conn.is_open());
    }

    #[tokio::test]
    async fn test_receive_in_wire_order() {
        let (conn, mut remote) = pair();
        let (handler, mut rx) = recording_handler();
        conn.set_handler(handler).unwrap();

        let frames: Vec<Frame> = (0..20).map(|i| Frame::data(format!("msg-{}", i))).collect();
        write_frames(&mut remote, &frames).await;

        for i in 0..20 {
            assert_eq!(next(&mut rx).await, Seen::Message(Bytes::from(format!("msg-{}", i))));
        }
    }

    #[tokio::test]
    async fn test_messages_before_handler_are_queued() {
        let (conn, mut remote) = pair();
        write_frames(&mut remote, &[Frame::data("early-1"), Frame::data("early-2")]).await;

        // Let the read task queue both messages
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (handler, mut rx) = recording_handler();
        conn.set_handler(handler).unwrap();
        write_frames(&mut remote, &[Frame::data("late")]).await;

        assert_eq!(next(&mut rx).await, Seen::Message(Bytes::from("early-1")));
        assert_eq!(next(&mut rx).await, Seen::Message(Bytes::from("early-2")));
        assert_eq!(next(&mut rx).await, Seen::Message(Bytes::from("late")));
    }

    #[tokio::test]
    async fn test_double_close_notifies_once() {
        let (conn, _remote) = pair();
        let (handler, mut rx) = recording_handler();
        conn.set_handler(handler).unwrap();

        conn.close(CloseReason::LocalRequested).await;
        conn.close(CloseReason::LocalRequested).await;
        conn.close(CloseReason::PeerInitiated).await;

        assert_eq!(next(&mut rx).await, Seen::Closed(CloseReason::LocalRequested));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.close_reason(), Some(CloseReason::LocalRequested));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (conn, _remote) = pair();
        conn.close(CloseReason::LocalRequested).await;

        let result = conn.send(Bytes::from_static(b"late")).await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_set_handler_after_close_fails() {
        let (conn, _remote) = pair();
        conn.close(CloseReason::LocalRequested).await;

        let (handler, _rx) = recording_handler();
        assert!(matches!(
            conn.set_handler(handler),
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_local_close_sends_close_frame() {
        let (conn, mut remote) = pair();
        conn.close(CloseReason::LocalRequested).await;

        let frames = read_frames(&mut remote, 1).await;
        assert_eq!(frames[0].kind, FrameKind::Close);

        // Writer is shut down after the notice
        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_peer_eof_closes_connection() {
        let (conn, remote) = pair();
        let (handler, mut rx) = recording_handler();
        conn.set_handler(handler).unwrap();

        drop(remote);

        assert_eq!(next(&mut rx).await, Seen::Closed(CloseReason::PeerInitiated));
        tokio::time::timeout(Duration::from_secs(1), conn.closed())
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_peer_close_frame_closes_connection() {
        let (conn, mut remote) = pair();
        let (handler, mut rx) = recording_handler();
        conn.set_handler(handler).unwrap();

        write_frames(&mut remote, &[Frame::data("last"), Frame::close("done")]).await;

        assert_eq!(next(&mut rx).await, Seen::Message(Bytes::from("last")));
        assert_eq!(next(&mut rx).await, Seen::Closed(CloseReason::PeerInitiated));
    }

    #[tokio::test]
    async fn test_framing_error_closes_connection() {
        let (conn, mut remote) = pair();
        let (handler, mut rx) = recording_handler();
        conn.set_handler(handler).unwrap();

        remote.write_all(&[0xEE; 16]).await.unwrap();

        match next(&mut rx).await {
            Seen::Closed(CloseReason::TransportError(msg)) => {
                assert!(msg.contains("unknown frame kind"));
            }
            other => panic!("unexpected callback: {:?}", other),
        }
        assert!(conn.last_error().is_some());
    }

    #[tokio::test]
    async fn test_no_callbacks_after_close() {
        let (conn, mut remote) = pair();
        let (handler, mut rx) = recording_handler();
        conn.set_handler(handler).unwrap();

        conn.close(CloseReason::LocalRequested).await;
        assert_eq!(next(&mut rx).await, Seen::Closed(CloseReason::LocalRequested));

        // The remote may still write; nothing reaches the handler
        let _ = remote.write_all(b"ignored").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_clear_handler_queues_until_next_handler() {
        let (conn, mut remote) = pair();
        let (first, mut first_rx) = recording_handler();
        conn.set_handler(first).unwrap();

        write_frames(&mut remote, &[Frame::data("one")]).await;
        assert_eq!(next(&mut first_rx).await, Seen::Message(Bytes::from("one")));

        assert!(conn.clear_handler().is_some());
        write_frames(&mut remote, &[Frame::data("two")]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(first_rx.try_recv().is_err());

        let (second, mut second_rx) = recording_handler();
        conn.set_handler(second).unwrap();
        assert_eq!(next(&mut second_rx).await, Seen::Message(Bytes::from("two")));
    }

    #[tokio::test]
    async fn test_concurrent_sends_do_not_interleave() {
        let (conn, mut remote) = pair();

        let mut tasks = Vec::new();
        for sender in 0..8u8 {
            let conn = conn.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..25usize {
                    let payload = vec![sender; 100 + i * 37];
                    conn.send(Bytes::from(payload)).await.unwrap();
                }
            }));
        }

        let reader = tokio::spawn(async move { read_frames(&mut remote, 8 * 25).await });
        for task in tasks {
            task.await.unwrap();
        }

        let frames = reader.await.unwrap();
        assert_eq!(frames.len(), 200);
        for frame in frames {
            let first = frame.payload[0];
            assert!(frame.payload.iter().all(|b| *b == first));
        }
    }

    #[tokio::test]
    async fn test_close_releases_socket_while_send_is_blocked() {
        // A tiny pipe and a remote that is not reading yet
        let (local, mut remote) = tokio::io::duplex(64);
        let conn = PeerConnection::open_io(local, None, PeerRole::Passive, &config());

        let sender = conn.clone();
        let send = tokio::spawn(async move { sender.send(Bytes::from(vec![7u8; 4096])).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!send.is_finished());

        tokio::time::timeout(Duration::from_secs(1), conn.close(CloseReason::LocalRequested))
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);

        let result = tokio::time::timeout(Duration::from_secs(1), send)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));

        // Draining the partial frame ends in EOF: the socket was released
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(1), remote.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.len() < 4096 + 9);
    }

    /// Detaches itself on the first message.
    struct DetachingHandler {
        conn: parking_lot::Mutex<Option<Arc<PeerConnection>>>,
        tx: mpsc::UnboundedSender<Seen>,
    }

    impl MessageHandler for DetachingHandler {
        fn on_receive(&self, message: Bytes) {
            let _ = self.tx.send(Seen::Message(message));
            if let Some(conn) = self.conn.lock().take() {
                assert!(conn.clear_handler().is_some());
            }
        }

        fn on_close(&self, reason: &CloseReason) {
            let _ = self.tx.send(Seen::Closed(reason.clone()));
        }
    }

    #[tokio::test]
    async fn test_handler_can_detach_itself_from_callback() {
        let (conn, mut remote) = pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(DetachingHandler {
            conn: parking_lot::Mutex::new(Some(conn.clone())),
            tx,
        });
        conn.set_handler(handler).unwrap();

        write_frames(&mut remote, &[Frame::data("first"), Frame::data("second")]).await;
        assert_eq!(next(&mut rx).await, Seen::Message(Bytes::from("first")));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        let (replacement, mut replacement_rx) = recording_handler();
        conn.set_handler(replacement).unwrap();
        assert_eq!(next(&mut replacement_rx).await, Seen::Message(Bytes::from("second")));
    }

    #[tokio::test]
    async fn test_handler_detaching_during_pending_flush_keeps_the_rest_queued() {
        let (conn, mut remote) = pair();
        write_frames(&mut remote, &[Frame::data("a"), Frame::data("b"), Frame::data("c")]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(DetachingHandler {
            conn: parking_lot::Mutex::new(Some(conn.clone())),
            tx,
        });
        conn.set_handler(handler).unwrap();
        assert_eq!(next(&mut rx).await, Seen::Message(Bytes::from("a")));
        assert!(rx.try_recv().is_err());

        let (replacement, mut replacement_rx) = recording_handler();
        conn.set_handler(replacement).unwrap();
        assert_eq!(next(&mut replacement_rx).await, Seen::Message(Bytes::from("b")));
        assert_eq!(next(&mut replacement_rx).await, Seen::Message(Bytes::from("c")));
    }

    #[tokio::test]
    async fn test_connecting_state_before_attach() {
        let conn = PeerConnection::connecting(PeerRole::Active, None, &config());
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(matches!(
            conn.send(Bytes::from_static(b"x")).await,
            Err(TransportError::ConnectionClosed)
        ));

        let (local, _remote) = tokio::io::duplex(1024);
        conn.attach(local);
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_endpoint_trait_delegates() {
        let (conn, mut remote) = pair();
        let endpoint: Arc<dyn MessageEndpoint> = conn.clone();

        assert_eq!(endpoint.id(), conn.id());
        endpoint.send(Bytes::from_static(b"via-trait")).await.unwrap();
        let frames = read_frames(&mut remote, 1).await;
        assert_eq!(frames[0].payload, Bytes::from_static(b"via-trait"));

        endpoint.close(CloseReason::LocalRequested).await;
        assert_eq!(endpoint.state(), ConnectionState::Closed);
    }
}
