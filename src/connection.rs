//! Connection handle definition
//!
//! A `Connection` is the relay's view of one connected client: it queues
//! outbound events for a writer task and carries the liveness flag shared
//! with the matching `Inbound` request reader.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, warn};

use crate::error::{ChatError, TransportError};
use crate::message::{decode_request, ClientMessage, ServerMessage};
use crate::types::{ConnectionId, Identity};

/// Connected client handle
///
/// Owned by the `ChatServer` connection table and shared with fan-out tasks
/// through `Arc`. Conversations never hold one; they look it up by identity.
#[derive(Debug)]
pub struct Connection {
    /// Unique identifier of this connection instance
    id: ConnectionId,
    /// Identity bound at connect time
    identity: Identity,
    /// Server → Client event queue
    sender: mpsc::Sender<ServerMessage>,
    /// Liveness flag, `true` once closed
    closed: Arc<watch::Sender<bool>>,
    /// Upper bound on one socket write and on writer shutdown
    send_timeout: Duration,
    /// Writer task draining `sender` into the socket, if any
    writer: Mutex<Option<JoinHandle<Result<(), TransportError>>>>,
}

impl Connection {
    /// Create a connection whose events go to the given channel
    pub fn new(identity: Identity, sender: mpsc::Sender<ServerMessage>, send_timeout: Duration) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id: ConnectionId::new(),
            identity,
            sender,
            closed: Arc::new(closed),
            send_timeout,
            writer: Mutex::new(None),
        }
    }

    /// Create a channel-backed connection and return its event receiver
    pub fn channel(
        identity: Identity,
        buffer: usize,
        send_timeout: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Arc::new(Self::new(identity, tx, send_timeout)), rx)
    }

    /// Wrap a WebSocket stream
    ///
    /// Spawns the writer task and returns the handle together with the
    /// reader for inbound requests.
    pub fn spawn<S>(
        identity: Identity,
        ws_stream: WebSocketStream<S>,
        buffer: usize,
        send_timeout: Duration,
    ) -> (Arc<Self>, Inbound<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (ws_sender, ws_receiver) = ws_stream.split();
        let (tx, rx) = mpsc::channel(buffer);
        let connection = Arc::new(Self::new(identity.clone(), tx, send_timeout));

        let writer = tokio::spawn(write_loop(
            connection.id,
            ws_sender,
            rx,
            connection.closed.clone(),
            send_timeout,
        ));
        if let Ok(mut slot) = connection.writer.lock() {
            *slot = Some(writer);
        }

        let inbound = Inbound {
            identity,
            stream: ws_receiver,
            closed: connection.closed.subscribe(),
            finished: false,
        };
        (connection, inbound)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Check if the connection has not been closed yet
    pub fn is_live(&self) -> bool {
        !*self.closed.borrow()
    }

    /// Queue one event for this client
    ///
    /// Never waits. A full queue means the client is not keeping up, so the
    /// connection is closed and its intake loop tears it down.
    pub fn send(&self, msg: ServerMessage) -> Result<(), TransportError> {
        if !self.is_live() {
            return Err(TransportError::Closed);
        }
        match self.sender.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Outbound queue full for {} ({}), evicting", self.id, self.identity);
                self.close();
                Err(TransportError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close();
                Err(TransportError::Closed)
            }
        }
    }

    /// Mark the connection closed
    ///
    /// Idempotent. Stops the writer once queued events are flushed and ends
    /// the inbound request sequence. Returns true only for the call that
    /// actually closed it.
    pub fn close(&self) -> bool {
        let was_closed = self.closed.send_replace(true);
        if !was_closed {
            debug!("Connection {} ({}) closed", self.id, self.identity);
        }
        !was_closed
    }

    /// Close and wait for the writer to send the close frame
    ///
    /// The wait is bounded by the send timeout. A writer still stuck after
    /// that is aborted.
    pub async fn finish(&self) -> Result<(), TransportError> {
        self.close();
        let writer = match self.writer.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(mut handle) = writer else {
            return Ok(());
        };
        match tokio::time::timeout(self.send_timeout, &mut handle).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("Writer for {} did not stop in time, aborting", self.id);
                handle.abort();
                Err(TransportError::Timeout(self.send_timeout))
            }
        }
    }
}

/// Inbound request reader for one connection
pub struct Inbound<S> {
    identity: Identity,
    stream: SplitStream<WebSocketStream<S>>,
    closed: watch::Receiver<bool>,
    finished: bool,
}

impl<S> Inbound<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wait for the next request
    ///
    /// Returns `None` once the peer closes or the connection is closed
    /// locally. A protocol or transport failure is yielded once, after which
    /// the sequence stays ended.
    pub async fn receive(&mut self) -> Option<Result<ClientMessage, ChatError>> {
        if self.finished {
            return None;
        }

        let next = loop {
            let frame = tokio::select! {
                frame = self.stream.next() => frame,
                _ = wait_closed(&mut self.closed) => None,
            };

            match frame {
                Some(Ok(Message::Text(text))) => break Some(decode_request(&text)),
                Some(Ok(Message::Binary(data))) => {
                    break Some(match std::str::from_utf8(&data) {
                        Ok(text) => decode_request(text),
                        Err(e) => Err(ChatError::Protocol {
                            payload: String::from_utf8_lossy(&data).into_owned(),
                            reason: e.to_string(),
                        }),
                    });
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("Client {} sent close frame", self.identity);
                    break None;
                }
                Some(Ok(_)) => {
                    // Ping/Pong are answered by tungstenite
                    continue;
                }
                Some(Err(e)) => break Some(Err(ChatError::from(e))),
                None => break None,
            }
        };

        if !matches!(next, Some(Ok(_))) {
            self.finished = true;
        }
        next
    }
}

/// Resolve once the liveness flag flips to closed
async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

/// Drain queued events into the socket until the connection is closed
///
/// Every socket write is bounded by `send_timeout`. On failure the
/// connection is marked closed so its request reader ends as well.
async fn write_loop<S>(
    connection_id: ConnectionId,
    mut ws_sender: SplitSink<WebSocketStream<S>, Message>,
    mut outbound: mpsc::Receiver<ServerMessage>,
    closed: Arc<watch::Sender<bool>>,
    send_timeout: Duration,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut closed_rx = closed.subscribe();
    loop {
        tokio::select! {
            // Queued events go out before the close frame
            biased;
            msg = outbound.recv() => {
                let Some(msg) = msg else { break };
                match serde_json::to_string(&msg) {
                    Ok(json) => {
                        let write = ws_sender.send(Message::Text(json.into()));
                        let failure = match tokio::time::timeout(send_timeout, write).await {
                            Ok(Ok(())) => continue,
                            Ok(Err(e)) => TransportError::from(e),
                            Err(_) => TransportError::Timeout(send_timeout),
                        };
                        debug!("WebSocket send failed for {}: {}", connection_id, failure);
                        closed.send_replace(true);
                        return Err(failure);
                    }
                    Err(e) => {
                        error!("Failed to serialize message: {}", e);
                        // Continue - don't break on serialization errors
                    }
                }
            }
            _ = wait_closed(&mut closed_rx) => break,
        }
    }
    debug!("Write task ended for {}", connection_id);

    match tokio::time::timeout(send_timeout, ws_sender.close()).await {
        Ok(Ok(())) | Ok(Err(tungstenite::Error::ConnectionClosed)) | Ok(Err(tungstenite::Error::AlreadyClosed)) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(TransportError::Timeout(send_timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ChatMessage;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        (server, client)
    }

    #[tokio::test]
    async fn test_receive_decodes_requests() {
        let (server, mut client) = ws_pair().await;
        let (_conn, mut inbound) = Connection::spawn("alice".into(), server, 32, TIMEOUT);

        client
            .send(Message::Text(
                r#"{"event": "request.conversation.join", "conversation_id": "general"}"#.into(),
            ))
            .await
            .unwrap();

        let request = inbound.receive().await.unwrap().unwrap();
        assert_eq!(
            request,
            ClientMessage::Join {
                conversation_id: "general".into()
            }
        );
    }

    #[tokio::test]
    async fn test_receive_protocol_error_ends_sequence() {
        let (server, mut client) = ws_pair().await;
        let (_conn, mut inbound) = Connection::spawn("alice".into(), server, 32, TIMEOUT);

        let payload = r#"{"event": "bogus"}"#;
        client.send(Message::Text(payload.into())).await.unwrap();
        client
            .send(Message::Text(
                r#"{"event": "request.conversation.join", "conversation_id": "general"}"#.into(),
            ))
            .await
            .unwrap();

        match inbound.receive().await {
            Some(Err(ChatError::Protocol { payload: raw, .. })) => assert_eq!(raw, payload),
            other => panic!("expected protocol error, got {:?}", other),
        }
        assert!(inbound.receive().await.is_none());
    }

    #[tokio::test]
    async fn test_receive_ends_when_peer_closes() {
        let (server, mut client) = ws_pair().await;
        let (_conn, mut inbound) = Connection::spawn("alice".into(), server, 32, TIMEOUT);

        client.close(None).await.unwrap();

        assert!(inbound.receive().await.is_none());
    }

    #[tokio::test]
    async fn test_send_writes_json_frame() {
        let (server, mut client) = ws_pair().await;
        let (conn, _inbound) = Connection::spawn("alice".into(), server, 32, TIMEOUT);

        conn.send(ServerMessage::MemberJoined {
            conversation_id: "general".into(),
            username: "bob".into(),
        })
        .unwrap();

        let frame = tokio::time::timeout(TIMEOUT, client.next()).await.unwrap().unwrap().unwrap();
        let text = frame.into_text().unwrap();
        let event: ServerMessage = serde_json::from_str(&text).unwrap();
        assert!(matches!(event, ServerMessage::MemberJoined { username, .. } if username.as_str() == "bob"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_ends_receive() {
        let (server, _client) = ws_pair().await;
        let (conn, mut inbound) = Connection::spawn("alice".into(), server, 32, TIMEOUT);

        assert!(conn.is_live());
        assert!(conn.close());
        assert!(!conn.close());
        assert!(!conn.is_live());

        assert!(inbound.receive().await.is_none());
        assert!(conn.finish().await.is_ok());
        assert!(conn.finish().await.is_ok());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (conn, _rx) = Connection::channel("alice".into(), 8, TIMEOUT);
        conn.close();

        let result = conn.send(ServerMessage::MemberJoined {
            conversation_id: "general".into(),
            username: "bob".into(),
        });
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_send_to_dropped_receiver_fails() {
        let (conn, rx) = Connection::channel("alice".into(), 8, TIMEOUT);
        drop(rx);

        let result = conn.send(ServerMessage::MemberLeft {
            conversation_id: "general".into(),
            username: "bob".into(),
        });
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_full_queue_evicts_connection() {
        let (conn, _rx) = Connection::channel("alice".into(), 1, TIMEOUT);
        let event = ServerMessage::MemberJoined {
            conversation_id: "general".into(),
            username: "bob".into(),
        };

        conn.send(event.clone()).unwrap();
        assert!(matches!(conn.send(event.clone()), Err(TransportError::QueueFull)));
        assert!(!conn.is_live());
        assert!(matches!(conn.send(event), Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_overflow_ends_receive() {
        // Client never reads, so the writer stalls and the queue fills up
        let (server_io, client_io) = tokio::io::duplex(64);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let _client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let (conn, mut inbound) = Connection::spawn("alice".into(), server, 1, TIMEOUT);

        let mut overflowed = false;
        for i in 0..100 {
            let event = ServerMessage::Message(ChatMessage::new(
                "general".into(),
                "bob".into(),
                format!("message number {} with some padding to fill the pipe", i),
            ));
            match conn.send(event) {
                Ok(()) => tokio::task::yield_now().await,
                Err(TransportError::QueueFull) => {
                    overflowed = true;
                    break;
                }
                Err(e) => panic!("unexpected send error: {}", e),
            }
        }
        assert!(overflowed);
        assert!(!conn.is_live());

        let next = tokio::time::timeout(TIMEOUT, inbound.receive()).await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_finish_is_bounded_when_peer_never_reads() {
        let (server_io, client_io) = tokio::io::duplex(64);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let _client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let send_timeout = Duration::from_millis(200);
        let (conn, _inbound) = Connection::spawn("alice".into(), server, 32, send_timeout);

        for i in 0..10 {
            let _ = conn.send(ServerMessage::Message(ChatMessage::new(
                "general".into(),
                "bob".into(),
                format!("message number {} with some padding to fill the pipe", i),
            )));
        }

        let result = tokio::time::timeout(Duration::from_secs(3), conn.finish())
            .await
            .expect("finish must not hang");
        assert!(matches!(result, Err(TransportError::Timeout(_))));
        assert!(!conn.is_live());
    }
}
