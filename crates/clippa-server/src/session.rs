//! Connection session pump.
//!
//! One reader task feeds inbound frames through a small hand-off channel to
//! the dispatch loop, which also drains the member's outbound queue to the
//! connection. The cancellation token stops both halves on shutdown,
//! eviction or a failed write; a closed or failed connection instead closes
//! the hand-off, so frames already read are still dispatched. Whatever ends
//! the session, the member leaves its hub exactly once.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::BoxStream;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use clippa_core::protocol;
use clippa_party::MemberHandle;

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Bound on every connection write.
    pub write_timeout: Duration,
    /// Inbound frames the reader may hold ahead of the dispatch loop.
    pub handoff_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(1),
            handoff_capacity: 1,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("read failed: {0}")]
    Read(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("connection closed")]
    Closed,

    #[error("write timed out after {0:?}")]
    Timeout(Duration),
}

/// Why a session stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer closed the connection.
    PeerClosed,
    ReadFailed(String),
    /// The hub cut the member off.
    Evicted,
    WriteFailed(String),
    WriteTimeout,
    /// The server is shutting down.
    Shutdown,
}

impl From<SessionError> for SessionEnd {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Timeout(_) => Self::WriteTimeout,
            SessionError::Closed => Self::PeerClosed,
            SessionError::Read(msg) => Self::ReadFailed(msg),
            SessionError::Write(msg) => Self::WriteFailed(msg),
        }
    }
}

/// Adapt an axum WebSocket into a text frame stream and a text sink.
/// Close frames end the stream; ping, pong and binary frames are skipped.
pub fn split_socket(
    socket: WebSocket,
) -> (
    BoxStream<'static, Result<String, SessionError>>,
    impl Sink<String, Error = SessionError> + Unpin + Send,
) {
    let (tx, rx) = socket.split();

    let frames = rx
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Close(_)) => Some(Err(SessionError::Closed)),
                Ok(_) => None,
                Err(e) => Some(Err(SessionError::Read(e.to_string()))),
            })
        })
        .boxed();

    let sink = tx
        .with(|text: String| future::ready(Ok::<_, axum::Error>(Message::Text(text.into()))))
        .sink_map_err(|e| SessionError::Write(e.to_string()));

    (frames, sink)
}

/// Pump frames between a connection and `handle` until either side stops.
pub async fn run_session<R, W>(
    frames: R,
    sink: W,
    handle: MemberHandle,
    config: &SessionConfig,
) -> SessionEnd
where
    R: Stream<Item = Result<String, SessionError>> + Send + Unpin + 'static,
    W: Sink<String, Error = SessionError> + Unpin,
{
    run_session_until(frames, sink, handle, config, CancellationToken::new()).await
}

/// [`run_session`] that also stops when `shutdown` is cancelled.
pub async fn run_session_until<R, W>(
    frames: R,
    mut sink: W,
    mut handle: MemberHandle,
    config: &SessionConfig,
    shutdown: CancellationToken,
) -> SessionEnd
where
    R: Stream<Item = Result<String, SessionError>> + Send + Unpin + 'static,
    W: Sink<String, Error = SessionError> + Unpin,
{
    let session = shutdown.child_token();
    let (handoff_tx, mut handoff_rx) = mpsc::channel::<String>(config.handoff_capacity.max(1));
    let reader = tokio::spawn(read_frames(frames, handoff_tx, session.clone()));

    let dispatch_end = loop {
        tokio::select! {
            biased;
            _ = session.cancelled() => break None,
            outbound = handle.recv() => {
                let Some(frame) = outbound else {
                    break Some(SessionEnd::Evicted);
                };
                if let Err(e) = write_frame(&mut sink, frame.to_string(), config.write_timeout).await {
                    break Some(e.into());
                }
            }
            inbound = handoff_rx.recv() => {
                let Some(raw) = inbound else {
                    break None;
                };
                if let Err(err) = handle.handle_message(&raw).await {
                    debug!(
                        party_id = %handle.party_id(),
                        member_id = %handle.member_id(),
                        error = %err,
                        "rejected inbound frame"
                    );
                    let reply = protocol::error_frame(err.code()).to_string();
                    if let Err(e) = write_frame(&mut sink, reply, config.write_timeout).await {
                        break Some(e.into());
                    }
                }
            }
        }
    };

    session.cancel();
    let reader_end = reader.await.ok().flatten();
    let end = match dispatch_end {
        Some(end) => end,
        None if shutdown.is_cancelled() => SessionEnd::Shutdown,
        None => reader_end.unwrap_or(SessionEnd::PeerClosed),
    };

    info!(
        party_id = %handle.party_id(),
        member_id = %handle.member_id(),
        reason = ?end,
        "session ended"
    );
    handle.leave().await;
    let _ = sink.close().await;
    end
}

/// Forward inbound frames until the stream ends, a read fails, or the
/// session is cancelled. Returns `None` when stopped by cancellation.
///
/// Never cancels the session itself: the closed hand-off ends dispatch
/// only after every buffered frame has been handled.
async fn read_frames<R>(
    mut frames: R,
    handoff: mpsc::Sender<String>,
    session: CancellationToken,
) -> Option<SessionEnd>
where
    R: Stream<Item = Result<String, SessionError>> + Unpin,
{
    let end = loop {
        let next = tokio::select! {
            biased;
            _ = session.cancelled() => break None,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(text)) => {
                tokio::select! {
                    biased;
                    _ = session.cancelled() => break None,
                    sent = handoff.send(text) => {
                        if sent.is_err() {
                            break None;
                        }
                    }
                }
            }
            Some(Err(e)) => break Some(e.into()),
            None => break Some(SessionEnd::PeerClosed),
        }
    };
    // Dropping `handoff` lets dispatch drain what was already read.
    drop(handoff);
    end
}

async fn write_frame<W>(sink: &mut W, frame: String, limit: Duration) -> Result<(), SessionError>
where
    W: Sink<String, Error = SessionError> + Unpin,
{
    match tokio::time::timeout(limit, sink.send(frame)).await {
        Ok(result) => result,
        Err(_) => Err(SessionError::Timeout(limit)),
    }
}
