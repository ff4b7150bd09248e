//! Drives one sync session over an open byte stream.
//!
//! The protocol engine lives in `lesson_sync_core::SyncSession`; this module
//! owns the socket: it writes the handshake burst, reads chunks, and carries
//! out the engine's actions until the peer goes away or the session's
//! cancellation token fires.

use lesson_sync_core::{Lesson, SessionAction, SessionContext, SyncMessage, SyncSession};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Size of the socket read buffer.
const READ_BUF_SIZE: usize = 16 * 1024;

/// Default upper bound on establishing an outbound connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timing policy for sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// How long a client waits for the TCP connection to be established
    pub connect_timeout: Duration,
    /// Stop a session after this long without inbound bytes (None = never)
    pub idle_timeout: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: None,
        }
    }
}

pub type LessonsCallback = Arc<dyn Fn(Vec<Lesson>) + Send + Sync>;

/// Single-slot new-lessons listener shared by a service and its sessions.
///
/// Registering replaces the previous listener. Batches delivered while no
/// listener is set are dropped.
#[derive(Clone, Default)]
pub struct LessonListener {
    slot: Arc<RwLock<Option<LessonsCallback>>>,
}

impl LessonListener {
    pub fn set(&self, callback: impl Fn(Vec<Lesson>) + Send + Sync + 'static) {
        *self.slot.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(callback));
    }

    pub fn deliver(&self, lessons: Vec<Lesson>) {
        // Clone out so the callback runs without the lock held
        let callback = self.slot.read().unwrap_or_else(|e| e.into_inner()).clone();
        match callback {
            Some(callback) => callback(lessons),
            None => debug!("No listener registered, dropping {} lesson(s)", lessons.len()),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Stopped locally
    Cancelled,
    /// Peer closed the connection
    Closed,
    /// No inbound bytes within the idle timeout
    Idle,
    /// Read or write failed
    TransportError,
}

enum ReadOutcome {
    Data(usize),
    Eof,
    Idle,
}

/// Run the full protocol over `stream` until it ends.
///
/// `peer` is only used for logging.
pub async fn run_session<S>(
    stream: S,
    peer: &str,
    context: &SessionContext,
    listener: &LessonListener,
    options: SessionOptions,
    cancel: CancellationToken,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut session = SyncSession::new(context);

    let end = 'session: {
        // Handshake goes out as one burst before anything is read
        let burst: Vec<u8> = session.start().iter().flat_map(SyncMessage::to_line).collect();
        // A peer that never reads can stall this write, so it must yield to stop()
        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => break 'session SessionEnd::Cancelled,
            written = write_bytes(&mut writer, &burst) => written,
        };
        if let Err(e) = written {
            error!("Failed to send handshake to {}: {}", peer, e);
            break 'session SessionEnd::TransportError;
        }
        debug!("Sent handshake as {} to {}", session.local_username(), peer);

        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'session SessionEnd::Cancelled,
                outcome = read_chunk(&mut reader, &mut buf, options.idle_timeout) => outcome,
            };

            let n = match outcome {
                Ok(ReadOutcome::Data(n)) => n,
                Ok(ReadOutcome::Eof) => {
                    info!("Peer {} closed the connection", peer);
                    break 'session SessionEnd::Closed;
                }
                Ok(ReadOutcome::Idle) => {
                    info!("Session with {} idle, stopping", peer);
                    break 'session SessionEnd::Idle;
                }
                Err(e) => {
                    error!("Read from {} failed: {}", peer, e);
                    break 'session SessionEnd::TransportError;
                }
            };

            // A stop may have landed while the read was completing
            if cancel.is_cancelled() {
                break 'session SessionEnd::Cancelled;
            }

            for action in session.receive(&buf[..n]) {
                match action {
                    SessionAction::Send(message) => {
                        let line = message.to_line();
                        let written = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break 'session SessionEnd::Cancelled,
                            written = write_bytes(&mut writer, &line) => written,
                        };
                        if let Err(e) = written {
                            error!("Write of {} to {} failed: {}", message.kind(), peer, e);
                            break 'session SessionEnd::TransportError;
                        }
                    }
                    SessionAction::Deliver(lessons) => listener.deliver(lessons),
                }
            }
        }
    };

    session.stop();
    // Best-effort close; the peer may already be gone
    let _ = writer.shutdown().await;
    debug!("Session with {} ended: {:?}", peer, end);
    end
}

async fn read_chunk<S: AsyncRead>(
    reader: &mut ReadHalf<S>,
    buf: &mut [u8],
    idle_timeout: Option<Duration>,
) -> std::io::Result<ReadOutcome> {
    let n = match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, reader.read(buf)).await {
            Ok(result) => result?,
            Err(_) => return Ok(ReadOutcome::Idle),
        },
        None => reader.read(buf).await?,
    };
    Ok(if n == 0 {
        ReadOutcome::Eof
    } else {
        ReadOutcome::Data(n)
    })
}

async fn write_bytes<S: AsyncWrite>(writer: &mut WriteHalf<S>, data: &[u8]) -> std::io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}
