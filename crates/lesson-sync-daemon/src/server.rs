//! Inbound side: accept loop and per-connection session tasks.
//!
//! Every accepted connection gets its own task and its own `SyncSession`
//! built from the shared context snapshot, so sessions never see each
//! other's working sets.

use crate::connection::{LessonListener, SessionOptions, run_session};
use lesson_sync_core::SessionContext;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Pause after a failed accept so a persistent error (e.g. fd exhaustion)
/// does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Everything a session task needs, cloned into each task.
#[derive(Clone)]
pub(crate) struct SessionShared {
    pub context: Arc<SessionContext>,
    pub listener: LessonListener,
    pub options: SessionOptions,
    pub live: Arc<AtomicUsize>,
}

/// Decrements the live session count when the task finishes.
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn enter(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(live))
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Run one session on the tracker, cancelled together with `cancel`.
pub(crate) fn spawn_session<S>(
    tracker: &TaskTracker,
    stream: S,
    peer: String,
    shared: SessionShared,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let guard = LiveGuard::enter(&shared.live);
    tracker.spawn(async move {
        let _guard = guard;
        let end = run_session(
            stream,
            &peer,
            &shared.context,
            &shared.listener,
            shared.options,
            cancel,
        )
        .await;
        debug!("Session task for {} finished ({:?})", peer, end);
    });
}

/// Accept connections until `cancel` fires. Dropping out of the loop closes
/// the listening socket.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    shared: SessionShared,
    tracker: TaskTracker,
    cancel: CancellationToken,
) {
    let local = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".into());

    loop {
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                if cancel.is_cancelled() {
                    break;
                }
                on_accepted(stream, addr, &shared, &tracker, &cancel);
            }
            Err(e) => {
                warn!("Accept on {} failed: {}", local, e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
        }
    }

    info!("Stopped listening on {}", local);
}

fn on_accepted(
    stream: tokio::net::TcpStream,
    addr: SocketAddr,
    shared: &SessionShared,
    tracker: &TaskTracker,
    cancel: &CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed for {}: {}", addr, e);
    }
    info!("Accepted connection from {}", addr);
    spawn_session(
        tracker,
        stream,
        addr.to_string(),
        shared.clone(),
        cancel.child_token(),
    );
}
