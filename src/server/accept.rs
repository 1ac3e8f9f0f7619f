//! Accept engine.
//!
//! # Responsibilities
//! - Run L parallel accept loops against the shared listener
//! - Enforce the accept cap, suppressing surplus streams raced in by
//!   concurrent loops
//! - Classify accept errors: timeout-class resets the backoff, transient
//!   errors back off exponentially, anything else is fatal
//! - Optionally pin the first L/2 loops to OS threads

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::dispatch::{ShardedPool, Submitter};
use crate::error::ServerError;
use crate::resilience::AcceptBackoff;

use super::{serve_conn, ServerInner};

enum ErrorClass {
    /// Accept deadline expired; not an error, just re-check the loop state.
    Timeout,
    /// Short-lived condition (peer aborted mid-handshake, fd exhaustion);
    /// worth retrying after a backoff sleep.
    Transient,
    Fatal,
}

fn classify(err: &io::Error) -> ErrorClass {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ErrorClass::Timeout,
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted => ErrorClass::Transient,
        _ => classify_os(err),
    }
}

/// EMFILE/ENFILE keep the backoff branch reachable on platforms whose accept
/// has no inherent timeout: fd exhaustion is transient once handlers close
/// their streams.
#[cfg(unix)]
fn classify_os(err: &io::Error) -> ErrorClass {
    match err.raw_os_error() {
        Some(libc::EMFILE) | Some(libc::ENFILE) => ErrorClass::Transient,
        _ => ErrorClass::Fatal,
    }
}

#[cfg(not(unix))]
fn classify_os(_err: &io::Error) -> ErrorClass {
    ErrorClass::Fatal
}

/// One accept loop. Returns `Ok` on cooperative shutdown, `Err` on a fatal
/// accept failure (after waking the other loops via the shutdown signal).
pub(super) async fn accept_loop(
    inner: Arc<ServerInner>,
    listener: Arc<TcpListener>,
    mut submitter: Submitter,
    loop_id: usize,
) -> Result<(), ServerError> {
    let mut backoff = AcceptBackoff::new();
    let mut shutdown_rx = inner.shutdown.subscribe();

    loop {
        let max = inner.max_accept.load(Ordering::Acquire);
        if max > 0 && inner.accepted.load(Ordering::Acquire) >= max {
            // Cap reached: stop accepting, wait indefinitely for handlers.
            inner.shutdown.trigger(None);
        }

        if inner.shutdown.is_triggered() {
            return Ok(());
        }

        let accepted = tokio::select! {
            _ = shutdown_rx.recv() => return Ok(()),
            res = listener.accept() => res,
        };

        match accepted {
            Ok((stream, peer)) => {
                backoff.reset();

                let seen = inner.accepted.fetch_add(1, Ordering::AcqRel) + 1;
                if max > 0 && seen > max {
                    // Raced past the cap with another loop; this stream should
                    // never have been accepted, so close it undispatched.
                    drop(stream);
                    continue;
                }

                tracing::debug!(peer_addr = %peer, loop_id, "Connection accepted");

                inner.wait_group.add(1);
                inner.active.fetch_add(1, Ordering::AcqRel);
                submitter.submit(Box::pin(serve_conn(inner.clone(), stream)));
            }
            Err(err) => match classify(&err) {
                ErrorClass::Timeout => {
                    backoff.reset();
                }
                ErrorClass::Transient => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        loop_id,
                        "Transient accept error; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                ErrorClass::Fatal => {
                    if inner.shutdown.is_triggered() {
                        return Ok(());
                    }
                    tracing::error!(error = %err, loop_id, "Fatal accept error");
                    // Wake the sibling loops so serve can unwind.
                    inner.shutdown.trigger(Some(std::time::Instant::now()));
                    return Err(ServerError::AcceptFatal(err));
                }
            },
        }
    }
}

/// Spawn `loops` accept loops, each reporting its result on `results`.
///
/// When `lock_os_threads` is set and the host offers at least two hardware
/// threads, the first `loops / 2` run on dedicated OS threads pinned to a
/// core, driving the loop future through the runtime handle; the rest are
/// plain tasks.
pub(super) fn spawn_accept_loops(
    inner: &Arc<ServerInner>,
    listener: &Arc<TcpListener>,
    pool: &ShardedPool,
    loops: usize,
    lock_os_threads: bool,
    results: mpsc::Sender<Result<(), ServerError>>,
) {
    let hardware_threads = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let pinned_loops = if lock_os_threads && hardware_threads >= 2 {
        loops / 2
    } else {
        0
    };
    let core_ids = if pinned_loops > 0 {
        core_affinity::get_core_ids().unwrap_or_default()
    } else {
        Vec::new()
    };

    for loop_id in 0..loops {
        let inner = inner.clone();
        let listener = listener.clone();
        let submitter = pool.submitter(loop_id);
        let results = results.clone();

        let fut = async move {
            let res = accept_loop(inner, listener, submitter, loop_id).await;
            // Capacity equals the loop count, so this send cannot block.
            let _ = results.send(res).await;
        };

        if loop_id < pinned_loops {
            let handle = Handle::current();
            let core = core_ids.get(loop_id % core_ids.len().max(1)).copied();
            std::thread::Builder::new()
                .name(format!("accept-{loop_id}"))
                .spawn(move || {
                    if let Some(core) = core {
                        if !core_affinity::set_for_current(core) {
                            tracing::warn!(loop_id, "Failed to pin accept thread to core");
                        }
                    }
                    handle.block_on(fut);
                })
                .expect("spawn accept thread");
        } else {
            tokio::spawn(fut);
        }
    }
}
