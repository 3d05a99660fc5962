/* Secure Proxy (AGPL-3.0)

Copyright (C) 2025 - Secure Proxy Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

//! TCP listener and connection dispatch.
//!
//! One spawned task per accepted connection; handler failures are isolated
//! to their task. A watch channel drives graceful shutdown: stop accepting,
//! wait up to the configured grace for in-flight connections to drain, then
//! return (remaining sockets close on drop).

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{net::TcpListener, sync::watch, task::JoinHandle};
use uuid::Uuid;

use crate::{
    config::settings::ListenerSettings,
    proxy::bridge::Bridge,
    utils::error::{ProxyError, ProxyResult},
};

/// Handle returned by [`start`]. Call [`ProxyHandle::shutdown`] and then
/// [`ProxyHandle::wait`] for a graceful stop. Dropping the handle also stops
/// the accept loop, but nothing waits for the drain to finish.
pub struct ProxyHandle {
    /// Actual bound address (relevant when the configured port is 0).
    pub addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl ProxyHandle {
    /// Signals the accept loop to stop and drain.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Waits for the accept loop (including the drain period) to finish.
    pub async fn wait(self) {
        let _ = self.accept_task.await;
    }
}

/// Binds the listener and spawns the accept loop.
///
/// **Sequence:**
/// 1. Bind the TCP listener on the configured address:port (port 0 asks the
///    OS for an ephemeral port, which the integration tests rely on)
/// 2. Read back the actual local address for the returned handle
/// 3. Create the shutdown watch channel
/// 4. Spawn the accept loop as an independent task and return immediately
///
/// **Error handling:**
/// Bind errors (address in use, permission denied) are fatal and propagate
/// to the caller; the process exits 1. Everything after the bind is isolated
/// inside the accept-loop task.
///
/// **Resource sharing:**
/// The `Arc<Bridge>` holds every per-process component (CA, rule store,
/// traffic log, upstream connector); cloning it per connection is a cheap
/// refcount bump.
pub async fn start(settings: &ListenerSettings, bridge: Arc<Bridge>) -> ProxyResult<ProxyHandle> {
    let bind_addr = format!("{}:{}", settings.bind_address, settings.bind_port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .map_err(|source| ProxyError::Bind {
            addr: bind_addr.clone(),
            source,
        })?;
    let addr = listener.local_addr().map_err(|source| ProxyError::Bind {
        addr: bind_addr,
        source,
    })?;

    tracing::info!(%addr, "proxy listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let max_connections = settings.max_connections;
    let grace = Duration::from_secs(settings.shutdown_grace_secs);

    let accept_task = tokio::spawn(accept_loop(
        listener,
        bridge,
        shutdown_rx,
        max_connections,
        grace,
    ));

    Ok(ProxyHandle {
        addr,
        shutdown_tx,
        accept_task,
    })
}

/// Main accept loop: accepts connections, spawns handler tasks, drains on
/// shutdown.
///
/// Each iteration races the listener against the shutdown channel:
/// ```text
/// loop {
///     1. listener.accept() yields the next client connection
///     2. Reject it early when the active-connection limit is hit
///     3. Spawn an independent task running Bridge::handle
///     4. Keep accepting (connections are handled concurrently)
/// }
/// ```
///
/// **Connection limiting:**
/// A shared `AtomicUsize` counts live handler tasks. At the limit, new
/// sockets are dropped immediately instead of queueing; the workload sees a
/// closed connection rather than unbounded latency.
///
/// **Error handling:**
/// - Accept errors (transient, e.g. EMFILE) are logged and the loop
///   continues; they must not kill the listener.
/// - Handler errors are logged in the spawned task and never propagate; one
///   broken connection cannot affect the others.
///
/// **Graceful shutdown:**
/// When the watch channel fires (or the sender is dropped), the loop exits,
/// the listener socket closes so no new connections arrive, and [`drain`]
/// waits up to the grace period for the active count to reach zero before
/// returning. Connections still alive after the grace close when their
/// tasks are dropped with the runtime.
async fn accept_loop(
    listener: TcpListener,
    bridge: Arc<Bridge>,
    mut shutdown_rx: watch::Receiver<bool>,
    max_connections: usize,
    grace: Duration,
) {
    let active = Arc::new(AtomicUsize::new(0));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::warn!("accept error: {err}");
                        continue;
                    }
                };

                // Enforce the connection cap before spending any work on
                // the socket; dropping it sends the client a close.
                if max_connections > 0 && active.load(Ordering::Relaxed) >= max_connections {
                    tracing::warn!(%peer, "connection limit reached, dropping connection");
                    drop(stream);
                    continue;
                }
                active.fetch_add(1, Ordering::Relaxed);

                // Clone shared resources for the spawned task (Arc clones
                // are cheap refcount bumps).
                let bridge = Arc::clone(&bridge);
                let active = Arc::clone(&active);
                tokio::spawn(async move {
                    // UUID v7 is timestamp-sortable, so diagnostics for one
                    // connection group together in the log stream.
                    let conn_id = Uuid::now_v7();
                    tracing::debug!(%peer, %conn_id, "accepted connection");
                    // Bridge::handle runs peek, handshakes, evaluation, and
                    // the relay; errors are logged here and go no further.
                    if let Err(err) = bridge.handle(stream, peer).await {
                        tracing::warn!(%peer, %conn_id, "connection ended with error: {err}");
                    }
                    active.fetch_sub(1, Ordering::Relaxed);
                });
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    drop(listener);
    drain(&active, grace).await;
    tracing::info!("proxy listener stopped");
}

/// Waits for in-flight connections to finish, bounded by the grace period.
async fn drain(active: &AtomicUsize, grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        let remaining = active.load(Ordering::Relaxed);
        if remaining == 0 {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(remaining, "shutdown grace elapsed, force-closing connections");
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
