use std::{net::SocketAddr, sync::Arc};

use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc::{self, error::TrySendError},
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};
use tracing::{debug, error, trace, warn, Instrument};
use vnet_wire::{router, RouterFrame};

use super::Shared;

/// Accepts inbound connections and spawns one reader per connection.
pub(super) async fn accept_loop(
    listener: TcpListener,
    inbound: mpsc::Sender<RouterFrame>,
    shared: Arc<Shared>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => {
                debug!("accept loop stopped");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "accepted connection");
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(?e, %addr, "failed to set nodelay");
                    }

                    let span = tracing::debug_span!("inbound", %addr);
                    let read = read_loop(stream, addr, inbound.clone(), Arc::clone(&shared));
                    tokio::spawn(read.instrument(span));
                }
                Err(e) => error!(?e, "failed to accept connection"),
            }
        }
    }
}

/// Decodes [`RouterFrame`]s from one inbound connection into the inbound queue. A decode error
/// closes this connection and nothing else.
async fn read_loop(
    stream: TcpStream,
    addr: SocketAddr,
    inbound: mpsc::Sender<RouterFrame>,
    shared: Arc<Shared>,
) {
    shared.stats.increment_active_inbound();
    let mut conn = FramedRead::new(stream, router::Codec::new());

    loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            msg = conn.next() => match msg {
                Some(Ok(msg)) => {
                    shared.stats.increment_in();
                    if inbound.try_send(msg).is_err() {
                        debug!("inbound queue full, dropping frame");
                        shared.stats.increment_inbound_dropped();
                    }
                }
                Some(Err(e)) => {
                    warn!(?e, %addr, "failed to decode frame, closing connection");
                    shared.stats.increment_decode_errors();
                    break;
                }
                None => {
                    debug!(%addr, "peer closed connection");
                    break;
                }
            }
        }
    }

    shared.stats.decrement_active_inbound();
}

/// Hands every inbound frame to the link registered for its `(to, from)` pair.
pub(super) async fn dispatch_loop(mut inbound: mpsc::Receiver<RouterFrame>, shared: Arc<Shared>) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            msg = inbound.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let tx = shared.tables.lock().locals.get(&(msg.to.clone(), msg.from.clone())).cloned();
        let Some(tx) = tx else {
            trace!(to = %msg.to, from = %msg.from, "no local router for frame, dropping");
            shared.stats.increment_unroutable();
            continue;
        };

        if let Err(TrySendError::Full(_)) = tx.try_send(msg.frame) {
            debug!(to = %msg.to, "local link queue full, dropping frame");
            shared.stats.increment_inbound_dropped();
        }
    }

    debug!("dispatch loop stopped");
}

/// Moves frames from the shared outbound queue to the connection of their destination router.
pub(super) async fn send_loop(mut outbound: mpsc::Receiver<RouterFrame>, shared: Arc<Shared>) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            msg = outbound.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let tx = {
            let tables = shared.tables.lock();
            tables
                .remotes
                .get(&msg.to)
                .and_then(|remote| tables.connections.get(&remote.addr))
                .map(|conn| conn.tx.clone())
        };

        let Some(tx) = tx else {
            trace!(to = %msg.to, "no connection for frame, dropping");
            shared.stats.increment_unroutable();
            continue;
        };

        if tx.try_send(msg).is_err() {
            debug!("connection queue full, dropping frame");
            shared.stats.increment_outbound_dropped();
        }
    }

    debug!("send loop stopped");
}

/// Encodes frames onto one outbound connection. On a write error the connection is marked dead
/// and removed, so frames for its routers are dropped until a new connection is added.
pub(super) async fn write_loop(
    stream: TcpStream,
    mut rx: mpsc::Receiver<RouterFrame>,
    addr: SocketAddr,
    id: u64,
    cancel: CancellationToken,
    shared: Arc<Shared>,
) {
    let mut conn = FramedWrite::new(stream, router::Codec::new());

    let result: Result<(), vnet_wire::Error> = async {
        loop {
            let msg = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => return Ok(()),
                },
            };

            // Buffer everything already queued, then flush once.
            conn.feed(msg).await?;
            let mut n = 1;
            while let Ok(msg) = rx.try_recv() {
                conn.feed(msg).await?;
                n += 1;
            }
            conn.flush().await?;

            shared.stats.increment_out(n);
        }
    }
    .await;

    if let Err(e) = result {
        warn!(?e, "failed to write to connection, marking it dead");
        shared.stats.increment_dead_connections();

        let mut tables = shared.tables.lock();
        if tables.connections.get(&addr).is_some_and(|conn| conn.id == id) {
            tables.connections.remove(&addr);
        }
    } else {
        debug!("connection closed");
    }
}
