//! The inter-machine relay.
//!
//! Frames addressed to routers hosted on another machine are posted to a shared outbound queue as
//! [`RouterFrame`]s, encoded onto one persistent TCP connection per peer machine and decoded on
//! the other side, where they are handed to the link registered for their `(to, from)` pair.
//!
//! Every connection is owned by its own task. A decode or write error closes that connection only;
//! the rest of the relay keeps running.

use std::{net::SocketAddr, sync::Arc};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream, ToSocketAddrs},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};
use vnet_common::{constants::DEFAULT_QUEUE_SIZE, RouterId};
use vnet_wire::{Frame, RouterFrame};

mod driver;
mod stats;
pub use stats::IcmStats;

/// Errors raised by the inter-machine relay.
#[derive(Debug, Error)]
pub enum IcmError {
    #[error("IO error: {0:?}")]
    Io(#[from] std::io::Error),
    #[error("Relay stopped")]
    Stopped,
}

/// Queue sizes of the relay.
#[derive(Debug, Clone)]
pub struct IcmOptions {
    /// Capacity of the queue between the inbound connections and the dispatch loop.
    pub(crate) inbound_queue_size: usize,
    /// Capacity of the shared outbound queue.
    pub(crate) outbound_queue_size: usize,
    /// Capacity of each outbound connection's write queue.
    pub(crate) connection_queue_size: usize,
}

impl Default for IcmOptions {
    fn default() -> Self {
        Self {
            inbound_queue_size: DEFAULT_QUEUE_SIZE,
            outbound_queue_size: DEFAULT_QUEUE_SIZE,
            connection_queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

impl IcmOptions {
    /// Sets the capacity of the inbound queue.
    pub fn inbound_queue_size(mut self, size: usize) -> Self {
        self.inbound_queue_size = size;
        self
    }

    /// Sets the capacity of the shared outbound queue.
    pub fn outbound_queue_size(mut self, size: usize) -> Self {
        self.outbound_queue_size = size;
        self
    }

    /// Sets the capacity of each outbound connection's write queue.
    pub fn connection_queue_size(mut self, size: usize) -> Self {
        self.connection_queue_size = size;
        self
    }
}

/// An outbound connection to a peer machine.
#[derive(Debug)]
pub(crate) struct Connection {
    /// Distinguishes this connection from later ones to the same address.
    id: u64,
    tx: mpsc::Sender<RouterFrame>,
    cancel: CancellationToken,
}

/// A remote router and the local routers linked to it.
#[derive(Debug)]
pub(crate) struct Remote {
    /// Relay address of the machine hosting the router.
    addr: SocketAddr,
    users: FxHashSet<RouterId>,
}

#[derive(Debug, Default)]
pub(crate) struct Tables {
    /// Remote routers reachable through this relay.
    remotes: FxHashMap<RouterId, Remote>,
    /// Outbound connections, one per peer machine.
    connections: FxHashMap<SocketAddr, Connection>,
    /// `(local router, remote router)` to the queue of the link carrying that traffic.
    locals: FxHashMap<(RouterId, RouterId), mpsc::Sender<Frame>>,
    next_connection_id: u64,
}

/// State shared between the front-end and the relay loops.
#[derive(Debug)]
pub(crate) struct Shared {
    tables: Mutex<Tables>,
    stats: IcmStats,
    options: IcmOptions,
    cancel: CancellationToken,
}

/// Relays frames between machines. Cloning yields another handle to the same relay.
#[derive(Debug, Clone)]
pub struct InterCommunicationManager {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<RouterFrame>,
    local_addr: SocketAddr,
}

impl InterCommunicationManager {
    /// Binds the relay listener and spawns the accept, dispatch and send loops.
    pub async fn bind(addr: impl ToSocketAddrs, options: IcmOptions) -> Result<Self, IcmError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let (outbound, outbound_rx) = mpsc::channel(options.outbound_queue_size);
        let (inbound_tx, inbound_rx) = mpsc::channel(options.inbound_queue_size);

        let shared = Arc::new(Shared {
            tables: Mutex::new(Tables::default()),
            stats: IcmStats::default(),
            options,
            cancel: CancellationToken::new(),
        });

        let span = tracing::info_span!(parent: None, "icm", %local_addr);
        span.in_scope(|| debug!("listening"));

        tokio::spawn(
            driver::accept_loop(listener, inbound_tx, Arc::clone(&shared)).instrument(span.clone()),
        );
        tokio::spawn(
            driver::dispatch_loop(inbound_rx, Arc::clone(&shared)).instrument(span.clone()),
        );
        tokio::spawn(driver::send_loop(outbound_rx, Arc::clone(&shared)).instrument(span));

        Ok(Self { shared, outbound, local_addr })
    }

    /// Returns the address the relay listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the shared outbound queue. Frames whose `to` has no registered connection are
    /// dropped.
    pub fn outbound(&self) -> mpsc::Sender<RouterFrame> {
        self.outbound.clone()
    }

    /// Returns the statistics for this relay.
    pub fn stats(&self) -> &IcmStats {
        &self.shared.stats
    }

    /// Routes frames from `local` addressed to `remote` onto the connection to the relay at
    /// `addr`, opening that connection if none is alive.
    pub async fn add_connection(
        &self,
        local: RouterId,
        remote: RouterId,
        addr: SocketAddr,
    ) -> Result<(), IcmError> {
        if self.shared.cancel.is_cancelled() {
            return Err(IcmError::Stopped);
        }

        let connected = self.shared.tables.lock().connections.contains_key(&addr);
        if !connected {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            self.install_connection(addr, stream);
        }

        debug!(%local, %remote, %addr, "added connection");
        let mut tables = self.shared.tables.lock();
        let entry = tables
            .remotes
            .entry(remote)
            .or_insert_with(|| Remote { addr, users: FxHashSet::default() });
        entry.addr = addr;
        entry.users.insert(local);
        Ok(())
    }

    fn install_connection(&self, addr: SocketAddr, stream: TcpStream) {
        let mut tables = self.shared.tables.lock();
        // Another caller may have connected while we were not holding the lock.
        if tables.connections.contains_key(&addr) {
            return;
        }

        let id = tables.next_connection_id;
        tables.next_connection_id += 1;

        let (tx, rx) = mpsc::channel(self.shared.options.connection_queue_size);
        let cancel = self.shared.cancel.child_token();
        let span = tracing::debug_span!("connection", %addr, id);

        tokio::spawn(
            driver::write_loop(stream, rx, addr, id, cancel.clone(), Arc::clone(&self.shared))
                .instrument(span),
        );
        tables.connections.insert(addr, Connection { id, tx, cancel });
    }

    /// Undoes [`Self::add_connection`] for the `(local, remote)` pair. Frames to `remote` keep
    /// flowing while other local routers are linked to it, and the connection to its machine is
    /// closed once no remote router uses it.
    pub fn remove_connection(&self, local: &RouterId, remote: &RouterId) {
        let mut tables = self.shared.tables.lock();
        let Some(entry) = tables.remotes.get_mut(remote) else {
            return;
        };
        entry.users.remove(local);
        if !entry.users.is_empty() {
            return;
        }

        let addr = entry.addr;
        tables.remotes.remove(remote);
        if !tables.remotes.values().any(|r| r.addr == addr) {
            if let Some(conn) = tables.connections.remove(&addr) {
                debug!(%addr, "closing unused connection");
                conn.cancel.cancel();
            }
        }
    }

    /// Delivers frames received for `local` from `remote` to `tx`.
    pub fn register_local(&self, local: RouterId, remote: RouterId, tx: mpsc::Sender<Frame>) {
        self.shared.tables.lock().locals.insert((local, remote), tx);
    }

    /// Undoes [`Self::register_local`].
    pub fn unregister_local(&self, local: &RouterId, remote: &RouterId) {
        self.shared.tables.lock().locals.remove(&(local.clone(), remote.clone()));
    }

    /// Returns `true` if an outbound connection towards `remote` is alive.
    pub fn is_connected(&self, remote: &RouterId) -> bool {
        let tables = self.shared.tables.lock();
        tables.remotes.get(remote).is_some_and(|r| tables.connections.contains_key(&r.addr))
    }

    /// Stops every relay loop and closes all connections.
    pub fn stop(&self) {
        self.shared.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use futures::SinkExt;
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::FramedWrite;
    use vnet_wire::{router, MacAddr};

    use super::*;

    fn localhost() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn frame(payload: &'static [u8]) -> Frame {
        Frame::new(MacAddr([0xaa; 6]), MacAddr([0xbb; 6]), Bytes::from_static(payload))
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn relay_between_two_machines() {
        let _ = tracing_subscriber::fmt::try_init();
        let a = InterCommunicationManager::bind(localhost(), IcmOptions::default()).await.unwrap();
        let b = InterCommunicationManager::bind(localhost(), IcmOptions::default()).await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        b.register_local("r2".into(), "r1".into(), tx);
        a.add_connection("r1".into(), "r2".into(), b.local_addr()).await.unwrap();
        assert!(a.is_connected(&"r2".to_string()));

        a.outbound()
            .send(RouterFrame::new("r2".into(), "r1".into(), frame(b"across")))
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(received.unwrap().payload(), "across");
        assert_eq!(b.stats().frames_in(), 1);
        eventually(|| a.stats().frames_out() == 1).await;
    }

    #[tokio::test]
    async fn unknown_destinations_are_dropped() {
        let _ = tracing_subscriber::fmt::try_init();
        let a = InterCommunicationManager::bind(localhost(), IcmOptions::default()).await.unwrap();
        let b = InterCommunicationManager::bind(localhost(), IcmOptions::default()).await.unwrap();
        a.add_connection("r1".into(), "r2".into(), b.local_addr()).await.unwrap();

        // No connection for r3 on the sending side
        a.outbound()
            .send(RouterFrame::new("r3".into(), "r1".into(), frame(b"nowhere")))
            .await
            .unwrap();
        eventually(|| a.stats().unroutable() == 1).await;

        // No local router registered on the receiving side
        a.outbound()
            .send(RouterFrame::new("r2".into(), "r1".into(), frame(b"nobody")))
            .await
            .unwrap();
        eventually(|| b.stats().unroutable() == 1).await;
    }

    #[tokio::test]
    async fn decode_error_closes_only_that_connection() {
        let _ = tracing_subscriber::fmt::try_init();
        let b = InterCommunicationManager::bind(localhost(), IcmOptions::default()).await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        b.register_local("r2".into(), "r1".into(), tx);

        let mut garbage = TcpStream::connect(b.local_addr()).await.unwrap();
        garbage.write_all(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x00]).await.unwrap();
        eventually(|| b.stats().decode_errors() == 1).await;

        let stream = TcpStream::connect(b.local_addr()).await.unwrap();
        let mut good = FramedWrite::new(stream, router::Codec::new());
        good.send(RouterFrame::new("r2".into(), "r1".into(), frame(b"still alive")))
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(received.unwrap().payload(), "still alive");
    }

    #[tokio::test]
    async fn remove_connection_closes_unused_connection() {
        let a = InterCommunicationManager::bind(localhost(), IcmOptions::default()).await.unwrap();
        let b = InterCommunicationManager::bind(localhost(), IcmOptions::default()).await.unwrap();

        a.add_connection("r1".into(), "r2".into(), b.local_addr()).await.unwrap();
        a.add_connection("r1".into(), "r3".into(), b.local_addr()).await.unwrap();

        a.remove_connection(&"r1".to_string(), &"r2".to_string());
        assert!(a.is_connected(&"r3".to_string()));

        a.remove_connection(&"r1".to_string(), &"r3".to_string());
        assert!(!a.is_connected(&"r3".to_string()));
        eventually(|| b.stats().active_inbound() == 0).await;
    }

    #[tokio::test]
    async fn remote_shared_by_local_routers_stays_routed() {
        let a = InterCommunicationManager::bind(localhost(), IcmOptions::default()).await.unwrap();
        let b = InterCommunicationManager::bind(localhost(), IcmOptions::default()).await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        b.register_local("r9".into(), "r3".into(), tx);

        a.add_connection("r1".into(), "r9".into(), b.local_addr()).await.unwrap();
        a.add_connection("r3".into(), "r9".into(), b.local_addr()).await.unwrap();

        a.remove_connection(&"r1".to_string(), &"r9".to_string());
        assert!(a.is_connected(&"r9".to_string()));

        a.outbound()
            .send(RouterFrame::new("r9".into(), "r3".into(), frame(b"still routed")))
            .await
            .unwrap();
        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(received.unwrap().payload(), "still routed");

        a.remove_connection(&"r3".to_string(), &"r9".to_string());
        assert!(!a.is_connected(&"r9".to_string()));
    }

    #[tokio::test]
    async fn stopped_relay_rejects_connections() {
        let a = InterCommunicationManager::bind(localhost(), IcmOptions::default()).await.unwrap();
        a.stop();

        let res = a.add_connection("r1".into(), "r2".into(), "127.0.0.1:1".parse().unwrap()).await;
        assert!(matches!(res, Err(IcmError::Stopped)));
    }
}
