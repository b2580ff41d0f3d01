use std::{
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use futures::{SinkExt, StreamExt};
use tokio::{
    net::{UnixListener, UnixStream},
    sync::mpsc,
};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::{debug, trace, warn, Instrument};
use vnet_wire::{frame, Frame};

/// Statistics for a redirection socket, shared between the driver task and the socket.
#[derive(Debug, Default)]
pub struct RedirectStats {
    /// Frames written to the connected client.
    frames_tx: AtomicUsize,
    /// Frames read from the connected client.
    frames_rx: AtomicUsize,
    /// Frames discarded because no client was connected.
    discarded: AtomicUsize,
    /// Frames read from the client but dropped because the consumer queue was full.
    dropped: AtomicUsize,
    /// Whether a client is currently connected.
    connected: AtomicBool,
}

impl RedirectStats {
    #[inline]
    fn increment_tx(&self) {
        self.frames_tx.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn increment_rx(&self) {
        self.frames_rx.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn increment_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn increment_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Frames written to the client.
    #[inline]
    pub fn frames_tx(&self) -> usize {
        self.frames_tx.load(Ordering::Relaxed)
    }

    /// Frames read from the client.
    #[inline]
    pub fn frames_rx(&self) -> usize {
        self.frames_rx.load(Ordering::Relaxed)
    }

    /// Frames discarded for lack of a client.
    #[inline]
    pub fn discarded(&self) -> usize {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Frames from the client dropped on a full queue.
    #[inline]
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Returns `true` while a client is connected.
    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

/// A Unix domain socket that hands a link's frames to an external program and reads frames back.
///
/// Only one client is served at a time. While no client is connected, frames written to the
/// socket are discarded so that the producing shaper never blocks. When the client goes away, the
/// socket goes back to discarding and waits for the next client.
#[derive(Debug)]
pub struct RedirectionSocket {
    path: PathBuf,
    /// Frames to be written to the connected client.
    to_client: mpsc::Sender<Frame>,
    /// Frames read from the connected client. Lent to whoever consumes them.
    from_client: Option<mpsc::Receiver<Frame>>,
    stats: Arc<RedirectStats>,
    cancel: CancellationToken,
    stopped: bool,
}

impl RedirectionSocket {
    /// Path of the sniffing socket for the given link.
    pub fn sniff_path(dir: &Path, link_id: &str) -> PathBuf {
        dir.join(format!("{link_id}.sniff"))
    }

    /// Path of the intercepting socket for the given link.
    pub fn intercept_path(dir: &Path, link_id: &str) -> PathBuf {
        dir.join(format!("{link_id}.intercept"))
    }

    /// Binds a new socket at `path`, replacing any stale socket file, and spawns its driver.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(path: impl Into<PathBuf>, queue_size: usize) -> io::Result<Self> {
        let path = path.into();

        if path.exists() {
            debug!(?path, "socket file already exists, attempting to remove");
            if let Err(e) = std::fs::remove_file(&path) {
                return Err(io::Error::other(format!(
                    "failed to remove existing socket file, {e:?}"
                )));
            }
        }

        let listener = UnixListener::bind(&path)?;

        let (to_client, to_client_rx) = mpsc::channel(queue_size);
        let (from_client_tx, from_client) = mpsc::channel(queue_size);
        let stats = Arc::new(RedirectStats::default());
        let cancel = CancellationToken::new();

        let driver = RedirectDriver {
            listener,
            to_client: to_client_rx,
            from_client: from_client_tx,
            stats: Arc::clone(&stats),
            cancel: cancel.clone(),
        };
        let span = tracing::debug_span!(parent: None, "redirect", ?path);
        tokio::spawn(driver.run().instrument(span));

        Ok(Self {
            path,
            to_client,
            from_client: Some(from_client),
            stats,
            cancel,
            stopped: false,
        })
    }

    /// Returns the filesystem path the socket is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a sender whose frames are written to the connected client.
    pub fn sender(&self) -> mpsc::Sender<Frame> {
        self.to_client.clone()
    }

    /// Takes the receiver of frames read from the client. Returns `None` if already taken.
    pub fn take_receiver(&mut self) -> Option<mpsc::Receiver<Frame>> {
        self.from_client.take()
    }

    /// Gives back a receiver previously obtained with [`Self::take_receiver`].
    pub fn restore_receiver(&mut self, rx: mpsc::Receiver<Frame>) {
        self.from_client = Some(rx);
    }

    /// Returns the statistics for this socket.
    pub fn stats(&self) -> &RedirectStats {
        &self.stats
    }

    /// Returns `true` once [`Self::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Closes the listener and any connected client, and removes the socket file.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.cancel.cancel();

        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(?e, path = ?self.path, "failed to remove socket file");
            }
        }
    }
}

impl Drop for RedirectionSocket {
    fn drop(&mut self) {
        self.stop();
    }
}

struct RedirectDriver {
    listener: UnixListener,
    to_client: mpsc::Receiver<Frame>,
    from_client: mpsc::Sender<Frame>,
    stats: Arc<RedirectStats>,
    cancel: CancellationToken,
}

impl RedirectDriver {
    async fn run(mut self) {
        loop {
            let Some(stream) = self.wait_for_client().await else {
                return;
            };

            debug!("client connected");
            self.stats.connected.store(true, Ordering::Relaxed);
            let keep_running = self.serve(stream).await;
            self.stats.connected.store(false, Ordering::Relaxed);

            if !keep_running {
                return;
            }
        }
    }

    /// Discards outgoing frames until a client connects. Returns `None` on shutdown.
    async fn wait_for_client(&mut self) -> Option<UnixStream> {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => return Some(stream),
                    Err(e) => warn!(?e, "failed to accept client"),
                },
                frame = self.to_client.recv() => {
                    frame?;
                    trace!("no client connected, discarding frame");
                    self.stats.increment_discarded();
                }
            }
        }
    }

    /// Serves a connected client until it disconnects. Returns `false` on shutdown.
    async fn serve(&mut self, stream: UnixStream) -> bool {
        let mut conn = Framed::new(stream, frame::Codec::new());

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                msg = conn.next() => match msg {
                    Some(Ok(frame)) => {
                        self.stats.increment_rx();
                        if self.from_client.try_send(frame).is_err() {
                            debug!("consumer queue full, dropping frame from client");
                            self.stats.increment_dropped();
                        }
                    }
                    Some(Err(e)) => {
                        warn!(?e, "failed to decode frame from client, closing connection");
                        return true;
                    }
                    None => {
                        debug!("client disconnected");
                        return true;
                    }
                },
                frame = self.to_client.recv() => {
                    let Some(frame) = frame else {
                        return false;
                    };

                    if let Err(e) = conn.send(frame).await {
                        warn!(?e, "failed to write frame to client, closing connection");
                        return true;
                    }
                    self.stats.increment_tx();
                }
            }
        }
    }
}
