use std::sync::Arc;

use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, Instrument};
use vnet_wire::Frame;

use crate::{Error, LinkStats};

/// Drains and discards everything sent on its incoming channel, so that producers on an endpoint
/// without a peer never block.
#[derive(Debug)]
pub struct NullShaper {
    incoming: Option<mpsc::Receiver<Frame>>,
    stats: Arc<LinkStats>,
    running: Option<(CancellationToken, JoinHandle<mpsc::Receiver<Frame>>)>,
}

impl NullShaper {
    /// Creates a stopped shaper that will drain `incoming`.
    pub fn new(incoming: mpsc::Receiver<Frame>) -> Self {
        Self { incoming: Some(incoming), stats: Arc::default(), running: None }
    }

    /// A null shaper without an incoming channel. Starting it does nothing.
    pub fn detached() -> Self {
        Self { incoming: None, stats: Arc::default(), running: None }
    }

    /// Counters shared with the link.
    pub fn stats(&self) -> &Arc<LinkStats> {
        &self.stats
    }

    /// Returns `true` if the drain task is running.
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Spawns the drain task.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.running.is_some() {
            return Ok(());
        }
        let Some(mut incoming) = self.incoming.take() else {
            trace!("detached null shaper, nothing to drain");
            return Ok(());
        };

        let cancel = CancellationToken::new();
        let stats = Arc::clone(&self.stats);
        let token = cancel.clone();
        let span = tracing::debug_span!("shaper", kind = "null");
        let task = tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        frame = incoming.recv() => match frame {
                            Some(_) => {
                                stats.increment_rx();
                                stats.increment_discarded();
                            }
                            None => {
                                debug!("incoming channel closed");
                                break;
                            }
                        }
                    }
                }
                incoming
            }
            .instrument(span),
        );

        self.running = Some((cancel, task));
        Ok(())
    }

    /// Stops the drain task and takes back the incoming channel.
    pub async fn stop(&mut self) -> Result<(), Error> {
        let Some((cancel, task)) = self.running.take() else {
            return Ok(());
        };

        cancel.cancel();
        self.incoming = Some(task.await?);
        Ok(())
    }

    pub(super) fn into_incoming(mut self) -> Option<mpsc::Receiver<Frame>> {
        self.incoming.take()
    }
}

impl Drop for NullShaper {
    fn drop(&mut self) {
        if let Some((cancel, _)) = &self.running {
            cancel.cancel();
        }
    }
}
