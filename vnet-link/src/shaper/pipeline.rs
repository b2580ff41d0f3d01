use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use vnet_common::{Delay, RouterId};
use vnet_wire::{Frame, RouterFrame};

use crate::{bucket::TokenBucket, LinkProps, LinkStats};

/// What the receive loop does with frames besides queueing them.
#[derive(Debug, Clone)]
pub(crate) enum Mode {
    /// Queue admitted frames.
    Forward,
    /// Copy admitted frames to a sniffing socket, then queue them.
    Mirror(mpsc::Sender<Frame>),
    /// Hand incoming frames to an intercepting socket. Frames coming back from the socket are
    /// admitted and queued.
    Redirect(mpsc::Sender<Frame>),
}

/// Where the send loop delivers frames once they are due.
#[derive(Debug, Clone)]
pub(crate) enum Egress {
    Local(mpsc::Sender<Frame>),
    Remote { to: RouterId, from: RouterId, outbound: mpsc::Sender<RouterFrame> },
}

impl Egress {
    fn push(&self, frame: Frame, stats: &LinkStats) {
        let size = frame.size() as usize;
        let result = match self {
            Self::Local(tx) => tx.try_send(frame).map_err(|e| matches!(e, TrySendError::Full(_))),
            Self::Remote { to, from, outbound } => outbound
                .try_send(RouterFrame::new(to.clone(), from.clone(), frame))
                .map_err(|e| matches!(e, TrySendError::Full(_))),
        };

        match result {
            Ok(()) => stats.increment_tx(size),
            Err(full) => {
                if full {
                    debug!("egress full, dropping frame");
                } else {
                    trace!("egress closed, dropping frame");
                }
                stats.increment_dropped_egress_full();
            }
        }
    }

    /// Pushes the frame now if it is due, or from a timer task otherwise.
    fn deliver(&self, frame: Frame, stats: &Arc<LinkStats>) {
        let at = frame.scheduled_time;
        if at <= Instant::now() {
            self.push(frame, stats);
            return;
        }

        let egress = self.clone();
        let stats = Arc::clone(stats);
        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            egress.push(frame, &stats);
        });
    }
}

/// Applies latency, jitter and loss to frames entering a shaper.
#[derive(Debug, Clone)]
pub(crate) struct Admission {
    pub(crate) props: LinkProps,
    pub(crate) delay: Delay,
    pub(crate) stats: Arc<LinkStats>,
}

impl Admission {
    /// Schedules the frame, or returns `None` if it was lost.
    fn admit(&self, mut frame: Frame) -> Option<Frame> {
        let now = Instant::now();

        if self.props.is_transparent() {
            frame.scheduled_time = now;
            return Some(frame);
        }

        let mut rng = rand::thread_rng();
        if self.props.drop_rate > 0.0 && rng.gen_bool(self.props.drop_rate) {
            trace!("dropping frame");
            self.stats.increment_dropped_loss();
            return None;
        }

        let mut delay = self.props.latency;
        if !self.props.jitter.is_zero() {
            delay += rng.gen_range(std::time::Duration::ZERO..=self.props.jitter);
        }
        delay = delay.saturating_sub(self.delay.get());

        frame.scheduled_time = now + delay;
        Some(frame)
    }
}

/// What the receive loop gives back when it stops.
#[derive(Debug)]
pub(crate) struct ReceiveParts {
    pub(crate) incoming: mpsc::Receiver<Frame>,
    pub(crate) tap: Option<mpsc::Receiver<Frame>>,
}

fn enqueue(queue: &mpsc::Sender<Frame>, frame: Frame, stats: &LinkStats) {
    if queue.try_send(frame).is_err() {
        debug!("shaper queue full, dropping frame");
        stats.increment_dropped_queue_full();
    }
}

/// Receives from the tap if there is one, pends forever otherwise.
async fn recv_tap(tap: &mut Option<mpsc::Receiver<Frame>>) -> Option<Frame> {
    match tap {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Admits frames from the incoming channel (and from the socket tap, if any) into the queue.
pub(crate) async fn receive_loop(
    mut incoming: mpsc::Receiver<Frame>,
    mut tap: Option<mpsc::Receiver<Frame>>,
    mode: Mode,
    admission: Admission,
    queue: mpsc::Sender<Frame>,
    cancel: CancellationToken,
) -> ReceiveParts {
    let stats = &admission.stats;
    // A closed tap stays with us so it can be handed back, but is no longer polled.
    let mut tap_open = tap.is_some();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = incoming.recv() => {
                let Some(frame) = frame else {
                    debug!("incoming channel closed");
                    break;
                };
                stats.increment_rx();

                match &mode {
                    Mode::Forward => {
                        if let Some(frame) = admission.admit(frame) {
                            enqueue(&queue, frame, stats);
                        }
                    }
                    Mode::Mirror(socket) => {
                        if let Some(frame) = admission.admit(frame) {
                            if socket.try_send(frame.clone()).is_ok() {
                                stats.increment_mirrored();
                            } else {
                                trace!("sniffing socket full, skipping copy");
                                stats.increment_dropped_mirror();
                            }
                            enqueue(&queue, frame, stats);
                        }
                    }
                    Mode::Redirect(socket) => {
                        if socket.try_send(frame).is_ok() {
                            stats.increment_intercepted();
                        } else {
                            debug!("intercepting socket full, dropping frame");
                            stats.increment_dropped_queue_full();
                        }
                    }
                }
            }
            frame = recv_tap(&mut tap), if tap_open => {
                let Some(frame) = frame else {
                    tap_open = false;
                    continue;
                };

                match &mode {
                    Mode::Redirect(_) => {
                        if let Some(frame) = admission.admit(frame) {
                            enqueue(&queue, frame, stats);
                        }
                    }
                    _ => {
                        trace!("discarding frame from sniffing socket");
                        stats.increment_discarded();
                    }
                }
            }
        }
    }

    ReceiveParts { incoming, tap }
}

/// Applies the bandwidth limit to queued frames and delivers them when due.
pub(crate) async fn send_loop(
    mut queue: mpsc::Receiver<Frame>,
    bucket: Arc<Mutex<Option<TokenBucket>>>,
    egress: Egress,
    stats: Arc<LinkStats>,
    cancel: CancellationToken,
) -> mpsc::Receiver<Frame> {
    loop {
        let mut frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        if let Some(bucket) = bucket.lock().as_mut() {
            let wait = bucket.reserve(frame.size(), Instant::now());
            frame.scheduled_time += wait;
        }

        egress.deliver(frame, &stats);
    }

    queue
}
