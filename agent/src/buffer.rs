//! Gap-free rolling buffer built from two overlapping recording contexts.
//!
//! ```text
//!   ctx n   |==========================|
//!   ctx n+1                      |=====+====================|
//!                                ^     ^
//!                       W - overlap    W: stop n, publish n, n+1 becomes active
//! ```
//!
//! The rotation task owns the schedule.  Both it and the capture path go
//! through one two-slot [`Arena`] lock: the handoff (active ← standby) and
//! the marker emission are therefore mutually exclusive, which is what
//! makes "the context that heard the marker" well defined.
//!
//! Finalized segments are published through a `watch` channel as
//! `Arc<Segment>`; a reader either sees the previous complete segment or
//! the new complete one, never a partial one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::CaptureError;
use crate::source::{CaptureSource, RecordingContext};

/// Extra time allowed for the last context to be finalized on top of one
/// full rotation.
const FINALIZE_GRACE: Duration = Duration::from_secs(5);

/// Pause before rebuilding the rotation after a device failure.
const RESTART_BACKOFF: Duration = Duration::from_secs(1);

/// One finalized clip.
#[derive(Debug)]
pub struct Segment {
    pub seq: u64,
    pub data: Bytes,
    pub started_at: Instant,
    pub stopped_at: Instant,
}

impl Segment {
    pub fn duration(&self) -> Duration {
        self.stopped_at.saturating_duration_since(self.started_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Stopped,
    Filling,
    Ready,
    AwaitingMarkedSegment,
}

#[derive(Debug, Clone, Copy)]
pub struct Timing {
    /// Segment length W.
    pub window: Duration,
    pub overlap: Duration,
}

impl Timing {
    /// Overlap is clamped below half the window.
    pub fn new(window: Duration, overlap: Duration) -> Self {
        Self {
            window,
            overlap: overlap.min(window / 2),
        }
    }

    /// Upper bound on a post-trigger wait: one full rotation plus
    /// finalization.
    pub fn capture_timeout(&self) -> Duration {
        self.window + self.overlap + FINALIZE_GRACE
    }
}

struct Slot<C> {
    seq: u64,
    started_at: Instant,
    ctx: C,
}

/// Active / standby recording contexts.
struct Arena<C> {
    active: Option<Slot<C>>,
    standby: Option<Slot<C>>,
}

impl<C: RecordingContext> Arena<C> {
    fn abort_all(&mut self) {
        for slot in [self.active.take(), self.standby.take()].into_iter().flatten() {
            debug!("aborting context {}", slot.seq);
            slot.ctx.abort();
        }
    }
}

struct Shared<S: CaptureSource> {
    source: S,
    timing: Timing,
    arena: tokio::sync::Mutex<Arena<S::Context>>,
    next_seq: AtomicU64,
    published: watch::Sender<Option<Arc<Segment>>>,
    state: watch::Sender<BufferState>,
    /// `Some(seq)`: stop rotating once `seq` has been published.
    hold: watch::Sender<Option<u64>>,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct RollingBuffer<S: CaptureSource> {
    shared: Arc<Shared<S>>,
    running: Mutex<Option<Running>>,
}

impl<S: CaptureSource> RollingBuffer<S> {
    pub fn new(source: S, timing: Timing) -> Self {
        Self {
            shared: Arc::new(Shared {
                source,
                timing,
                arena: tokio::sync::Mutex::new(Arena {
                    active: None,
                    standby: None,
                }),
                next_seq: AtomicU64::new(0),
                published: watch::Sender::new(None),
                state: watch::Sender::new(BufferState::Stopped),
                hold: watch::Sender::new(None),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn source(&self) -> &S {
        &self.shared.source
    }

    pub fn timing(&self) -> Timing {
        self.shared.timing
    }

    fn running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.running()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Start rotating.  No-op (returns false) if already running.
    pub fn start(&self) -> bool {
        let mut running = self.running();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return false;
        }
        // visible before the rotation task first runs
        self.shared.state.send_replace(BufferState::Filling);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_rotation(Arc::clone(&self.shared), cancel.clone()));
        *running = Some(Running { cancel, handle });
        info!(
            "Rolling buffer started (window={:?}, overlap={:?})",
            self.shared.timing.window, self.shared.timing.overlap
        );
        true
    }

    /// Stop rotating and drop every context.  The last published segment
    /// is discarded.
    pub async fn stop(&self) {
        let running = self.running().take();
        if let Some(Running { cancel, handle }) = running {
            cancel.cancel();
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!("Rotation task panicked: {e}");
                }
            }
        }
        self.shared.hold.send_replace(None);
        self.shared.published.send_replace(None);
        self.shared.state.send_replace(BufferState::Stopped);
    }

    /// Full teardown and fresh start.  Used after an upload failure.
    pub async fn restart(&self) {
        warn!("Restarting rolling buffer");
        self.stop().await;
        self.start();
    }

    /// Most recently finalized segment, if any.
    pub fn latest(&self) -> Option<Arc<Segment>> {
        self.shared.published.borrow().clone()
    }

    pub fn state(&self) -> BufferState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<BufferState> {
        self.shared.state.subscribe()
    }

    /// Emit the marker and wait for the segment that contains it.
    ///
    /// The marker goes into the context currently accumulating data; the
    /// returned segment is that context once finalized, never the segment
    /// that was already published when the trigger arrived.  Rotation
    /// stays paused after that segment until [`Self::release`] is called;
    /// on error the hold is released here.
    pub async fn capture_marked(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<Segment>, CaptureError> {
        if self.latest().is_none() {
            return Err(CaptureError::NotReady);
        }

        let required = {
            let arena = self.shared.arena.lock().await;
            let Some(active) = arena.active.as_ref() else {
                return Err(CaptureError::NotReady);
            };
            let required = active.seq;
            self.shared.hold.send_replace(Some(required));
            // under the arena lock: no handoff can happen mid-marker
            if let Err(e) = self.shared.source.play_marker().await {
                self.release();
                return Err(CaptureError::Source(e));
            }
            required
        };
        self.shared.state.send_replace(BufferState::AwaitingMarkedSegment);
        debug!("Marker emitted into context {required}, waiting for it to finalize");

        let mut segments = self.shared.published.subscribe();
        let timeout = self.shared.timing.capture_timeout();
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(CaptureError::Cancelled),
            waited = tokio::time::timeout(
                timeout,
                segments.wait_for(|p| p.as_ref().is_some_and(|s| s.seq >= required)),
            ) => match waited {
                Err(_) => Err(CaptureError::Timeout),
                Ok(Err(_)) => Err(CaptureError::Cancelled),
                Ok(Ok(published)) => match published.as_ref() {
                    Some(segment) if segment.seq == required => Ok(Arc::clone(segment)),
                    _ => Err(CaptureError::Restarted),
                },
            },
        };

        match &result {
            Ok(segment) => {
                self.shared.state.send_replace(BufferState::Ready);
                info!(
                    "Marked segment {} ready ({} bytes, {:?})",
                    segment.seq,
                    segment.data.len(),
                    segment.duration()
                );
            }
            Err(e) => {
                warn!("Capture wait ended without a segment: {e}");
                self.release();
            }
        }
        result
    }

    /// Resume rotation after the marked segment has been handed off.
    pub fn release(&self) {
        self.shared.hold.send_replace(None);
        self.shared.state.send_modify(|state| {
            if *state == BufferState::AwaitingMarkedSegment {
                *state = BufferState::Ready;
            }
        });
    }
}

impl<S: CaptureSource> Drop for RollingBuffer<S> {
    fn drop(&mut self) {
        if let Some(running) = self.running().take() {
            running.cancel.cancel();
        }
    }
}

// ── rotation task ────────────────────────────────────────────────────────

async fn run_rotation<S: CaptureSource>(shared: Arc<Shared<S>>, cancel: CancellationToken) {
    loop {
        match rotate(&shared, &cancel).await {
            Ok(()) => break,
            Err(e) => {
                error!("Rolling buffer failed: {e:#}; restarting with fresh contexts");
                teardown(&shared).await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RESTART_BACKOFF) => {}
                }
            }
        }
    }
    teardown(&shared).await;
    debug!("Rotation task stopped");
}

/// Drop all contexts and forget the published segment.  Sequence numbers
/// keep counting so a stale waiter can never match a fresh segment.
async fn teardown<S: CaptureSource>(shared: &Shared<S>) {
    shared.arena.lock().await.abort_all();
    shared.published.send_replace(None);
    shared.hold.send_replace(None);
    shared.state.send_replace(BufferState::Filling);
}

async fn start_slot<S: CaptureSource>(shared: &Shared<S>) -> Result<Slot<S::Context>> {
    let seq = shared.next_seq.fetch_add(1, Ordering::Relaxed);
    let ctx = shared.source.start_context(seq).await?;
    Ok(Slot {
        seq,
        started_at: Instant::now(),
        ctx,
    })
}

/// Sleep until `deadline`; false if cancelled first.
async fn sleep_until(deadline: Instant, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep_until(deadline) => true,
    }
}

/// Run rotations until cancelled.  Any device error bubbles up and the
/// caller rebuilds everything.
async fn rotate<S: CaptureSource>(shared: &Shared<S>, cancel: &CancellationToken) -> Result<()> {
    let window = shared.timing.window;
    let overlap = shared.timing.overlap;
    let mut hold = shared.hold.subscribe();

    shared.state.send_replace(BufferState::Filling);
    let first = start_slot(shared).await?;
    let mut active_started = first.started_at;
    shared.arena.lock().await.active = Some(first);

    loop {
        // overlap point
        if !sleep_until(active_started + window - overlap, cancel).await {
            return Ok(());
        }
        let standby = start_slot(shared).await?;
        let standby_started = standby.started_at;
        debug!("context {} started (overlap)", standby.seq);
        shared.arena.lock().await.standby = Some(standby);

        // handoff point; never before the standby has overlapped
        let stop_at = (active_started + window).max(standby_started + overlap);
        if !sleep_until(stop_at, cancel).await {
            return Ok(());
        }
        let finished = {
            let mut arena = shared.arena.lock().await;
            let finished = arena.active.take();
            arena.active = arena.standby.take();
            finished
        };
        let stopped_at = Instant::now();
        active_started = standby_started;

        let Some(finished) = finished else {
            anyhow::bail!("rotation lost its active context");
        };
        let seq = finished.seq;
        let data = finished.ctx.finish().await?;

        let segment = Arc::new(Segment {
            seq,
            data: Bytes::from(data),
            started_at: finished.started_at,
            stopped_at,
        });
        debug!(
            "segment {} finalized ({} bytes, {:?})",
            seq,
            segment.data.len(),
            segment.duration()
        );
        shared.published.send_replace(Some(segment));
        shared.state.send_modify(|state| {
            if *state == BufferState::Filling {
                *state = BufferState::Ready;
            }
        });

        // pause after the marked segment until it has been handed off
        let held = hold.borrow_and_update().is_some_and(|h| seq >= h);
        if held {
            debug!("rotation held after segment {seq}");
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                released = hold.wait_for(|h| h.map_or(true, |h| seq < h)) => {
                    if released.is_err() {
                        return Ok(());
                    }
                }
            }
            debug!("rotation released");
        }
    }
}

// ─── tests ───────────────────────────────────────────────────────────────
