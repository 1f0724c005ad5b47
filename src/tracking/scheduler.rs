//! Measurement scheduling.
//!
//! [`MeasurementClock`] decides when the next measurement is due.
//! [`MeasurementWorker`] runs measurement updates on a background thread so
//! the VIO-rate path never waits on feature extraction or PnP. Only one
//! request is in flight at a time; requests submitted while the worker is
//! busy are dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use image::GrayImage;
use tracing::{debug, info, warn};

use crate::frame::Frame;

use super::filtered_tracker::FilteredTracker;
use super::result::MeasurementResult;

const RECV_TIMEOUT: Duration = Duration::from_millis(50);

/// Fixed-interval gate for measurement updates.
#[derive(Debug, Clone)]
pub struct MeasurementClock {
    interval: Duration,
    last: Option<Instant>,
}

impl MeasurementClock {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    /// Negative or NaN intervals mean "always due"; intervals too large for
    /// a `Duration` mean "due once".
    pub fn from_secs(interval_s: f64) -> Self {
        let interval = Duration::try_from_secs_f64(interval_s.max(0.0)).unwrap_or(Duration::MAX);
        Self::new(interval)
    }

    /// Whether a measurement is due at `now`, without claiming it.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        }
    }

    /// Claim the slot at `now` if due.
    pub fn try_claim(&mut self, now: Instant) -> bool {
        if self.is_due(now) {
            self.last = Some(now);
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// One queued measurement.
pub struct MeasurementRequest {
    pub image: GrayImage,
    pub frame: Frame,
    pub query_x: f64,
    pub query_z: f64,
    pub query_diameter: f64,
}

/// Background thread running [`FilteredTracker::measurement_update`].
pub struct MeasurementWorker {
    sender: Option<Sender<MeasurementRequest>>,
    results: Receiver<MeasurementResult>,
    busy: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MeasurementWorker {
    pub fn spawn(tracker: Arc<FilteredTracker>) -> Self {
        let (sender, receiver) = bounded::<MeasurementRequest>(1);
        let (result_sender, results) = unbounded::<MeasurementResult>();
        let busy = Arc::new(AtomicBool::new(false));

        let worker_busy = Arc::clone(&busy);
        let handle = thread::spawn(move || {
            run(tracker, receiver, result_sender, worker_busy);
        });

        Self {
            sender: Some(sender),
            results,
            busy,
            handle: Some(handle),
        }
    }

    /// Queue a measurement. Returns `false` (and drops the request) when one
    /// is already queued or running.
    pub fn submit(&self, request: MeasurementRequest) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };
        if self.busy.swap(true, Ordering::AcqRel) {
            return false;
        }
        match sender.try_send(request) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.busy.store(false, Ordering::Release);
                false
            }
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Drain finished measurements without blocking.
    pub fn poll_results(&self) -> Vec<MeasurementResult> {
        self.results.try_iter().collect()
    }

    /// Block until the next result arrives or `timeout` passes.
    pub fn wait_result(&self, timeout: Duration) -> Option<MeasurementResult> {
        self.results.recv_timeout(timeout).ok()
    }

    /// Close the queue and wait for the thread to finish.
    pub fn shutdown(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("[MeasurementWorker] worker thread panicked");
            }
        }
    }
}

impl Drop for MeasurementWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    tracker: Arc<FilteredTracker>,
    receiver: Receiver<MeasurementRequest>,
    results: Sender<MeasurementResult>,
    busy: Arc<AtomicBool>,
) {
    debug!("[MeasurementWorker] started");
    loop {
        match receiver.recv_timeout(RECV_TIMEOUT) {
            Ok(request) => {
                let result = tracker.measurement_update(
                    &request.image,
                    &request.frame,
                    request.query_x,
                    request.query_z,
                    request.query_diameter,
                );
                busy.store(false, Ordering::Release);
                // Nobody listening is fine.
                let _ = results.send(result);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!("[MeasurementWorker] stopped");
}
