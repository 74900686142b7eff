//! Offline replay: drives a recorded stream through ring, detector and controller
//! on a manual clock, one detector frame at a time.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::artifact::RecordingArtifact;
use crate::audio::detect::{EnergySpikeDetector, KnockDetector};
use crate::audio::{AudioFormat, RingStore};
use crate::clock::{ClockSource, ManualClock};
use crate::config::Config;
use crate::knock::KnockEvent;
use crate::metrics::MetricsRegistry;
use crate::session::{ControllerState, SessionController, SessionError};
use crate::sink::ArtifactSink;

#[derive(Debug, Default)]
pub struct ReplaySummary {
    pub artifacts: Vec<RecordingArtifact>,
    pub knocks: usize,
    pub rejected: usize,
    pub sink_failures: usize,
    pub samples: u64,
}

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    /// Wall time of the first sample.
    pub start: DateTime<Utc>,
    /// Audio handed to ring and detector per step. Defaults to the detector frame.
    pub chunk_ms: Option<u32>,
    /// Drop a session still open at end of input instead of finalizing it.
    pub discard_open: bool,
}

impl ReplayOptions {
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            start,
            chunk_ms: None,
            discard_open: false,
        }
    }
}

/// Replay `samples` (interleaved, in `format`) as if captured live.
pub fn replay(
    samples: &[i16],
    format: AudioFormat,
    config: &Config,
    sink: Arc<dyn ArtifactSink>,
    metrics: Arc<MetricsRegistry>,
    options: &ReplayOptions,
) -> ReplaySummary {
    let ring = Arc::new(RingStore::new(format, config.ring.capacity_secs));
    let clock = Arc::new(ManualClock::new(options.start));
    let controller = SessionController::new(
        Arc::clone(&ring),
        clock.clone(),
        sink,
        metrics,
        config.session.clone(),
    );
    let mut detector = EnergySpikeDetector::new(config.detector.clone());
    let mut summary = ReplaySummary::default();

    let chunk_ms = options.chunk_ms.unwrap_or(config.detector.frame_ms);
    let frame_len =
        (format.samples_for(chunk_ms as f64 / 1000.0) as usize).max(format.channels as usize);
    info!(
        samples = samples.len(),
        frame_len,
        sample_rate = format.sample_rate,
        "replay started"
    );

    for frame in samples.chunks(frame_len) {
        summary.samples = ring.write(frame);
        let frame_secs = format.secs_for(frame.len() as u64);
        clock.advance(Duration::microseconds((frame_secs * 1_000_000.0).round() as i64));

        if let Some(event) = detector.process(frame, clock.now()) {
            deliver(&controller, event, &mut summary);
        }
        collect(controller.tick(), &mut summary);
    }

    if let Some(event) = detector.flush() {
        deliver(&controller, event, &mut summary);
    }
    if controller.state() == ControllerState::Recording {
        if options.discard_open {
            if let Err(e) = controller.discard() {
                warn!(error = %e, "discard at end of input failed");
            }
        } else {
            collect(controller.finalize().map(Some), &mut summary);
        }
    }

    info!(
        artifacts = summary.artifacts.len(),
        knocks = summary.knocks,
        rejected = summary.rejected,
        "replay finished"
    );
    summary
}

fn deliver(controller: &SessionController, event: KnockEvent, summary: &mut ReplaySummary) {
    match controller.on_knock(event) {
        Ok(()) => summary.knocks += 1,
        Err(_) => summary.rejected += 1,
    }
}

fn collect(
    result: Result<Option<RecordingArtifact>, SessionError>,
    summary: &mut ReplaySummary,
) {
    match result {
        Ok(Some(artifact)) => summary.artifacts.push(artifact),
        Ok(None) => {}
        Err(e) => {
            warn!(error = %e, "replay finalize failed");
            summary.sink_failures += 1;
        }
    }
}
