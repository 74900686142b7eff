//! Session controller: Idle → Recording → (finalize | discard) → Idle.
//! Turns knock events into bounded recordings cut from the sample ring.
//! The session lock covers state transitions only; the ring copy and the sink
//! call run after it is released.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artifact::{PartialWindow, RecordingArtifact, RecordingSession};
use crate::audio::RingStore;
use crate::clock::ClockSource;
use crate::knock::KnockEvent;
use crate::metrics::{Metric, MetricsRegistry};
use crate::sink::{ArtifactSink, SinkError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ControllerState {
    Idle,
    Recording,
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerState::Idle => write!(f, "Idle"),
            ControllerState::Recording => write!(f, "Recording"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid knock event: {0}")]
    InvalidEvent(String),
    #[error("no active recording session")]
    NoActiveSession,
    #[error("sink failed for artifact {id}: {source}")]
    Sink {
        id: Uuid,
        #[source]
        source: SinkError,
    },
}

/// Recording policy. All durations in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionPolicy {
    /// History kept before the first knock.
    pub pre_roll_secs: f64,
    /// Session length from its start (pre-roll included).
    pub max_duration_secs: f64,
    /// Each later knock keeps the session open at least this long after it. 0 disables.
    pub knock_extension_secs: f64,
    /// Hard cap on the session length, extensions included.
    pub duration_ceiling_secs: f64,
    /// How often a driver should call [`SessionController::tick`].
    pub tick_interval_ms: u64,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            pre_roll_secs: 5.0,
            max_duration_secs: 30.0,
            knock_extension_secs: 0.0,
            duration_ceiling_secs: 120.0,
            tick_interval_ms: 250,
        }
    }
}

fn secs(d: f64) -> Duration {
    Duration::microseconds((d * 1_000_000.0).round() as i64)
}

fn as_secs(d: Duration) -> f64 {
    d.num_microseconds().unwrap_or(i64::MAX) as f64 / 1_000_000.0
}

fn log_transition(from: ControllerState, to: ControllerState) {
    info!(from = %from, to = %to, "state_transition");
}

/// Owns zero or one open [`RecordingSession`] and finalizes it into artifacts.
pub struct SessionController {
    ring: Arc<RingStore>,
    clock: Arc<dyn ClockSource>,
    sink: Arc<dyn ArtifactSink>,
    metrics: Arc<MetricsRegistry>,
    policy: SessionPolicy,
    session: Mutex<Option<RecordingSession>>,
    state_tx: watch::Sender<ControllerState>,
    state_rx: watch::Receiver<ControllerState>,
}

impl SessionController {
    pub fn new(
        ring: Arc<RingStore>,
        clock: Arc<dyn ClockSource>,
        sink: Arc<dyn ArtifactSink>,
        metrics: Arc<MetricsRegistry>,
        policy: SessionPolicy,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ControllerState::Idle);
        Self {
            ring,
            clock,
            sink,
            metrics,
            policy,
            session: Mutex::new(None),
            state_tx,
            state_rx,
        }
    }

    pub fn state(&self) -> ControllerState {
        if self.session.lock().is_some() {
            ControllerState::Recording
        } else {
            ControllerState::Idle
        }
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<ControllerState> {
        self.state_rx.clone()
    }

    /// Snapshot of the open session, if any.
    pub fn active_session(&self) -> Option<RecordingSession> {
        self.session.lock().clone()
    }

    /// Take the open session when `due` holds. Idle is sent before the lock is
    /// released so subscribers never lag behind [`state`](Self::state).
    fn take_if(&self, due: impl FnOnce(&RecordingSession) -> bool) -> Option<RecordingSession> {
        let mut guard = self.session.lock();
        if !guard.as_ref().is_some_and(due) {
            return None;
        }
        let session = guard.take();
        self.state_tx.send_replace(ControllerState::Idle);
        drop(guard);
        log_transition(ControllerState::Recording, ControllerState::Idle);
        session
    }

    /// Feed a detected knock. Opens a session when idle, otherwise joins the open one.
    pub fn on_knock(&self, event: KnockEvent) -> Result<(), SessionError> {
        if let Err(reason) = event.validate() {
            warn!(%reason, "knock rejected");
            return Err(SessionError::InvalidEvent(reason));
        }

        let mut guard = self.session.lock();
        if let Some(session) = guard.as_mut() {
            self.extend(session, &event);
            session.events.push(event);
            debug!(
                session_id = %session.session_id,
                knocks = session.events.len(),
                "knock_appended"
            );
            return Ok(());
        }

        let session = self.open(event);
        let (session_id, start, max_duration) = (
            session.session_id,
            session.start_timestamp,
            session.max_duration,
        );
        *guard = Some(session);
        self.state_tx.send_replace(ControllerState::Recording);
        drop(guard);

        log_transition(ControllerState::Idle, ControllerState::Recording);
        info!(
            session_id = %session_id,
            start = %start,
            max_duration_secs = as_secs(max_duration),
            "session_opened"
        );
        Ok(())
    }

    fn open(&self, event: KnockEvent) -> RecordingSession {
        let format = self.ring.format();
        let total = self.ring.total_written();
        let oldest = total.saturating_sub(self.ring.capacity_samples() as u64);

        // "Now" is the newest sample; step back by the detector's reporting lag.
        let lag = (self.clock.now() - event.timestamp).max(Duration::zero());
        let anchor_pos = total
            .saturating_sub(format.samples_for(as_secs(lag)))
            .max(oldest);

        let requested_pre_roll = format.samples_for(self.policy.pre_roll_secs);
        let start_pos = anchor_pos.saturating_sub(requested_pre_roll).max(oldest);
        let pre_roll = secs(format.secs_for(anchor_pos - start_pos));
        if anchor_pos - start_pos < requested_pre_roll {
            debug!(
                requested_secs = self.policy.pre_roll_secs,
                available_secs = as_secs(pre_roll),
                "pre_roll_clamped"
            );
        }

        RecordingSession {
            session_id: Uuid::new_v4(),
            start_timestamp: event.timestamp - pre_roll,
            max_duration: secs(self.policy.max_duration_secs),
            events: vec![event],
            finalized: false,
            start_pos,
            anchor_pos,
            requested_pre_roll,
        }
    }

    /// Push the session end out for a late knock, bounded by the ceiling.
    fn extend(&self, session: &mut RecordingSession, event: &KnockEvent) {
        if self.policy.knock_extension_secs <= 0.0 {
            return;
        }
        let ceiling = secs(self.policy.duration_ceiling_secs);
        let offset = event.timestamp - session.start_timestamp;
        if offset > ceiling {
            return;
        }
        let wanted = (offset + secs(self.policy.knock_extension_secs)).min(ceiling);
        if wanted > session.max_duration {
            debug!(
                session_id = %session.session_id,
                from_secs = as_secs(session.max_duration),
                to_secs = as_secs(wanted),
                "session_extended"
            );
            session.max_duration = wanted;
        }
    }

    /// Finalize the open session once it has run for its full duration.
    /// Returns the artifact if this call finalized one.
    pub fn tick(&self) -> Result<Option<RecordingArtifact>, SessionError> {
        let now = self.clock.now();
        match self.take_if(|s| now - s.start_timestamp >= s.max_duration) {
            Some(session) => self.complete(session, now).map(Some),
            None => Ok(None),
        }
    }

    /// Close the open session now and hand its recording to the sink.
    pub fn finalize(&self) -> Result<RecordingArtifact, SessionError> {
        let session = self.take_if(|_| true).ok_or(SessionError::NoActiveSession)?;
        self.complete(session, self.clock.now())
    }

    /// Abandon the open session without producing an artifact.
    pub fn discard(&self) -> Result<(), SessionError> {
        let session = self.take_if(|_| true).ok_or(SessionError::NoActiveSession)?;
        info!(
            session_id = %session.session_id,
            knocks = session.events.len(),
            "session_discarded"
        );
        Ok(())
    }

    fn complete(
        &self,
        mut session: RecordingSession,
        now: DateTime<Utc>,
    ) -> Result<RecordingArtifact, SessionError> {
        session.finalized = true;
        let started = Instant::now();

        let format = self.ring.format();
        let end_pos = session.start_pos + format.samples_for(as_secs(session.max_duration));
        let window = self.metrics.time(Metric::RingReadUs, || {
            self.ring.read_window(session.start_pos, end_pos)
        });

        let delivered_end = window.start_pos + window.samples.len() as u64;
        let requested = delivered_end.saturating_sub(session.anchor_pos) + session.requested_pre_roll;
        let delivered = window.samples.len() as u64;
        self.metrics
            .record_window(format.secs_for(delivered), format.secs_for(requested));
        let partial_window = (delivered < requested).then(|| PartialWindow {
            requested_secs: format.secs_for(requested),
            delivered_secs: format.secs_for(delivered),
        });
        if let Some(p) = &partial_window {
            warn!(
                session_id = %session.session_id,
                requested_secs = p.requested_secs,
                delivered_secs = p.delivered_secs,
                "partial_window"
            );
        }

        let artifact = RecordingArtifact {
            id: session.session_id,
            created_at: now,
            duration_secs: format.secs_for(delivered),
            pre_roll_secs: format.secs_for(session.anchor_pos.saturating_sub(window.start_pos)),
            sample_rate: format.sample_rate,
            channels: format.channels,
            bit_depth: format.bit_depth,
            detected_knocks: session.events,
            partial_window,
        };
        info!(
            id = %artifact.id,
            duration_secs = artifact.duration_secs,
            knocks = artifact.detected_knocks.len(),
            "session_finalized"
        );

        let result = self.metrics.time(Metric::PersistUs, || {
            self.sink.persist(artifact.clone(), window.samples)
        });
        self.metrics
            .record(Metric::FinalizeUs, started.elapsed().as_secs_f64() * 1e6);

        match result {
            Ok(()) => Ok(artifact),
            Err(source) => {
                error!(id = %artifact.id, error = %source, "artifact persist failed");
                Err(SessionError::Sink {
                    id: artifact.id,
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFormat;
    use crate::clock::ManualClock;
    use crate::knock::KnockKind;
    use crate::sink::MemorySink;

    struct Rig {
        ring: Arc<RingStore>,
        clock: Arc<ManualClock>,
        sink: Arc<MemorySink>,
        ctl: SessionController,
    }

    /// 8 Hz mono ring of `capacity` seconds, producer and clock driven by `feed`.
    fn rig(capacity: u32, policy: SessionPolicy) -> Rig {
        let ring = Arc::new(RingStore::new(AudioFormat::mono16(8), capacity));
        let clock = Arc::new(ManualClock::new(
            DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        ));
        let sink = Arc::new(MemorySink::new());
        let ctl = SessionController::new(
            Arc::clone(&ring),
            clock.clone(),
            sink.clone(),
            Arc::new(MetricsRegistry::new()),
            policy,
        );
        Rig {
            ring,
            clock,
            sink,
            ctl,
        }
    }

    impl Rig {
        /// Write `n_secs` of audio (values continue from the total written) and advance the clock.
        fn feed(&self, n_secs: u32) {
            let base = self.ring.total_written() as i16;
            let data: Vec<i16> = (0..n_secs as i16 * 8).map(|i| base + i + 1).collect();
            self.ring.write(&data);
            self.clock.advance(Duration::seconds(n_secs as i64));
        }

        fn knock(&self, confidence: f32) -> KnockEvent {
            KnockEvent::new(self.clock.now(), confidence, KnockKind::Single)
        }
    }

    fn policy(pre_roll: f64, max: f64) -> SessionPolicy {
        SessionPolicy {
            pre_roll_secs: pre_roll,
            max_duration_secs: max,
            ..SessionPolicy::default()
        }
    }

    #[test]
    fn invalid_confidence_leaves_idle() {
        let r = rig(10, policy(2.0, 4.0));
        r.feed(3);
        let err = r.ctl.on_knock(r.knock(1.5)).unwrap_err();
        assert!(matches!(err, SessionError::InvalidEvent(_)));
        assert_eq!(r.ctl.state(), ControllerState::Idle);
        assert!(r.ctl.active_session().is_none());
    }

    #[test]
    fn first_knock_opens_with_pre_roll() {
        let r = rig(10, policy(2.0, 4.0));
        r.feed(3);
        let ev = r.knock(0.9);
        r.ctl.on_knock(ev.clone()).unwrap();

        assert_eq!(r.ctl.state(), ControllerState::Recording);
        let s = r.ctl.active_session().unwrap();
        assert_eq!(s.start_timestamp, ev.timestamp - Duration::seconds(2));
        assert_eq!(s.events, vec![ev]);
        assert!(!s.finalized);
        assert_eq!(*r.ctl.subscribe().borrow(), ControllerState::Recording);
    }

    #[test]
    fn pre_roll_clamped_to_available_history() {
        let r = rig(10, policy(5.0, 8.0));
        r.feed(1);
        let ev = r.knock(0.9);
        r.ctl.on_knock(ev.clone()).unwrap();
        let s = r.ctl.active_session().unwrap();
        assert_eq!(s.start_timestamp, ev.timestamp - Duration::seconds(1));

        r.feed(7);
        let art = r.ctl.tick().unwrap().expect("session due");
        assert_eq!(art.pre_roll_secs, 1.0);
        let p = art.partial_window.expect("pre-roll short of policy");
        assert_eq!(p.delivered_secs, 8.0);
        assert_eq!(p.requested_secs, 12.0);
    }

    #[test]
    fn tick_finalizes_after_max_duration() {
        let r = rig(10, policy(2.0, 4.0));
        r.feed(3);
        r.ctl.on_knock(r.knock(0.8)).unwrap();

        r.feed(1);
        assert!(r.ctl.tick().unwrap().is_none());
        r.feed(1);
        let art = r.ctl.tick().unwrap().expect("4 s elapsed since start");
        assert_eq!(r.ctl.state(), ControllerState::Idle);
        assert_eq!(art.duration_secs, 4.0);
        assert_eq!(art.pre_roll_secs, 2.0);
        assert!(art.partial_window.is_none());

        let stored = r.sink.take();
        assert_eq!(stored.len(), 1);
        // window = seconds 1..5 of the stream → values 9..=40
        assert_eq!(stored[0].1, (9..=40).collect::<Vec<i16>>());
        assert_eq!(stored[0].0, art);
    }

    #[test]
    fn later_knocks_join_the_session_in_order() {
        let r = rig(20, policy(1.0, 6.0));
        r.feed(2);
        let first = r.knock(0.6);
        r.ctl.on_knock(first.clone()).unwrap();
        let start = r.ctl.active_session().unwrap().start_timestamp;

        r.feed(1);
        let second = KnockEvent::new(r.clock.now(), 0.7, KnockKind::Double);
        r.ctl.on_knock(second.clone()).unwrap();
        r.feed(1);
        let third = r.knock(0.95);
        r.ctl.on_knock(third.clone()).unwrap();

        assert_eq!(r.ctl.active_session().unwrap().start_timestamp, start);
        let art = r.ctl.finalize().unwrap();
        assert_eq!(art.detected_knocks, vec![first, second, third]);
    }

    #[test]
    fn early_finalize_takes_what_was_written() {
        let r = rig(10, policy(2.0, 6.0));
        r.feed(4);
        r.ctl.on_knock(r.knock(0.9)).unwrap();
        r.feed(1);
        let art = r.ctl.finalize().unwrap();
        assert_eq!(art.duration_secs, 3.0);
        assert!(art.partial_window.is_none());
        assert_eq!(r.sink.take()[0].1, (17..=40).collect::<Vec<i16>>());
    }

    #[test]
    fn overwritten_history_gives_partial_window() {
        let r = rig(3, policy(2.0, 6.0));
        r.feed(3);
        r.ctl.on_knock(r.knock(0.9)).unwrap();
        r.feed(4);
        let art = r.ctl.tick().unwrap().expect("due");
        // session covered stream seconds 1..7 but only 4..7 survive
        assert_eq!(art.duration_secs, 3.0);
        assert_eq!(art.pre_roll_secs, 0.0);
        let p = art.partial_window.unwrap();
        assert_eq!(p.requested_secs, 6.0);
        assert_eq!(p.delivered_secs, 3.0);
        assert_eq!(r.sink.take()[0].1, (33..=56).collect::<Vec<i16>>());
    }

    #[test]
    fn detector_lag_moves_the_anchor_back() {
        let r = rig(10, policy(1.0, 3.0));
        r.feed(4);
        // knock happened one second before it was reported
        let ev = KnockEvent::new(r.clock.now() - Duration::seconds(1), 0.9, KnockKind::Single);
        r.ctl.on_knock(ev).unwrap();
        r.feed(1);
        let art = r.ctl.tick().unwrap().expect("due");
        // window = stream seconds 2..5
        assert_eq!(r.sink.take()[0].1, (17..=40).collect::<Vec<i16>>());
        assert_eq!(art.pre_roll_secs, 1.0);
    }

    #[test]
    fn extension_is_bounded_by_ceiling() {
        let r = rig(
            30,
            SessionPolicy {
                pre_roll_secs: 1.0,
                max_duration_secs: 4.0,
                knock_extension_secs: 3.0,
                duration_ceiling_secs: 6.0,
                tick_interval_ms: 250,
            },
        );
        r.feed(2);
        r.ctl.on_knock(r.knock(0.9)).unwrap();
        r.feed(2);
        // offset 3 s + 3 s extension = 6 s, at the ceiling
        r.ctl.on_knock(r.knock(0.9)).unwrap();
        assert_eq!(r.ctl.active_session().unwrap().max_duration, Duration::seconds(6));
        r.feed(1);
        // offset 4 s + 3 s would be 7 s, capped at 6
        r.ctl.on_knock(r.knock(0.9)).unwrap();
        assert_eq!(r.ctl.active_session().unwrap().max_duration, Duration::seconds(6));

        r.feed(1);
        assert!(r.ctl.tick().unwrap().is_none());
        r.feed(1);
        let art = r.ctl.tick().unwrap().expect("ceiling reached");
        assert_eq!(art.duration_secs, 6.0);
        assert_eq!(art.detected_knocks.len(), 3);
    }

    #[test]
    fn no_extension_by_default() {
        let r = rig(30, policy(1.0, 4.0));
        r.feed(2);
        r.ctl.on_knock(r.knock(0.9)).unwrap();
        r.feed(2);
        r.ctl.on_knock(r.knock(0.9)).unwrap();
        assert_eq!(r.ctl.active_session().unwrap().max_duration, Duration::seconds(4));
    }

    #[test]
    fn finalize_and_discard_need_a_session() {
        let r = rig(10, policy(1.0, 4.0));
        assert!(matches!(r.ctl.finalize(), Err(SessionError::NoActiveSession)));
        assert!(matches!(r.ctl.discard(), Err(SessionError::NoActiveSession)));
        assert!(r.ctl.tick().unwrap().is_none());
    }

    #[test]
    fn discard_produces_nothing() {
        let r = rig(10, policy(1.0, 4.0));
        r.feed(2);
        r.ctl.on_knock(r.knock(0.9)).unwrap();
        r.ctl.discard().unwrap();
        assert_eq!(r.ctl.state(), ControllerState::Idle);
        assert!(r.sink.is_empty());
        assert_eq!(*r.ctl.subscribe().borrow(), ControllerState::Idle);
    }

    struct FailingSink;

    impl ArtifactSink for FailingSink {
        fn persist(&self, _: RecordingArtifact, _: Vec<i16>) -> Result<(), SinkError> {
            Err(SinkError::Rejected("disk full".into()))
        }
    }

    #[test]
    fn sink_failure_still_returns_to_idle() {
        let ring = Arc::new(RingStore::new(AudioFormat::mono16(8), 4));
        ring.write(&[1; 16]);
        let ctl = SessionController::new(
            ring,
            Arc::new(ManualClock::new(Utc::now())),
            Arc::new(FailingSink),
            Arc::new(MetricsRegistry::new()),
            policy(1.0, 2.0),
        );
        let ev = KnockEvent::new(Utc::now() + Duration::seconds(1), 0.5, KnockKind::Single);
        ctl.on_knock(ev).unwrap();
        assert!(matches!(ctl.finalize(), Err(SessionError::Sink { .. })));
        assert_eq!(ctl.state(), ControllerState::Idle);
    }

    #[test]
    fn published_state_tracks_session_under_contention() {
        let r = rig(10, policy(1.0, 60.0));
        r.feed(2);
        let rx = r.ctl.subscribe();
        for _ in 0..2000 {
            std::thread::scope(|s| {
                s.spawn(|| {
                    let _ = r.ctl.on_knock(r.knock(0.9));
                });
                s.spawn(|| {
                    let _ = r.ctl.finalize();
                });
            });
            assert_eq!(*rx.borrow(), r.ctl.state());
        }
    }

    #[test]
    fn racing_tick_and_finalize_yield_one_artifact() {
        const RACERS: usize = 8;
        let r = rig(10, policy(1.0, 2.0));
        r.feed(2);
        r.ctl.on_knock(r.knock(0.9)).unwrap();
        r.feed(2);

        let barrier = std::sync::Barrier::new(RACERS);
        let won: Vec<bool> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..RACERS)
                .map(|i| {
                    let (barrier, ctl) = (&barrier, &r.ctl);
                    s.spawn(move || {
                        barrier.wait();
                        if i % 2 == 0 {
                            ctl.tick().unwrap().is_some()
                        } else {
                            match ctl.finalize() {
                                Ok(_) => true,
                                Err(SessionError::NoActiveSession) => false,
                                Err(e) => panic!("unexpected error: {e}"),
                            }
                        }
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(won.iter().filter(|&&w| w).count(), 1);
        assert_eq!(r.sink.len(), 1);
        assert_eq!(r.ctl.state(), ControllerState::Idle);
        assert_eq!(*r.ctl.subscribe().borrow(), ControllerState::Idle);
    }
}
