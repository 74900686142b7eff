//! knockcap: knock-triggered audio capture.
//! Keeps a rolling window of recent audio in memory and, when a knock is detected,
//! cuts a pre-roll + post-roll recording out of it and hands it to a sink.

pub mod artifact;
pub mod audio;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod knock;
pub mod metrics;
pub mod replay;
pub mod session;
pub mod sink;

pub use artifact::{PartialWindow, RecordingArtifact, RecordingSession};
pub use audio::{AudioFormat, RangeError, RingStore};
pub use clock::{ClockSource, ManualClock, SystemClock};
pub use config::{Config, ConfigError};
pub use knock::{KnockEvent, KnockKind, KnockRecord};
pub use session::{ControllerState, SessionController, SessionError, SessionPolicy};
pub use sink::{ArtifactSink, MemorySink, SinkError, WavFileSink};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("knockcap=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();
}
