//! Session and artifact value types.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::knock::KnockEvent;

/// An open capture window. Owned by the controller; never shared.
#[derive(Debug, Clone)]
pub struct RecordingSession {
    pub session_id: Uuid,
    pub start_timestamp: DateTime<Utc>,
    /// Target length measured from `start_timestamp`.
    pub max_duration: Duration,
    pub events: Vec<KnockEvent>,
    pub finalized: bool,
    /// Absolute ring position (samples ever written) of the window start.
    pub(crate) start_pos: u64,
    /// Absolute ring position of the first knock.
    pub(crate) anchor_pos: u64,
    /// Pre-roll the policy asked for, in samples, before clamping to retained history.
    pub(crate) requested_pre_roll: u64,
}

/// Set when retained history could not cover the requested window. Advisory only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PartialWindow {
    pub requested_secs: f64,
    pub delivered_secs: f64,
}

/// A finalized recording. Immutable; handed to the sink with its samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingArtifact {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub pre_roll_secs: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    pub detected_knocks: Vec<KnockEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_window: Option<PartialWindow>,
}

impl RecordingArtifact {
    pub fn is_partial(&self) -> bool {
        self.partial_window.is_some()
    }
}
