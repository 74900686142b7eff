//! Knock events as delivered by a detector.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Single or double knock, as classified by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KnockKind {
    Single,
    Double,
}

impl std::fmt::Display for KnockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KnockKind::Single => write!(f, "single"),
            KnockKind::Double => write!(f, "double"),
        }
    }
}

impl FromStr for KnockKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(KnockKind::Single),
            "double" => Ok(KnockKind::Double),
            other => Err(format!("unknown knock kind: {other}")),
        }
    }
}

/// A detected knock. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnockEvent {
    pub timestamp: DateTime<Utc>,
    /// Detector confidence, 0.0-1.0.
    pub confidence: f32,
    pub kind: KnockKind,
}

impl KnockEvent {
    pub fn new(timestamp: DateTime<Utc>, confidence: f32, kind: KnockKind) -> Self {
        Self {
            timestamp,
            confidence,
            kind,
        }
    }

    /// Checks the fields a typed event can still get wrong.
    pub fn validate(&self) -> Result<(), String> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!("confidence {} outside [0, 1]", self.confidence));
        }
        Ok(())
    }
}

/// Untyped wire form of a knock: ISO-8601 timestamp and kind as strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnockRecord {
    pub timestamp: String,
    pub confidence: f32,
    #[serde(rename = "type")]
    pub kind: String,
}

impl TryFrom<KnockRecord> for KnockEvent {
    type Error = String;

    fn try_from(record: KnockRecord) -> Result<Self, Self::Error> {
        let timestamp = DateTime::parse_from_rfc3339(&record.timestamp)
            .map_err(|e| format!("bad timestamp {:?}: {e}", record.timestamp))?
            .with_timezone(&Utc);
        let kind = record.kind.parse::<KnockKind>()?;
        let event = KnockEvent::new(timestamp, record.confidence, kind);
        event.validate()?;
        Ok(event)
    }
}
