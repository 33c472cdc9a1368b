//! Liveness and anti-spoof gating of client-reported signals.
//!
//! All conditions must hold for a scan to pass; none is weighted against
//! another. Every scan is judged on its own signals, with no memory of
//! earlier failures.

use crate::types::{GeoPoint, LivenessSignals};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default minimum liveness confidence for a pass.
pub const DEFAULT_MIN_LIVENESS_CONFIDENCE: f32 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Pass,
    Reject,
}

/// Individual conditions that failed for a rejected scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LivenessFailure {
    NotLive,
    LowConfidence,
    PhoneDetected,
    SpoofAttempt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessDecision {
    pub verdict: Verdict,
    pub failures: Vec<LivenessFailure>,
}

impl LivenessDecision {
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }

    /// Whether the client flagged the scan as a spoof, which must raise an alert.
    pub fn spoof_suspected(&self) -> bool {
        self.failures.contains(&LivenessFailure::SpoofAttempt)
    }

    /// Build the alert for a spoof-flagged scan; `None` for any other decision.
    pub fn spoof_alert(
        &self,
        subject_id: &str,
        device_id: Option<&str>,
        location: Option<GeoPoint>,
        detected_at: DateTime<Utc>,
    ) -> Option<SpoofAlert> {
        self.spoof_suspected().then(|| SpoofAlert {
            subject_id: subject_id.to_string(),
            device_id: device_id.map(str::to_string),
            location,
            detected_at,
        })
    }
}

/// Notification payload for supervisors about a suspected spoof.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpoofAlert {
    pub subject_id: String,
    pub device_id: Option<String>,
    pub location: Option<GeoPoint>,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct LivenessGate {
    pub min_confidence: f32,
}

impl Default for LivenessGate {
    fn default() -> Self {
        Self {
            min_confidence: DEFAULT_MIN_LIVENESS_CONFIDENCE,
        }
    }
}

impl LivenessGate {
    pub fn new(min_confidence: f32) -> Self {
        Self { min_confidence }
    }

    pub fn evaluate(&self, signals: &LivenessSignals) -> LivenessDecision {
        let mut failures = Vec::new();

        if !signals.is_live {
            failures.push(LivenessFailure::NotLive);
        }
        let confidence = signals.liveness_confidence;
        if confidence.is_nan() || confidence < self.min_confidence {
            failures.push(LivenessFailure::LowConfidence);
        }
        if signals.phone_detected {
            failures.push(LivenessFailure::PhoneDetected);
        }
        if signals.spoof_attempt {
            failures.push(LivenessFailure::SpoofAttempt);
        }

        let verdict = if failures.is_empty() {
            Verdict::Pass
        } else {
            Verdict::Reject
        };
        LivenessDecision { verdict, failures }
    }

    /// Shorthand for [`evaluate`](Self::evaluate) taking the raw signals.
    pub fn accept(
        &self,
        is_live: bool,
        confidence: f32,
        phone_detected: bool,
        spoof_attempt: bool,
    ) -> Verdict {
        self.evaluate(&LivenessSignals {
            is_live,
            liveness_confidence: confidence,
            phone_detected,
            spoof_attempt,
        })
        .verdict
    }
}
