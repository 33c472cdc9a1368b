use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on reference embeddings held per enrolled subject.
pub const MAX_ENROLLED_EMBEDDINGS: usize = 10;

/// Face embedding vector produced by the external feature extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Scale to unit L2 norm.
    ///
    /// Returns `None` for a zero-norm (or non-finite) vector, which can never match.
    pub fn normalized(&self) -> Option<Embedding> {
        let norm = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 && norm.is_finite() {
            Some(Embedding {
                values: self.values.iter().map(|x| x / norm).collect(),
            })
        } else {
            None
        }
    }

    /// Compute Euclidean distance between two embeddings of equal length.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnrollmentError {
    #[error("enrollment requires at least one embedding")]
    Empty,
    #[error("enrollment holds {0} embeddings (max 10)")]
    TooMany(usize),
    #[error("embedding #{0} is empty")]
    EmptyEmbedding(usize),
    #[error("embedding #{index} has {actual} dimensions, expected {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },
}

/// A subject's reference embeddings, owned by identity management.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrolledIdentity {
    subject_id: String,
    embeddings: Vec<Embedding>,
}

impl EnrolledIdentity {
    /// Build an identity, enforcing 1..=10 non-empty embeddings of one dimensionality.
    pub fn new(
        subject_id: impl Into<String>,
        embeddings: Vec<Embedding>,
    ) -> Result<Self, EnrollmentError> {
        if embeddings.is_empty() {
            return Err(EnrollmentError::Empty);
        }
        if embeddings.len() > MAX_ENROLLED_EMBEDDINGS {
            return Err(EnrollmentError::TooMany(embeddings.len()));
        }
        let expected = embeddings[0].dim();
        for (index, e) in embeddings.iter().enumerate() {
            if e.dim() == 0 {
                return Err(EnrollmentError::EmptyEmbedding(index));
            }
            if e.dim() != expected {
                return Err(EnrollmentError::DimensionMismatch {
                    index,
                    expected,
                    actual: e.dim(),
                });
            }
        }
        Ok(Self {
            subject_id: subject_id.into(),
            embeddings,
        })
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn embeddings(&self) -> &[Embedding] {
        &self.embeddings
    }
}

/// Geolocation in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Client-reported liveness and anti-spoof signals for one capture.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LivenessSignals {
    pub is_live: bool,
    pub liveness_confidence: f32,
    pub phone_detected: bool,
    pub spoof_attempt: bool,
}

/// One scan submitted by a client device. Never persisted.
///
/// Carries no subject: ownership comes from the authenticated session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanEvent {
    pub embedding: Embedding,
    #[serde(flatten)]
    pub liveness: LivenessSignals,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub location: Option<GeoPoint>,
}

/// A subject's attendance record for one local calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceLogEntry {
    pub id: String,
    pub subject_id: String,
    /// Local calendar day, fixed at creation from `entry_time`.
    pub day: NaiveDate,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub device_id: Option<String>,
    pub exit_device_id: Option<String>,
    pub location: Option<GeoPoint>,
    /// Diagnostics of the scan that created the entry.
    pub liveness: LivenessSignals,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Arrival,
    Departure,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Arrival => f.write_str("arrival recorded"),
            Direction::Departure => f.write_str("departure recorded"),
        }
    }
}

/// Why a scan was turned away. Rejections are outcomes, not faults.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    #[error("face does not match any enrolled embedding")]
    FaceMismatch,
    #[error("liveness check failed")]
    LivenessFailed,
    #[error("scan location is outside the premises")]
    OutsidePremises,
    #[error("already checked out for today")]
    AlreadyCheckedOut,
}

/// Result of `VerifyAndLog`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScanOutcome {
    Accepted {
        direction: Direction,
        entry: AttendanceLogEntry,
    },
    Rejected {
        reason: RejectReason,
    },
}

impl ScanOutcome {
    pub fn direction(&self) -> Option<Direction> {
        match self {
            ScanOutcome::Accepted { direction, .. } => Some(*direction),
            ScanOutcome::Rejected { .. } => None,
        }
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            ScanOutcome::Accepted { .. } => None,
            ScanOutcome::Rejected { reason } => Some(*reason),
        }
    }
}

/// Business-day presence figures for one subject. Derived, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceStatistics {
    pub subject_id: String,
    pub present_days: u32,
    pub total_business_days: u32,
    /// Negative only when the log is inconsistent (weekend or future-dated entries).
    pub absent_days: i64,
    /// Percentage with exactly two decimals, e.g. "87.50".
    pub attendance_percentage: String,
}
