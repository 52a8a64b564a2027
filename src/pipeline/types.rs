//! Shared types for the message → parcel pipeline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SourceError;
use crate::parcels::{ParcelRecord, from_epoch_millis};

// ── Raw message ─────────────────────────────────────────────────────

/// A text message as handed over by a message source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    /// Message body.
    pub text: String,
    /// When the message arrived.
    pub received_at: DateTime<Utc>,
}

impl RawMessage {
    pub fn new(text: impl Into<String>, received_at: DateTime<Utc>) -> Self {
        Self {
            text: text.into(),
            received_at,
        }
    }

    /// Build from an epoch-millisecond timestamp. Out-of-range values
    /// fall back to the Unix epoch.
    pub fn from_millis(text: impl Into<String>, millis: i64) -> Self {
        Self::new(text, from_epoch_millis(millis))
    }
}

// ── Classification ──────────────────────────────────────────────────

/// A required field the extractor could not find.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingField {
    PickupCode,
    LockerNumber,
}

/// Verdict for one raw message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Failed the relevance filter.
    NotRelevant,
    /// Looked relevant but a required field was missing.
    Incomplete { missing: MissingField },
    /// A candidate record ready for reconciliation.
    Parcel(ParcelRecord),
}

// ── Message source trait ────────────────────────────────────────────

/// Read-only access to the device's raw text messages.
///
/// Implementations return messages newest first. A source that exists but
/// may not be read fails with [`SourceError::PermissionDenied`].
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Source name for logging.
    fn name(&self) -> &str;

    /// Fetch every available raw message.
    async fn fetch_raw(&self) -> Result<Vec<RawMessage>, SourceError>;
}
