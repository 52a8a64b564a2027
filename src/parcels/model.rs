//! Parcel data model: records, pickup state, and list filtering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Convert epoch milliseconds to a UTC time. Out-of-range values fall back
/// to the Unix epoch.
pub fn from_epoch_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Flat pickup status, as shown in lists and stored in the `status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParcelStatus {
    Pending,
    PickedUp,
}

impl ParcelStatus {
    /// Column value for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::PickedUp => "picked_up",
        }
    }
}

impl std::fmt::Display for ParcelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Pickup lifecycle. A pickup time exists exactly when the parcel was picked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PickupState {
    #[default]
    Pending,
    PickedUp { at: DateTime<Utc> },
}

impl PickupState {
    /// Rebuild the state from its stored columns.
    ///
    /// Rows where the two columns disagree are read as pending.
    pub fn from_columns(status: &str, pickup_time: Option<DateTime<Utc>>) -> Self {
        match (status, pickup_time) {
            ("picked_up", Some(at)) => Self::PickedUp { at },
            _ => Self::Pending,
        }
    }

    pub fn status(&self) -> ParcelStatus {
        match self {
            Self::Pending => ParcelStatus::Pending,
            Self::PickedUp { .. } => ParcelStatus::PickedUp,
        }
    }

    pub fn pickup_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Pending => None,
            Self::PickedUp { at } => Some(*at),
        }
    }
}

/// A parcel waiting in (or already taken from) a pickup locker.
///
/// Freshly extracted records are candidates: they carry no `id` until the
/// store assigns one on insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParcelRecord {
    /// Store-assigned identity. `None` for candidates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Business key, unique across stored records.
    pub pickup_code: String,
    /// Locker compartment label.
    pub locker_number: String,
    /// Pickup site, or the configured unknown-location sentinel.
    pub location: String,
    /// Raw message text, kept verbatim.
    pub message_content: String,
    /// When the message arrived.
    pub receive_time: DateTime<Utc>,
    /// Pickup status and time.
    #[serde(flatten)]
    pub state: PickupState,
}

impl ParcelRecord {
    /// Create a pending candidate record.
    pub fn candidate(
        pickup_code: impl Into<String>,
        locker_number: impl Into<String>,
        location: impl Into<String>,
        message_content: impl Into<String>,
        receive_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            pickup_code: pickup_code.into(),
            locker_number: locker_number.into(),
            location: location.into(),
            message_content: message_content.into(),
            receive_time,
            state: PickupState::Pending,
        }
    }

    pub fn status(&self) -> ParcelStatus {
        self.state.status()
    }

    pub fn pickup_time(&self) -> Option<DateTime<Utc>> {
        self.state.pickup_time()
    }

    /// Copy of this record marked as picked up at `at`.
    pub fn picked_up_at(&self, at: DateTime<Utc>) -> Self {
        Self {
            state: PickupState::PickedUp { at },
            ..self.clone()
        }
    }

    /// Copy of this record back in the pending state.
    pub fn reset(&self) -> Self {
        Self {
            state: PickupState::Pending,
            ..self.clone()
        }
    }

    /// Merge a freshly parsed `incoming` record over this stored one.
    ///
    /// Message-derived fields come from `incoming`; identity and pickup
    /// state stay with `self`, so a picked-up parcel is never reopened.
    pub fn merged_with(&self, incoming: &ParcelRecord) -> Self {
        Self {
            id: self.id,
            pickup_code: self.pickup_code.clone(),
            locker_number: incoming.locker_number.clone(),
            location: incoming.location.clone(),
            message_content: incoming.message_content.clone(),
            receive_time: incoming.receive_time,
            state: self.state,
        }
    }
}

// ── Filtering ───────────────────────────────────────────────────────

/// Status tab used when listing parcels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusFilter {
    All,
    #[default]
    Pending,
    PickedUp,
}

impl StatusFilter {
    pub fn accepts(&self, status: ParcelStatus) -> bool {
        match self {
            Self::All => true,
            Self::Pending => status == ParcelStatus::Pending,
            Self::PickedUp => status == ParcelStatus::PickedUp,
        }
    }
}

impl std::str::FromStr for StatusFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            "pending" => Ok(Self::Pending),
            "picked_up" | "picked-up" => Ok(Self::PickedUp),
            other => Err(format!("unknown status filter: {other}")),
        }
    }
}

/// Status filter plus free-text search over code, locker and location.
#[derive(Debug, Clone, Default)]
pub struct ParcelQuery {
    pub status: StatusFilter,
    pub search: Option<String>,
}

impl ParcelQuery {
    pub fn matches(&self, record: &ParcelRecord) -> bool {
        if !self.status.accepts(record.status()) {
            return false;
        }
        let needle = match self.search.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => s.to_lowercase(),
            _ => return true,
        };
        [
            &record.pickup_code,
            &record.locker_number,
            &record.location,
        ]
        .iter()
        .any(|field| field.to_lowercase().contains(&needle))
    }

    /// Keep only matching records, preserving order.
    pub fn apply(&self, records: Vec<ParcelRecord>) -> Vec<ParcelRecord> {
        records.into_iter().filter(|r| self.matches(r)).collect()
    }
}

/// Per-status totals for a record list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ParcelCounts {
    pub all: usize,
    pub pending: usize,
    pub picked_up: usize,
}

impl ParcelCounts {
    pub fn tally<'a>(records: impl IntoIterator<Item = &'a ParcelRecord>) -> Self {
        let mut counts = Self::default();
        for record in records {
            counts.all += 1;
            match record.status() {
                ParcelStatus::Pending => counts.pending += 1,
                ParcelStatus::PickedUp => counts.picked_up += 1,
            }
        }
        counts
    }
}
