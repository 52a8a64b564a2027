//! Source scan: raw messages → candidate parcel records.
//!
//! Fetches everything a [`MessageSource`] has, runs the cheap relevance
//! filter, then extraction. Order of the source (newest first) is kept.

use tracing::{debug, info, warn};

use crate::error::SourceError;
use crate::parcels::ParcelRecord;
use crate::pipeline::classifier::Classifier;
use crate::pipeline::types::{Classification, MessageSource};

/// Scan a message source for parcel candidates.
///
/// A `PermissionDenied` source is logged and propagated so the caller can
/// ask for access; nothing is returned for it.
pub async fn scan_source(
    source: &dyn MessageSource,
    classifier: &Classifier,
) -> Result<Vec<ParcelRecord>, SourceError> {
    let messages = match source.fetch_raw().await {
        Ok(messages) => messages,
        Err(e) => {
            if e.is_permission_denied() {
                warn!(source = source.name(), "Message source not readable: {e}");
            }
            return Err(e);
        }
    };

    let total = messages.len();
    let mut not_relevant = 0usize;
    let mut incomplete = 0usize;
    let mut candidates = Vec::new();

    for message in &messages {
        match classifier.classify(message) {
            Classification::Parcel(record) => {
                debug!(
                    pickup_code = %record.pickup_code,
                    locker = %record.locker_number,
                    "Parcel message extracted"
                );
                candidates.push(record);
            }
            Classification::Incomplete { .. } => incomplete += 1,
            Classification::NotRelevant => not_relevant += 1,
        }
    }

    info!(
        source = source.name(),
        total,
        parcels = candidates.len(),
        incomplete,
        not_relevant,
        "Scanned message source"
    );
    Ok(candidates)
}
