//! Message → parcel pipeline.
//!
//! Raw messages flow one way:
//! 1. `MessageSource::fetch_raw()` — device/export I/O
//! 2. `Classifier::is_relevant()` — cheap permissive pre-filter
//! 3. `Classifier::extract()` — candidate record or nothing
//! 4. `Reconciler::sync_batch()` — dedup + commit to the `ParcelStore`

pub mod classifier;
pub mod reader;
pub mod reconciler;
pub mod types;

pub use classifier::Classifier;
pub use reconciler::{InsertOutcome, ParcelEvent, Reconciler, SyncReport};
pub use types::{Classification, MessageSource, MissingField, RawMessage};
