//! `ParcelStore` trait — the persistence seam used by the reconciler.
//!
//! The store owns identity assignment and enforces uniqueness of the
//! pickup code. Conflicting inserts must fail with
//! [`DatabaseError::DuplicateKey`] rather than producing a second row.

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::parcels::ParcelRecord;

/// Backend-agnostic parcel storage.
#[async_trait]
pub trait ParcelStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    /// All records, newest receive time first.
    async fn list_all(&self) -> Result<Vec<ParcelRecord>, DatabaseError>;

    /// Pending records, newest receive time first.
    async fn list_pending(&self) -> Result<Vec<ParcelRecord>, DatabaseError>;

    /// Whether a record with this pickup code exists.
    async fn exists_by_code(&self, pickup_code: &str) -> Result<bool, DatabaseError>;

    /// Look up a record by pickup code.
    async fn get_by_code(&self, pickup_code: &str) -> Result<Option<ParcelRecord>, DatabaseError>;

    /// Look up a record by store identity.
    async fn get_by_id(&self, id: i64) -> Result<Option<ParcelRecord>, DatabaseError>;

    /// Insert a new record and return its assigned id.
    ///
    /// Any `id` already on the record is ignored. Fails with
    /// `DuplicateKey` when the pickup code is taken.
    async fn insert(&self, record: &ParcelRecord) -> Result<i64, DatabaseError>;

    /// Overwrite the record with the same `id`.
    ///
    /// Fails with `NotFound` when the record has no id or the id is unknown.
    async fn update(&self, record: &ParcelRecord) -> Result<(), DatabaseError>;
}
