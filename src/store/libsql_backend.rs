//! libSQL backend — async `ParcelStore` implementation.
//!
//! Supports local file and in-memory databases. Timestamps are stored as
//! epoch milliseconds; pickup state is split over `status` + `pickup_time`.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::parcels::{ParcelRecord, PickupState, from_epoch_millis};
use crate::store::migrations;
use crate::store::traits::ParcelStore;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_records(
        &self,
        op: &str,
        sql: &str,
        args: impl libsql::params::IntoParams,
    ) -> Result<Vec<ParcelRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, args)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut records = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => match row_to_record(&row) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!("Skipping parcel row: {e}"),
                },
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
            }
        }
        Ok(records)
    }

    async fn query_one(
        &self,
        op: &str,
        sql: &str,
        args: impl libsql::params::IntoParams,
    ) -> Result<Option<ParcelRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, args)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let record = row_to_record(&row)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Convert an optional timestamp to a libsql integer or NULL.
fn opt_millis(at: Option<DateTime<Utc>>) -> libsql::Value {
    match at {
        Some(at) => libsql::Value::Integer(at.timestamp_millis()),
        None => libsql::Value::Null,
    }
}

/// Read an epoch-millis column, rejecting anything but INTEGER or NULL.
fn millis_column(row: &libsql::Row, idx: i32) -> Result<Option<i64>, libsql::Error> {
    match row.get_value(idx)? {
        libsql::Value::Null => Ok(None),
        libsql::Value::Integer(ms) => Ok(Some(ms)),
        _ => Err(libsql::Error::InvalidColumnType),
    }
}

/// SQLite reports unique index violations as "UNIQUE constraint failed: ...".
fn is_unique_violation(e: &libsql::Error) -> bool {
    e.to_string().contains("UNIQUE constraint failed")
}

/// Map a libsql Row to a ParcelRecord.
///
/// Column order matches PARCEL_COLUMNS:
/// 0:id, 1:pickup_code, 2:locker_number, 3:location, 4:message_content,
/// 5:receive_time, 6:status, 7:pickup_time
fn row_to_record(row: &libsql::Row) -> Result<ParcelRecord, libsql::Error> {
    let receive_ms = millis_column(row, 5)?.ok_or(libsql::Error::NullValue)?;
    let status_str: String = row.get(6)?;
    let pickup_ms = millis_column(row, 7)?;

    Ok(ParcelRecord {
        id: Some(row.get(0)?),
        pickup_code: row.get(1)?,
        locker_number: row.get(2)?,
        location: row.get(3)?,
        message_content: row.get(4)?,
        receive_time: from_epoch_millis(receive_ms),
        state: PickupState::from_columns(&status_str, pickup_ms.map(from_epoch_millis)),
    })
}

// ── Trait implementation ────────────────────────────────────────────

const PARCEL_COLUMNS: &str =
    "id, pickup_code, locker_number, location, message_content, receive_time, status, pickup_time";

#[async_trait]
impl ParcelStore for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn list_all(&self) -> Result<Vec<ParcelRecord>, DatabaseError> {
        self.query_records(
            "list_all",
            &format!("SELECT {PARCEL_COLUMNS} FROM parcels ORDER BY receive_time DESC, id DESC"),
            (),
        )
        .await
    }

    async fn list_pending(&self) -> Result<Vec<ParcelRecord>, DatabaseError> {
        self.query_records(
            "list_pending",
            &format!(
                "SELECT {PARCEL_COLUMNS} FROM parcels WHERE status = 'pending' ORDER BY receive_time DESC, id DESC"
            ),
            (),
        )
        .await
    }

    async fn exists_by_code(&self, pickup_code: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT EXISTS(SELECT 1 FROM parcels WHERE pickup_code = ?1)",
                params![pickup_code],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("exists_by_code: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let exists: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(exists != 0)
            }
            Ok(None) => Ok(false),
            Err(e) => Err(DatabaseError::Query(format!("exists_by_code: {e}"))),
        }
    }

    async fn get_by_code(&self, pickup_code: &str) -> Result<Option<ParcelRecord>, DatabaseError> {
        self.query_one(
            "get_by_code",
            &format!("SELECT {PARCEL_COLUMNS} FROM parcels WHERE pickup_code = ?1 LIMIT 1"),
            params![pickup_code],
        )
        .await
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<ParcelRecord>, DatabaseError> {
        self.query_one(
            "get_by_id",
            &format!("SELECT {PARCEL_COLUMNS} FROM parcels WHERE id = ?1"),
            params![id],
        )
        .await
    }

    async fn insert(&self, record: &ParcelRecord) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO parcels (pickup_code, locker_number, location, message_content,
                    receive_time, status, pickup_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 RETURNING id",
                params![
                    record.pickup_code.as_str(),
                    record.locker_number.as_str(),
                    record.location.as_str(),
                    record.message_content.as_str(),
                    record.receive_time.timestamp_millis(),
                    record.status().as_str(),
                    opt_millis(record.pickup_time()),
                ],
            )
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DatabaseError::DuplicateKey {
                        key: record.pickup_code.clone(),
                    }
                } else {
                    DatabaseError::Query(format!("insert: {e}"))
                }
            })?;

        let row = rows
            .next()
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DatabaseError::DuplicateKey {
                        key: record.pickup_code.clone(),
                    }
                } else {
                    DatabaseError::Query(format!("insert: {e}"))
                }
            })?
            .ok_or_else(|| DatabaseError::Query("insert: no id returned".into()))?;
        let id: i64 = row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;

        debug!(id, pickup_code = %record.pickup_code, "Parcel inserted into DB");
        Ok(id)
    }

    async fn update(&self, record: &ParcelRecord) -> Result<(), DatabaseError> {
        let not_found = || DatabaseError::NotFound {
            entity: "parcel".into(),
            id: record
                .id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "<none>".into()),
        };
        let id = record.id.ok_or_else(not_found)?;

        let affected = self
            .conn()
            .execute(
                "UPDATE parcels SET pickup_code = ?1, locker_number = ?2, location = ?3,
                    message_content = ?4, receive_time = ?5, status = ?6, pickup_time = ?7
                 WHERE id = ?8",
                params![
                    record.pickup_code.as_str(),
                    record.locker_number.as_str(),
                    record.location.as_str(),
                    record.message_content.as_str(),
                    record.receive_time.timestamp_millis(),
                    record.status().as_str(),
                    opt_millis(record.pickup_time()),
                    id,
                ],
            )
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DatabaseError::DuplicateKey {
                        key: record.pickup_code.clone(),
                    }
                } else {
                    DatabaseError::Query(format!("update: {e}"))
                }
            })?;

        if affected == 0 {
            return Err(not_found());
        }

        debug!(id, status = %record.status(), "Parcel updated in DB");
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────
