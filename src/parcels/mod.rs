//! Parcel records and their pickup lifecycle.

pub mod model;

pub use model::{
    ParcelCounts, ParcelQuery, ParcelRecord, ParcelStatus, PickupState, StatusFilter,
    from_epoch_millis,
};
