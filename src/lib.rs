//! Pickup Tracker — parcel pickup messages to a deduplicated parcel list.

pub mod config;
pub mod error;
pub mod parcels;
pub mod pipeline;
pub mod sources;
pub mod store;
