pub mod api;
pub mod availability;
pub mod calendar;
pub mod compactor;
pub mod config;
pub mod error;
pub mod limits;
pub mod model;
pub mod observability;
pub mod payment;
pub mod policy;
pub mod reservation;
pub mod store;
pub mod wal;
