//! HTTP handlers, grouped by resource.

pub mod files;
pub mod health;
pub mod objects;
pub mod uploads;
