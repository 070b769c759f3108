//! Core interfaces for bulwark
//!
//! This crate defines the seams between the health and recovery crates so
//! that neither depends on the other's concrete types.

pub mod availability;

pub use availability::{ServiceAvailability, ServiceHealthSnapshot, StaticAvailability};
