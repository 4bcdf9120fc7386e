//! Per-account device client
//!
//! [`DeviceClient`] ties an [`AuthSession`](crate::auth::AuthSession) to one
//! broker session and keeps the latest merged state of every device on the
//! account.

pub mod client;

pub use client::{DeviceClient, LastResponse, QUICK_PING_TIMEOUT};
