//! Client for the patent register API: bearer token handling, request
//! throttling and retries, and extraction of the register record from the
//! XML search response.

pub mod auth;
pub mod client;
pub mod config;
pub mod extract;
pub mod limiter;
pub mod metrics_defs;
pub mod request;
pub mod retry;
pub mod types;

#[cfg(test)]
mod testutils;

pub use client::{Registry, RegistryClient, RegistryError};
pub use limiter::RateLimiter;
pub use types::RegistryRecord;
