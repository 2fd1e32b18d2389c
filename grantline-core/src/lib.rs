//! # grantline-core
//!
//! Reconciliation kernel for brokering signed software licenses.
//! Provides the license token engine, the secret, entitlement and request
//! reconcilers, and the client-side notifier that turns the
//! Discover/Offer/Acknowledged handshake into a yes/no license answer.

pub mod client;
pub mod clock;
pub mod config;
pub mod controller;
pub mod entitlement_reconciler;
pub mod error;
pub mod grant_deletion;
pub mod infrastructure;
#[path = "infrastructure_in_memory.rs"]
pub mod infrastructure_in_memory;
pub mod keys;
pub mod matcher;
pub mod notifier;
pub mod operator;
pub mod request_reconciler;
pub mod retry;
pub mod secret_reconciler;
pub mod token;
pub mod types;

pub use error::{LicensingError, LicensingResult};

#[cfg(test)]
mod test_support;

#[cfg(test)]
mod token_test;
#[cfg(test)]
mod matcher_test;
#[cfg(test)]
mod retry_test;
#[cfg(test)]
#[path = "infrastructure_test.rs"]
mod infrastructure_test;
