//! # mall-compliance
//!
//! API-usage compliance, CAN-SPAM consent and data-lifecycle core for the
//! 3C Mall backend.
//!
//! This crate provides the policy facade the HTTP handlers and email senders
//! consult before performing a governed side effect: partner API calls are
//! rate-governed per provider, outbound email is gated by per-recipient
//! consent, and account deletion / data export run as audited workflows.

pub mod compliance;
pub mod config;
pub mod error;
pub mod logging;
pub mod store;

pub use compliance::ComplianceEngine;
pub use config::ComplianceConfig;
pub use error::{Error, Result};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidState("double confirmation".to_string());
        assert!(err.to_string().contains("double confirmation"));
    }
}
