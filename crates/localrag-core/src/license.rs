//! Licensing gate consulted before indexing or querying.
//!
//! The core knows nothing about how a license is validated; it only asks a
//! [`LicenseGate`] for a pass/fail answer per operation.

use crate::error::LicenseDenied;

/// Operation name passed to the gate before an indexing run.
pub const OP_INDEX: &str = "index";
/// Operation name passed to the gate before a query.
pub const OP_QUERY: &str = "query";

/// Boolean pass/fail gate.
pub trait LicenseGate: Send + Sync {
    fn is_permitted(&self, operation: &str) -> bool;
}

/// Gate that permits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl LicenseGate for AllowAll {
    fn is_permitted(&self, _operation: &str) -> bool {
        true
    }
}

/// Fail with [`LicenseDenied`] unless `gate` permits `operation`.
pub fn require(gate: &dyn LicenseGate, operation: &'static str) -> Result<(), LicenseDenied> {
    if gate.is_permitted(operation) {
        Ok(())
    } else {
        Err(LicenseDenied { operation })
    }
}
