//! Key-file license gate.
//!
//! The gate passes when the configured key file exists and holds a
//! non-blank key. With no `[license] key_file` configured every operation
//! is permitted. The file is re-read on each check so installing a key takes
//! effect without a restart.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use localrag_core::license::{AllowAll, LicenseGate};

use crate::config::LicenseConfig;

pub struct KeyFileGate {
    key_file: PathBuf,
}

impl KeyFileGate {
    pub fn new(key_file: impl Into<PathBuf>) -> Self {
        Self {
            key_file: key_file.into(),
        }
    }
}

impl LicenseGate for KeyFileGate {
    fn is_permitted(&self, operation: &str) -> bool {
        let ok = std::fs::read_to_string(&self.key_file)
            .map(|k| !k.trim().is_empty())
            .unwrap_or(false);
        debug!(operation, key_file = %self.key_file.display(), permitted = ok, "license check");
        ok
    }
}

pub fn create_gate(config: &LicenseConfig) -> Arc<dyn LicenseGate> {
    match &config.key_file {
        Some(path) => Arc::new(KeyFileGate::new(path)),
        None => Arc::new(AllowAll),
    }
}
