//! Host integration guard.

use crate::error::{EngineError, EngineResult};
use crate::registry::{Bucket, BucketBuilder};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// Installs a bucket into a host at most once.
///
/// Hosts typically keep one in a `static`:
///
/// ```
/// use docmirror_engine::Integration;
///
/// static INTEGRATION: Integration = Integration::new();
/// assert!(!INTEGRATION.is_installed());
/// ```
#[derive(Debug, Default)]
pub struct Integration {
    installed: AtomicBool,
}

impl Integration {
    /// Creates an uninstalled guard.
    pub const fn new() -> Self {
        Self {
            installed: AtomicBool::new(false),
        }
    }

    /// Builds the bucket. Fails with [`EngineError::AlreadyInstalled`] on a
    /// second call. A failed build leaves the guard uninstalled.
    pub fn install(&self, builder: BucketBuilder) -> EngineResult<Bucket> {
        if self.installed.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyInstalled);
        }
        match builder.build() {
            Ok(bucket) => {
                info!("bucket installed");
                Ok(bucket)
            }
            Err(err) => {
                self.installed.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Returns true once a bucket was installed.
    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    /// Allows another install.
    pub fn reset(&self) {
        self.installed.store(false, Ordering::SeqCst);
    }
}
