//! One-open-handle-per-index bookkeeping shared by the backends.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::traits::{CameraError, Result};

/// Set of device indices currently held open.
#[derive(Debug, Clone, Default)]
pub struct DeviceClaims {
    held: Arc<Mutex<HashSet<usize>>>,
}

impl DeviceClaims {
    /// Create an empty claim set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `index`, failing with `NotAvailable` if it is already held.
    pub fn claim(&self, index: usize) -> Result<Claim> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| CameraError::Device("device claim registry poisoned".to_owned()))?;
        if !held.insert(index) {
            return Err(CameraError::NotAvailable(format!(
                "device {index} is already open"
            )));
        }
        Ok(Claim {
            index,
            held: Arc::clone(&self.held),
        })
    }
}

/// A held device index, released on drop.
#[derive(Debug)]
pub struct Claim {
    index: usize,
    held: Arc<Mutex<HashSet<usize>>>,
}

impl Claim {
    /// The claimed index.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(&self.index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_exclusive_until_dropped() {
        let claims = DeviceClaims::new();
        let claim = claims.claim(2).expect("claim");
        assert_eq!(claim.index(), 2);
        assert!(matches!(claims.claim(2), Err(CameraError::NotAvailable(_))));
        assert!(claims.claim(3).is_ok());

        drop(claim);
        assert!(claims.claim(2).is_ok());
    }
}
