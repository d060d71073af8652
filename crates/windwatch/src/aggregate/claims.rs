//! In-process per-device claims.
//!
//! A claim keeps a second pass for the same device from starting in this
//! process while one is running. Across processes the IMMEDIATE transaction
//! and the unique bucket constraint do the same job.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Set of devices with a pass in progress.
#[derive(Debug, Clone, Default)]
pub struct DeviceClaims {
    held: Arc<Mutex<HashSet<String>>>,
}

impl DeviceClaims {
    /// Create an empty claim set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a device. `None` if it is already claimed.
    #[must_use]
    pub fn try_claim(&self, device_id: &str) -> Option<DeviceClaim> {
        let inserted = self.lock().insert(device_id.to_string());
        inserted.then(|| DeviceClaim {
            held: Arc::clone(&self.held),
            device_id: device_id.to_string(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A held claim; released on drop.
#[derive(Debug)]
pub struct DeviceClaim {
    held: Arc<Mutex<HashSet<String>>>,
    device_id: String,
}

impl DeviceClaim {
    /// The claimed device.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_exclusive() {
        let claims = DeviceClaims::new();
        let claim = claims.try_claim("ane-1").unwrap();

        assert_eq!(claim.device_id(), "ane-1");
        assert!(claims.try_claim("ane-1").is_none());
        assert!(claims.try_claim("ane-2").is_some());
    }

    #[test]
    fn test_drop_releases() {
        let claims = DeviceClaims::new();
        {
            let _claim = claims.try_claim("ane-1").unwrap();
        }
        assert!(claims.try_claim("ane-1").is_some());
    }

    #[test]
    fn test_clones_share_state() {
        let claims = DeviceClaims::new();
        let other = claims.clone();
        let _claim = claims.try_claim("ane-1").unwrap();
        assert!(other.try_claim("ane-1").is_none());
    }

    #[test]
    fn test_claims_across_threads() {
        let claims = DeviceClaims::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let claims = claims.clone();
                std::thread::spawn(move || claims.try_claim("ane-1").map(std::mem::forget))
            })
            .collect();

        let winners = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .count();
        assert_eq!(winners, 1);
    }
}
