//! Request admission control (component D): bounds in-flight client
//! connections to the `simultaneity_cap` the control plane granted the user.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::GatewayError;

/// A counting gate sized to one user's `simultaneity_cap`.
///
/// The original uses `golang.org/x/sync/semaphore.Weighted`, which blocks
/// indefinitely if the cap is zero; a zero cap there really means "never
/// serve anything," which is almost certainly a configuration mistake, so
/// [`AdmissionGate::new`] rejects it outright instead of hanging the server.
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
}

impl AdmissionGate {
    pub fn new(simultaneity_cap: u32) -> Result<Self, GatewayError> {
        if simultaneity_cap == 0 {
            return Err(GatewayError::ConfigInvalid(
                "user's simultaneity_cap is 0; this would block every request forever".into(),
            ));
        }

        Ok(Self {
            semaphore: Arc::new(Semaphore::new(simultaneity_cap as usize)),
        })
    }

    /// Acquire one slot, waiting if the gate is currently full. The returned
    /// permit is owned rather than borrowed, so it can be moved into the
    /// spawned task that bridges a `CONNECT` tunnel; it releases the slot
    /// when dropped, so every proxy-handler exit path frees it automatically.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("admission semaphore is never closed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_cap_is_rejected() {
        let err = AdmissionGate::new(0).unwrap_err();
        assert!(matches!(err, GatewayError::ConfigInvalid(_)));
    }

    #[tokio::test]
    async fn acquire_releases_slot_on_drop() {
        let gate = AdmissionGate::new(1).unwrap();
        {
            let _permit = gate.acquire().await;
            assert_eq!(gate.semaphore.available_permits(), 0);
        }
        assert_eq!(gate.semaphore.available_permits(), 1);
    }
}
