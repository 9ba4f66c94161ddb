//! Per-volume-group I/O throttle (C10): rotational backing stores get a
//! permit of 1 (serialize provisioning), SSD-backed VGs get a wide permit
//! pool, so first-boot and rootfs-clone traffic doesn't thrash a spinning
//! disk shared by several VMs.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::VmBuilderError;
use crate::lvm;

const DEFAULT_MAX_CONCURRENCY: usize = 8;

pub struct IoThrottler {
    by_vg: HashMap<String, Arc<Semaphore>>,
    held: std::sync::Mutex<HashMap<String, OwnedSemaphorePermit>>,
}

impl IoThrottler {
    /// Build one semaphore per VG named in `vgs`, sized by whether C4
    /// reports the VG as SSD-backed.
    pub async fn new(vgs: &[String], max_concurrency: usize) -> Result<Self, VmBuilderError> {
        let max_concurrency = if max_concurrency == 0 { DEFAULT_MAX_CONCURRENCY } else { max_concurrency };
        let mut by_vg = HashMap::with_capacity(vgs.len());
        for vg in vgs {
            if by_vg.contains_key(vg) {
                continue;
            }
            let permits = if lvm::vg_is_ssd(vg).await? { max_concurrency } else { 1 };
            by_vg.insert(vg.clone(), Arc::new(Semaphore::new(permits)));
        }
        Ok(Self { by_vg, held: std::sync::Mutex::new(HashMap::new()) })
    }

    /// Acquire a permit for `instance_id`'s provisioning run against `vg`,
    /// blocking until one is available. The permit is held until
    /// [`release`](Self::release) is called for the same `instance_id`.
    pub async fn acquire(&self, instance_id: &str, vg: &str) -> Result<(), VmBuilderError> {
        let sem = self.by_vg.get(vg).ok_or_else(|| VmBuilderError::NoSuchVg { vg: vg.to_string() })?.clone();
        let permit = sem.acquire_owned().await.map_err(|_| VmBuilderError::Validation {
            message: format!("io-throttle semaphore for {vg} was closed"),
        })?;
        self.held.lock().expect("io-throttle mutex poisoned").insert(instance_id.to_string(), permit);
        Ok(())
    }

    /// Release the permit held for `instance_id`, if any. Called from the
    /// phone-home hook chain once first boot completes.
    pub fn release(&self, instance_id: &str) {
        self.held.lock().expect("io-throttle mutex poisoned").remove(instance_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_unknown_vg_errors() {
        let throttler = IoThrottler { by_vg: HashMap::new(), held: std::sync::Mutex::new(HashMap::new()) };
        let err = throttler.acquire("i-1", "no-such-vg").await.unwrap_err();
        assert!(matches!(err, VmBuilderError::NoSuchVg { .. }));
    }

    #[tokio::test]
    async fn release_of_unknown_instance_is_a_no_op() {
        let throttler = IoThrottler { by_vg: HashMap::new(), held: std::sync::Mutex::new(HashMap::new()) };
        throttler.release("never-acquired");
    }

    #[tokio::test]
    async fn rotational_vg_serializes_to_one_permit() {
        let sem = Arc::new(Semaphore::new(1));
        let mut by_vg = HashMap::new();
        by_vg.insert("spinning-vg".to_string(), sem);
        let throttler = IoThrottler { by_vg, held: std::sync::Mutex::new(HashMap::new()) };

        throttler.acquire("i-1", "spinning-vg").await.unwrap();
        let sem2 = throttler.by_vg["spinning-vg"].clone();
        assert_eq!(sem2.available_permits(), 0);
        throttler.release("i-1");
        assert_eq!(sem2.available_permits(), 1);
    }
}
