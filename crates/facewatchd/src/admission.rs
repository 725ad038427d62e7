//! Single-slot frame admission.
//!
//! One atomic busy flag decides whether a frame enters the pipeline. A frame
//! that arrives while another is being analyzed is refused and released by
//! the caller straight away; nothing is queued.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct AdmissionGate {
    busy: AtomicBool,
    closed: AtomicBool,
    admitted: AtomicU64,
    refused: AtomicU64,
}

/// Counters for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct AdmissionStats {
    pub admitted: u64,
    pub refused: u64,
    pub busy: bool,
    pub closed: bool,
}

impl AdmissionGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Test-and-set the busy flag. On `true` the caller owns the slot and must
    /// call [`release`](Self::release) exactly once.
    pub fn try_admit(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            self.refused.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let admitted = self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if admitted {
            self.admitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.refused.fetch_add(1, Ordering::Relaxed);
        }
        admitted
    }

    /// Free the slot. Releasing an idle gate is a no-op.
    pub fn release(&self) {
        self.busy.store(false, Ordering::Release);
    }

    /// Admit and wrap the slot in a guard that releases it when dropped.
    pub fn try_acquire(self: &Arc<Self>) -> Option<AdmissionPermit> {
        self.try_admit().then(|| AdmissionPermit { gate: Arc::clone(self) })
    }

    /// Refuse every future admission. In-flight work keeps its slot.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            admitted: self.admitted.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            busy: self.is_busy(),
            closed: self.is_closed(),
        }
    }
}

/// Ownership of the admission slot; released on drop, including unwinding.
#[derive(Debug)]
pub struct AdmissionPermit {
    gate: Arc<AdmissionGate>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.gate.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    #[test]
    fn test_admit_then_refuse_then_admit() {
        let gate = AdmissionGate::new();
        assert!(gate.try_admit());
        assert!(!gate.try_admit());
        gate.release();
        assert!(gate.try_admit());
    }

    #[test]
    fn test_release_is_idempotent() {
        let gate = AdmissionGate::new();
        gate.release();
        gate.release();
        assert!(gate.try_admit());
        gate.release();
        gate.release();
        assert!(!gate.is_busy());
    }

    #[test]
    fn test_concurrent_admission_exactly_one() {
        const N: usize = 16;
        let gate = AdmissionGate::new();
        let barrier = Arc::new(Barrier::new(N));
        let wins = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..N)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let barrier = Arc::clone(&barrier);
                let wins = Arc::clone(&wins);
                std::thread::spawn(move || {
                    barrier.wait();
                    if gate.try_admit() {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(wins.load(Ordering::SeqCst), 1);
        let stats = gate.stats();
        assert_eq!(stats.admitted, 1);
        assert_eq!(stats.refused, (N - 1) as u64);

        gate.release();
        assert!(gate.try_admit());
    }

    #[test]
    fn test_permit_releases_on_drop() {
        let gate = AdmissionGate::new();
        let permit = gate.try_acquire().unwrap();
        assert!(gate.try_acquire().is_none());
        drop(permit);
        assert!(gate.try_acquire().is_some());
    }

    #[test]
    fn test_permit_releases_on_panic() {
        let gate = AdmissionGate::new();
        let g = Arc::clone(&gate);
        let result = std::thread::spawn(move || {
            let _permit = g.try_acquire().unwrap();
            panic!("analysis blew up");
        })
        .join();
        assert!(result.is_err());
        assert!(!gate.is_busy());
    }

    #[test]
    fn test_closed_gate_refuses() {
        let gate = AdmissionGate::new();
        let permit = gate.try_acquire().unwrap();
        gate.close();
        drop(permit);
        assert!(!gate.try_admit());
        assert!(gate.stats().closed);
    }
}
