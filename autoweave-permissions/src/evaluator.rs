//! Capability decision logic plus the per-instance resource accounting.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tracing::debug;

use crate::types::{CapabilityRequest, Origin, PermissionSet};
use crate::PermissionDenied;

/// Decides capability requests for one plugin instance.
///
/// The permission set is immutable; the atomics track cumulative heap
/// bytes and live workers so that `memory.alloc` and `worker.spawn` stay
/// cheap and lock-free under concurrent host-calls.
pub struct PermissionEvaluator {
    set: PermissionSet,
    heap_used: AtomicU64,
    workers: AtomicU32,
}

impl PermissionEvaluator {
    pub fn new(set: PermissionSet) -> Self {
        Self {
            set,
            heap_used: AtomicU64::new(0),
            workers: AtomicU32::new(0),
        }
    }

    pub fn permission_set(&self) -> &PermissionSet {
        &self.set
    }

    /// Cumulative heap bytes currently accounted to the instance.
    pub fn heap_used(&self) -> u64 {
        self.heap_used.load(Ordering::Relaxed)
    }

    pub fn heap_limit(&self) -> u64 {
        self.set.memory.heap_limit_bytes()
    }

    /// Decide a capability request. `Ok(())` is Allow; the error carries
    /// the structured denial reason. Allocation and worker-spawn requests
    /// commit their accounting on Allow.
    pub fn check(&self, request: &CapabilityRequest) -> Result<(), PermissionDenied> {
        let decision = self.decide(request);
        if let Err(reason) = &decision {
            debug!(?request, %reason, "capability denied");
        }
        decision
    }

    fn decide(&self, request: &CapabilityRequest) -> Result<(), PermissionDenied> {
        match request {
            CapabilityRequest::Fs { path, mode } => {
                let normalized = normalize(path);
                let grant = self
                    .set
                    .filesystem
                    .iter()
                    .filter(|g| normalized.starts_with(&g.prefix))
                    .max_by_key(|g| g.prefix.components().count())
                    .ok_or_else(|| PermissionDenied::PathNotGranted {
                        path: normalized.display().to_string(),
                    })?;
                if !mode.permitted_by(grant.mode) {
                    return Err(PermissionDenied::ModeExceeded {
                        path: normalized.display().to_string(),
                        requested: *mode,
                        granted: grant.mode,
                    });
                }
                Ok(())
            }

            CapabilityRequest::NetOut { origin } => {
                let parsed = Origin::parse(origin)
                    .ok_or_else(|| PermissionDenied::OriginUnparseable(origin.clone()))?;
                if self.set.network.outbound.contains(&parsed) {
                    Ok(())
                } else {
                    Err(PermissionDenied::OriginNotAllowed(parsed.to_string()))
                }
            }

            CapabilityRequest::NetIn { port, interface } => {
                let declared_port = self.set.network.inbound_port;
                if declared_port == Some(*port) && self.set.network.inbound_interface == *interface
                {
                    Ok(())
                } else {
                    Err(PermissionDenied::InboundNotDeclared {
                        port: *port,
                        interface: *interface,
                    })
                }
            }

            CapabilityRequest::UsbOpen {
                vendor_id,
                product_id,
            } => {
                if self.set.usb.matches(*vendor_id, *product_id) {
                    Ok(())
                } else {
                    Err(PermissionDenied::UsbNotDeclared {
                        vendor_id: *vendor_id,
                        product_id: *product_id,
                    })
                }
            }

            CapabilityRequest::QueuePublish { queue } | CapabilityRequest::QueueConsume { queue } => {
                if self.set.queues.contains(queue) {
                    Ok(())
                } else {
                    Err(PermissionDenied::QueueNotDeclared(queue.clone()))
                }
            }

            CapabilityRequest::MemoryAlloc { bytes } => self.try_alloc(*bytes),

            CapabilityRequest::WorkerSpawn => self.try_spawn_worker(),
        }
    }

    /// Release previously accounted heap bytes.
    pub fn release(&self, bytes: u64) {
        // Saturating: releasing more than was accounted clamps to zero.
        let mut current = self.heap_used.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(bytes);
            match self.heap_used.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Record a worker exit, freeing a spawn slot.
    pub fn worker_exited(&self) {
        let mut current = self.workers.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(1);
            match self.workers.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    fn try_alloc(&self, bytes: u64) -> Result<(), PermissionDenied> {
        let limit = self.set.memory.heap_limit_bytes();
        let mut used = self.heap_used.load(Ordering::Relaxed);
        loop {
            let requested_total = used.saturating_add(bytes);
            if requested_total > limit {
                return Err(PermissionDenied::HeapExhausted {
                    requested: bytes,
                    used,
                    limit,
                });
            }
            match self.heap_used.compare_exchange_weak(
                used,
                requested_total,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => used = observed,
            }
        }
    }

    fn try_spawn_worker(&self) -> Result<(), PermissionDenied> {
        let limit = self.set.memory.max_workers;
        let mut count = self.workers.load(Ordering::Relaxed);
        loop {
            if count >= limit {
                return Err(PermissionDenied::WorkerLimitReached { limit });
            }
            match self.workers.compare_exchange_weak(
                count,
                count + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => count = observed,
            }
        }
    }
}

/// Lexical normalization: resolves `.` and `..` without touching the
/// filesystem, so a plugin cannot smuggle a traversal past the prefix
/// comparison.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccessMode, FilesystemPermission, MemoryPermissions, PermissionSet};
    use std::collections::HashSet;

    fn base_set() -> PermissionSet {
        PermissionSet {
            filesystem: vec![
                FilesystemPermission {
                    prefix: PathBuf::from("/var/lib/autoweave/scans"),
                    mode: AccessMode::ReadWrite,
                },
                FilesystemPermission {
                    prefix: PathBuf::from("/var/lib/autoweave"),
                    mode: AccessMode::Read,
                },
            ],
            network: crate::types::NetworkPermissions {
                outbound: ["https://api.example.com", "http://localhost:9200"]
                    .iter()
                    .filter_map(|raw| Origin::parse(raw))
                    .collect(),
                inbound_port: Some(8099),
                inbound_interface: crate::InboundInterface::Localhost,
            },
            usb: crate::types::UsbPermissions {
                vendor_ids: HashSet::from([0x04a9]),
                product_ids: HashSet::from([0x220e]),
            },
            memory: MemoryPermissions {
                max_heap_mb: 10,
                max_workers: 2,
            },
            queues: HashSet::from(["scanner-jobs".to_string()]),
        }
    }

    #[test]
    fn longest_prefix_wins_for_filesystem() {
        let eval = PermissionEvaluator::new(base_set());
        // Write is granted under the deeper prefix only.
        assert!(eval
            .check(&CapabilityRequest::Fs {
                path: PathBuf::from("/var/lib/autoweave/scans/out.png"),
                mode: AccessMode::Write,
            })
            .is_ok());
        assert!(matches!(
            eval.check(&CapabilityRequest::Fs {
                path: PathBuf::from("/var/lib/autoweave/config.json"),
                mode: AccessMode::Write,
            }),
            Err(PermissionDenied::ModeExceeded { .. })
        ));
    }

    #[test]
    fn traversal_cannot_escape_a_prefix() {
        let eval = PermissionEvaluator::new(base_set());
        assert!(matches!(
            eval.check(&CapabilityRequest::Fs {
                path: PathBuf::from("/var/lib/autoweave/scans/../../../etc/shadow"),
                mode: AccessMode::Read,
            }),
            Err(PermissionDenied::PathNotGranted { .. })
        ));
    }

    #[test]
    fn prefix_match_is_component_wise() {
        let eval = PermissionEvaluator::new(base_set());
        // `/var/lib/autoweave-evil` shares a string prefix but not a path one.
        assert!(eval
            .check(&CapabilityRequest::Fs {
                path: PathBuf::from("/var/lib/autoweave-evil/x"),
                mode: AccessMode::Read,
            })
            .is_err());
    }

    #[test]
    fn outbound_origin_requires_exact_match() {
        let eval = PermissionEvaluator::new(base_set());
        assert!(eval
            .check(&CapabilityRequest::NetOut {
                origin: "https://api.example.com/v1/items".into(),
            })
            .is_ok());
        // Default port is normalized in.
        assert!(eval
            .check(&CapabilityRequest::NetOut {
                origin: "https://api.example.com:443/".into(),
            })
            .is_ok());
        assert!(eval
            .check(&CapabilityRequest::NetOut {
                origin: "https://evil.example.com".into(),
            })
            .is_err());
        // Same host, different scheme: not the same origin.
        assert!(eval
            .check(&CapabilityRequest::NetOut {
                origin: "http://api.example.com".into(),
            })
            .is_err());
    }

    #[test]
    fn usb_requires_both_sets_to_match() {
        let eval = PermissionEvaluator::new(base_set());
        assert!(eval
            .check(&CapabilityRequest::UsbOpen {
                vendor_id: 0x04a9,
                product_id: 0x220e,
            })
            .is_ok());
        assert!(eval
            .check(&CapabilityRequest::UsbOpen {
                vendor_id: 0x04a9,
                product_id: 0x0c17,
            })
            .is_err());
    }

    #[test]
    fn empty_usb_sets_deny_everything() {
        let mut set = base_set();
        set.usb = Default::default();
        let eval = PermissionEvaluator::new(set);
        assert!(eval
            .check(&CapabilityRequest::UsbOpen {
                vendor_id: 0x04a9,
                product_id: 0x220e,
            })
            .is_err());
    }

    #[test]
    fn heap_accounting_is_cumulative() {
        let eval = PermissionEvaluator::new(base_set()); // 10 MB => 10^7 bytes
        assert!(eval
            .check(&CapabilityRequest::MemoryAlloc { bytes: 6_000_000 })
            .is_ok());
        assert!(eval
            .check(&CapabilityRequest::MemoryAlloc { bytes: 6_000_000 })
            .is_err());
        eval.release(4_000_000);
        assert!(eval
            .check(&CapabilityRequest::MemoryAlloc { bytes: 6_000_000 })
            .is_ok());
        assert_eq!(eval.heap_used(), 8_000_000);
    }

    #[test]
    fn worker_spawn_respects_ceiling() {
        let eval = PermissionEvaluator::new(base_set());
        assert!(eval.check(&CapabilityRequest::WorkerSpawn).is_ok());
        assert!(eval.check(&CapabilityRequest::WorkerSpawn).is_ok());
        assert!(matches!(
            eval.check(&CapabilityRequest::WorkerSpawn),
            Err(PermissionDenied::WorkerLimitReached { limit: 2 })
        ));
        eval.worker_exited();
        assert!(eval.check(&CapabilityRequest::WorkerSpawn).is_ok());
    }

    #[test]
    fn queue_membership_is_exact() {
        let eval = PermissionEvaluator::new(base_set());
        assert!(eval
            .check(&CapabilityRequest::QueuePublish {
                queue: "scanner-jobs".into(),
            })
            .is_ok());
        assert!(eval
            .check(&CapabilityRequest::QueueConsume {
                queue: "other-jobs".into(),
            })
            .is_err());
    }

    proptest::proptest! {
        /// The accounting invariant: no interleaving of grants and
        /// denials can push cumulative usage past the ceiling.
        #[test]
        fn heap_usage_never_exceeds_the_limit(
            requests in proptest::collection::vec(0u64..4_000_000, 1..64)
        ) {
            let eval = PermissionEvaluator::new(base_set()); // 10 MB limit
            for bytes in requests {
                let _ = eval.check(&CapabilityRequest::MemoryAlloc { bytes });
                proptest::prop_assert!(eval.heap_used() <= eval.heap_limit());
            }
        }

        /// Granting a mode never grants more than readwrite would.
        #[test]
        fn fs_decisions_are_monotone_in_mode(suffix in "[a-z]{1,12}") {
            let eval = PermissionEvaluator::new(base_set());
            let path = PathBuf::from(format!("/var/lib/autoweave/scans/{suffix}"));
            for mode in [AccessMode::Read, AccessMode::Write] {
                let narrow = eval.check(&CapabilityRequest::Fs { path: path.clone(), mode });
                let wide = eval.check(&CapabilityRequest::Fs {
                    path: path.clone(),
                    mode: AccessMode::ReadWrite,
                });
                // Anything denied under readwrite must be denied under the
                // narrower request too.
                proptest::prop_assert!(wide.is_ok() || narrow.is_err());
            }
        }
    }

    #[test]
    fn evaluate_from_declaration() {
        let decl: autoweave_manifest::PermissionsDecl = serde_json::from_value(serde_json::json!({
            "usb": { "vendorIds": ["0x04A9"], "productIds": ["0x220E"] },
            "memory": { "maxHeapMB": 64, "maxWorkers": 3 },
            "queues": ["scanner-jobs"]
        }))
        .unwrap();
        let set = PermissionSet::from_declaration(&decl);
        assert!(set.usb.matches(0x04a9, 0x220e));
        assert_eq!(set.memory.max_heap_mb, 64);
        assert!(set.queues.contains("scanner-jobs"));
        assert!(set.filesystem.is_empty());
    }
}
