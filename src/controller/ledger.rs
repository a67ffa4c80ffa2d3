//! Generation Ledger
//!
//! Durable record of every child object the operator produced: the parent
//! that owns it, the generation the store reported after the last apply, and
//! the last generation observed as accepted by the cluster (for node
//! DaemonSets, rolled out to every node).
//!
//! Every mutation is persisted through a [`LedgerBackend`] before it returns,
//! so an operator restart between an apply and the following status write
//! neither repeats nor loses work.

use crate::crd::GenerationHistory;
use crate::domain::ports::{ObjectIdentity, ObjectKind, ParentKey};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Records
// =============================================================================

/// One ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildResourceRecord {
    pub child: ObjectIdentity,
    pub parent: ParentKey,
    /// Generation returned by the store after the last apply; 0 while the
    /// child is pending creation
    pub applied_generation: i64,
    /// Last generation observed as accepted by the cluster
    pub observed_generation: i64,
}

impl ChildResourceRecord {
    /// Recorded but not yet confirmed created
    pub fn is_pending(&self) -> bool {
        self.applied_generation == 0
    }

    /// Applied generation not yet accepted
    pub fn is_settling(&self) -> bool {
        !self.is_pending() && self.observed_generation < self.applied_generation
    }

    /// Status form of this record
    pub fn to_history(&self) -> GenerationHistory {
        GenerationHistory {
            group: self.child.kind.group().to_string(),
            resource: self.child.kind.as_str().to_string(),
            namespace: self.child.namespace.clone(),
            name: self.child.name.clone(),
            last_generation: self.applied_generation,
        }
    }
}

// =============================================================================
// Backends
// =============================================================================

/// Durable storage behind the ledger
pub trait LedgerBackend: Send + Sync {
    /// Load every persisted record
    fn load(&self) -> Result<Vec<ChildResourceRecord>>;

    /// Replace the persisted records
    fn persist(&self, records: &[ChildResourceRecord]) -> Result<()>;
}

/// Backend that keeps the last persisted snapshot in memory
#[derive(Default)]
pub struct MemoryLedgerBackend {
    snapshot: RwLock<Vec<ChildResourceRecord>>,
}

impl MemoryLedgerBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerBackend for MemoryLedgerBackend {
    fn load(&self) -> Result<Vec<ChildResourceRecord>> {
        Ok(self.snapshot.read().clone())
    }

    fn persist(&self, records: &[ChildResourceRecord]) -> Result<()> {
        *self.snapshot.write() = records.to_vec();
        Ok(())
    }
}

/// Backend writing a JSON file, replaced atomically on every change
pub struct FileLedgerBackend {
    path: PathBuf,
}

impl FileLedgerBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LedgerBackend for FileLedgerBackend {
    fn load(&self) -> Result<Vec<ChildResourceRecord>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn persist(&self, records: &[ChildResourceRecord]) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(records)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

// =============================================================================
// Ledger
// =============================================================================

/// Child generation ledger, keyed by child identity
pub struct GenerationLedger {
    records: RwLock<BTreeMap<ObjectIdentity, ChildResourceRecord>>,
    backend: Arc<dyn LedgerBackend>,
}

impl GenerationLedger {
    /// Open a ledger, loading whatever the backend holds
    pub fn open(backend: Arc<dyn LedgerBackend>) -> Result<Arc<Self>> {
        let loaded = backend.load()?;
        info!(records = loaded.len(), "Generation ledger loaded");
        let records = loaded
            .into_iter()
            .map(|r| (r.child.clone(), r))
            .collect();
        Ok(Arc::new(Self {
            records: RwLock::new(records),
            backend,
        }))
    }

    /// Ledger without durable storage
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self {
            records: RwLock::new(BTreeMap::new()),
            backend: Arc::new(MemoryLedgerBackend::new()),
        })
    }

    /// Apply a mutation to a copy of the records, persist it, then publish
    /// it. The in-memory view never gets ahead of the backend.
    fn mutate<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut BTreeMap<ObjectIdentity, ChildResourceRecord>) -> bool,
    {
        let mut records = self.records.write();
        let mut next = records.clone();
        if f(&mut next) {
            let snapshot: Vec<_> = next.values().cloned().collect();
            self.backend
                .persist(&snapshot)
                .map_err(|e| Error::Ledger(format!("persist failed: {}", e)))?;
            *records = next;
        }
        Ok(())
    }

    /// Note a child about to be created
    pub fn mark_pending(&self, parent: &ParentKey, child: &ObjectIdentity) -> Result<()> {
        self.mutate(|records| {
            if records.contains_key(child) {
                return false;
            }
            records.insert(
                child.clone(),
                ChildResourceRecord {
                    child: child.clone(),
                    parent: parent.clone(),
                    applied_generation: 0,
                    observed_generation: 0,
                },
            );
            true
        })
    }

    /// Record the generation the store returned after an apply
    pub fn record(&self, parent: &ParentKey, child: &ObjectIdentity, applied_generation: i64) -> Result<()> {
        self.mutate(|records| {
            let entry = records
                .entry(child.clone())
                .or_insert_with(|| ChildResourceRecord {
                    child: child.clone(),
                    parent: parent.clone(),
                    applied_generation: 0,
                    observed_generation: 0,
                });
            if entry.applied_generation == applied_generation && &entry.parent == parent {
                return false;
            }
            debug!(
                child = %child,
                from = entry.applied_generation,
                to = applied_generation,
                "Recorded applied generation"
            );
            entry.parent = parent.clone();
            entry.applied_generation = applied_generation;
            true
        })
    }

    /// Record that the cluster accepted a generation
    pub fn mark_observed(&self, child: &ObjectIdentity, generation: i64) -> Result<()> {
        self.mutate(|records| match records.get_mut(child) {
            Some(entry) if entry.observed_generation != generation => {
                entry.observed_generation = generation;
                true
            }
            _ => false,
        })
    }

    /// Last generation observed as accepted by the cluster
    pub fn observed(&self, child: &ObjectIdentity) -> Option<i64> {
        self.records
            .read()
            .get(child)
            .filter(|r| !r.is_pending())
            .map(|r| r.observed_generation)
    }

    pub fn get(&self, child: &ObjectIdentity) -> Option<ChildResourceRecord> {
        self.records.read().get(child).cloned()
    }

    /// Records owned by a parent, ordered by child identity
    pub fn children_of(&self, parent: &ParentKey) -> Vec<ChildResourceRecord> {
        self.records
            .read()
            .values()
            .filter(|r| &r.parent == parent)
            .cloned()
            .collect()
    }

    /// Every parent with at least one record
    pub fn parents(&self) -> Vec<ParentKey> {
        let parents: std::collections::BTreeSet<ParentKey> =
            self.records.read().values().map(|r| r.parent.clone()).collect();
        parents.into_iter().collect()
    }

    /// Drop a record after its object is confirmed deleted
    pub fn forget(&self, child: &ObjectIdentity) -> Result<()> {
        self.mutate(|records| records.remove(child).is_some())
    }

    /// Seed records from a parent's persisted status for children the ledger
    /// does not know. Returns how many records were added.
    pub fn restore(
        &self,
        parent: &ParentKey,
        history: &[GenerationHistory],
        rollout_pending: bool,
    ) -> Result<usize> {
        let mut added = 0;
        self.mutate(|records| {
            for entry in history {
                let Some(kind) = ObjectKind::from_kind(&entry.resource) else {
                    continue;
                };
                let child = ObjectIdentity::new(kind, &entry.namespace, &entry.name);
                if records.contains_key(&child) {
                    continue;
                }
                // An interrupted node rollout has to run again
                let observed = if rollout_pending && kind == ObjectKind::DaemonSet {
                    0
                } else {
                    entry.last_generation
                };
                records.insert(
                    child.clone(),
                    ChildResourceRecord {
                        child,
                        parent: parent.clone(),
                        applied_generation: entry.last_generation,
                        observed_generation: observed,
                    },
                );
                added += 1;
            }
            added > 0
        })?;
        if added > 0 {
            info!(parent = %parent, added, "Restored ledger records from status");
        }
        Ok(added)
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::ProvisionerKind;

    fn parent() -> ParentKey {
        ParentKey::new(ProvisionerKind::CsiDriverDeployment, "storage", "nfs")
    }

    fn child() -> ObjectIdentity {
        ObjectIdentity::new(ObjectKind::DaemonSet, "storage", "nfs-csi-node")
    }

    #[test]
    fn test_pending_then_recorded() {
        let ledger = GenerationLedger::in_memory();
        ledger.mark_pending(&parent(), &child()).unwrap();
        assert!(ledger.get(&child()).unwrap().is_pending());
        assert_eq!(ledger.observed(&child()), None);

        ledger.record(&parent(), &child(), 1).unwrap();
        ledger.mark_observed(&child(), 1).unwrap();
        assert_eq!(ledger.observed(&child()), Some(1));

        ledger.record(&parent(), &child(), 2).unwrap();
        let record = ledger.get(&child()).unwrap();
        assert!(record.is_settling());
        assert_eq!(ledger.observed(&child()), Some(1));
    }

    #[test]
    fn test_forget() {
        let ledger = GenerationLedger::in_memory();
        ledger.record(&parent(), &child(), 3).unwrap();
        assert_eq!(ledger.children_of(&parent()).len(), 1);
        assert_eq!(ledger.parents(), vec![parent()]);
        ledger.forget(&child()).unwrap();
        assert!(ledger.is_empty());
        assert!(ledger.parents().is_empty());
        assert!(ledger.children_of(&parent()).is_empty());
    }

    #[test]
    fn test_file_backend_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("ledger.json");

        {
            let ledger = GenerationLedger::open(Arc::new(FileLedgerBackend::new(&path))).unwrap();
            ledger.record(&parent(), &child(), 4).unwrap();
            ledger.mark_observed(&child(), 4).unwrap();
        }

        let reopened = GenerationLedger::open(Arc::new(FileLedgerBackend::new(&path))).unwrap();
        let record = reopened.get(&child()).unwrap();
        assert_eq!(record.applied_generation, 4);
        assert_eq!(record.observed_generation, 4);
        assert_eq!(record.parent, parent());
    }

    #[test]
    fn test_restore_from_status() {
        let ledger = GenerationLedger::in_memory();
        let history = vec![
            ledger_history("DaemonSet", "storage", "nfs-csi-node", 5),
            ledger_history("Deployment", "storage", "nfs-csi-controller", 2),
            ledger_history("ConfigMap", "storage", "ignored", 1),
        ];
        let added = ledger.restore(&parent(), &history, true).unwrap();
        assert_eq!(added, 2);
        assert_eq!(ledger.observed(&child()), Some(0));
        assert_eq!(
            ledger.observed(&ObjectIdentity::new(ObjectKind::Deployment, "storage", "nfs-csi-controller")),
            Some(2)
        );

        // Existing records win over status
        assert_eq!(ledger.restore(&parent(), &history, false).unwrap(), 0);
    }

    /// Backend that can be switched into failing every write
    #[derive(Default)]
    struct FailingBackend {
        inner: MemoryLedgerBackend,
        failing: std::sync::atomic::AtomicBool,
    }

    impl LedgerBackend for FailingBackend {
        fn load(&self) -> Result<Vec<ChildResourceRecord>> {
            self.inner.load()
        }

        fn persist(&self, records: &[ChildResourceRecord]) -> Result<()> {
            if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "no space left on device",
                )));
            }
            self.inner.persist(records)
        }
    }

    #[test]
    fn test_failed_persist_leaves_records_unchanged() {
        let backend = Arc::new(FailingBackend::default());
        let ledger = GenerationLedger::open(backend.clone()).unwrap();
        ledger.record(&parent(), &child(), 1).unwrap();
        ledger.mark_observed(&child(), 1).unwrap();
        let before = ledger.get(&child()).unwrap();

        backend
            .failing
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let err = ledger.record(&parent(), &child(), 2).unwrap_err();
        assert!(matches!(err, Error::Ledger(_)));
        assert!(ledger.mark_observed(&child(), 2).is_err());
        assert!(ledger.forget(&child()).is_err());
        assert_eq!(ledger.get(&child()), Some(before.clone()));
        assert_eq!(ledger.observed(&child()), Some(1));

        // Memory and backend agree once writes succeed again
        backend
            .failing
            .store(false, std::sync::atomic::Ordering::SeqCst);
        ledger.record(&parent(), &child(), 2).unwrap();
        assert_eq!(backend.inner.load().unwrap()[0].applied_generation, 2);
    }

    fn ledger_history(kind: &str, ns: &str, name: &str, gen: i64) -> GenerationHistory {
        GenerationHistory {
            group: String::new(),
            resource: kind.into(),
            namespace: ns.into(),
            name: name.into(),
            last_generation: gen,
        }
    }
}
