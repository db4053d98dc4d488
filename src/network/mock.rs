//! Scriptable in-memory network for tests.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use super::{AuditReport, BagId, BagStats, NetworkError, NetworkResult, StorageNetwork};

#[derive(Default)]
pub struct MockState {
    /// Audit verdicts by custodian; unscripted custodians audit healthy.
    pub audits: HashMap<String, AuditReport>,
    /// Custodians whose audit call fails with a transient error.
    pub audit_errors: HashSet<String>,
    pub failing_hires: HashSet<String>,
    pub failing_removals: bool,
    pub failing_deletes: bool,
    pub unreachable: HashSet<String>,

    /// Bytes the network can serve, keyed by bag and file name.
    pub remote_files: HashMap<(BagId, String), Vec<u8>>,
    pub local_files: HashMap<(BagId, String), PathBuf>,

    pub hires: Vec<(BagId, String, u64)>,
    pub removals: Vec<(BagId, String)>,
    pub deletions: Vec<BagId>,
    pub downloads: Vec<BagId>,
    pub pings: Vec<String>,
}

pub struct MockNetwork {
    dir: PathBuf,
    state: Mutex<MockState>,
}

impl MockNetwork {
    /// `dir` receives files materialised by `download_bag`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn script_audit(&self, custodian: &str, report: AuditReport) {
        self.state().audits.insert(custodian.to_string(), report);
    }

    pub fn fail_hire(&self, custodian: &str) {
        self.state().failing_hires.insert(custodian.to_string());
    }

    /// Make `name` in `bag` retrievable from the network.
    pub fn seed_remote(&self, bag: BagId, name: &str, bytes: &[u8]) {
        self.state()
            .remote_files
            .insert((bag, name.to_string()), bytes.to_vec());
    }

    pub fn hired_custodians(&self) -> Vec<String> {
        self.state().hires.iter().map(|(_, c, _)| c.clone()).collect()
    }

    pub fn removed_custodians(&self) -> Vec<String> {
        self.state().removals.iter().map(|(_, c)| c.clone()).collect()
    }

    fn materialise(&self, bag: &BagId) -> NetworkResult<()> {
        let mut state = self.state();
        let pending: Vec<(String, Vec<u8>)> = state
            .remote_files
            .iter()
            .filter(|((b, _), _)| b == bag)
            .map(|((_, name), bytes)| (name.clone(), bytes.clone()))
            .collect();

        for (name, bytes) in pending {
            let dir = self.dir.join(bag.to_hex());
            std::fs::create_dir_all(&dir)?;
            let path = dir.join(&name);
            std::fs::write(&path, bytes)?;
            state.local_files.insert((*bag, name), path);
        }
        Ok(())
    }
}

#[async_trait]
impl StorageNetwork for MockNetwork {
    async fn create_bag(&self, local_path: &Path) -> NetworkResult<BagId> {
        let bytes = std::fs::read(local_path)?;
        let name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let bag = BagId::from_bytes(Sha256::digest(&bytes).into());

        let mut state = self.state();
        state.remote_files.insert((bag, name.clone()), bytes);
        state.local_files.insert((bag, name), local_path.to_path_buf());
        Ok(bag)
    }

    async fn download_bag(&self, bag: &BagId) -> NetworkResult<()> {
        self.state().downloads.push(*bag);
        self.materialise(bag)
    }

    async fn wait_for_file(
        &self,
        bag: &BagId,
        name: &str,
        timeout: Duration,
    ) -> NetworkResult<PathBuf> {
        let poll = async {
            loop {
                if let Some(path) = self.local_file(bag, name).await {
                    return path;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| NetworkError::Timeout(format!("{name} not available")))
    }

    async fn local_file(&self, bag: &BagId, name: &str) -> Option<PathBuf> {
        self.state()
            .local_files
            .get(&(*bag, name.to_string()))
            .cloned()
    }

    async fn audit_custodian(&self, _bag: &BagId, custodian: &str) -> NetworkResult<AuditReport> {
        let state = self.state();
        if state.audit_errors.contains(custodian) {
            return Err(NetworkError::Unreachable(custodian.to_string()));
        }
        Ok(state
            .audits
            .get(custodian)
            .cloned()
            .unwrap_or_else(|| AuditReport::healthy(Some(Duration::from_secs(30)))))
    }

    async fn ping_custodian(&self, _bag: &BagId, custodian: &str) -> NetworkResult<()> {
        let mut state = self.state();
        state.pings.push(custodian.to_string());
        if state.unreachable.contains(custodian) {
            return Err(NetworkError::Unreachable(custodian.to_string()));
        }
        Ok(())
    }

    async fn hire_custodian(
        &self,
        bag: &BagId,
        custodian: &str,
        amount_nano: u64,
    ) -> NetworkResult<String> {
        let mut state = self.state();
        if state.failing_hires.contains(custodian) {
            return Err(NetworkError::Rejected(format!("{custodian} refused the offer")));
        }
        state.hires.push((*bag, custodian.to_string(), amount_nano));
        Ok(format!("contract-{custodian}-{}", state.hires.len()))
    }

    async fn remove_custodian(&self, bag: &BagId, custodian: &str) -> NetworkResult<String> {
        let mut state = self.state();
        state.removals.push((*bag, custodian.to_string()));
        if state.failing_removals {
            return Err(NetworkError::Rejected("escrow already drained".into()));
        }
        Ok(format!("tx-remove-{custodian}"))
    }

    async fn delete_local_copy(&self, bag: &BagId) -> NetworkResult<()> {
        let mut state = self.state();
        state.deletions.push(*bag);
        if state.failing_deletes {
            return Err(NetworkError::Other("disk busy".into()));
        }
        state.local_files.retain(|(b, _), _| b != bag);
        Ok(())
    }

    async fn bag_stats(&self, bag: &BagId) -> NetworkResult<BagStats> {
        let state = self.state();
        Ok(BagStats {
            peers: state.hires.iter().filter(|(b, _, _)| b == bag).count(),
            completed: state.local_files.keys().any(|(b, _)| b == bag),
            ..BagStats::default()
        })
    }
}
