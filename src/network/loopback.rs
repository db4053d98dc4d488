//! Single-host storage network.
//!
//! The custodian side is a directory (`network_dir/<bag>/<file>`) standing in
//! for the peers that seed a bag, and the local side is `downloads_dir/<bag>/`.
//! Hires are kept in memory and mirrored to `network_dir/hires/<bag>.json`, so
//! a restarted process still knows its custodians. Contract addresses are
//! derived from the bag and custodian key, so the same hire always yields the
//! same address.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    collections::{HashMap, HashSet},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{fs, io::AsyncReadExt, sync::Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use super::{
    AuditReport, BagId, BagStats, CustodianState, NetworkError, NetworkResult, StorageNetwork,
};
use crate::providers::CustodianKey;

/// Proof interval assumed for every loopback contract.
pub const DEFAULT_MAX_SPAN: Duration = Duration::from_secs(24 * 60 * 60);

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const HASH_CHUNK: usize = 64 * 1024;
const PARTIAL_SUFFIX: &str = ".part";
const LEDGER_DIR: &str = "hires";

#[derive(Clone, Debug)]
struct Hire {
    key: CustodianKey,
    contract_addr: String,
    hired_at: DateTime<Utc>,
}

/// On-disk form of one hire.
#[derive(Serialize, Deserialize)]
struct HireRecord {
    custodian: String,
    contract_addr: String,
    hired_at: DateTime<Utc>,
}

impl From<&Hire> for HireRecord {
    fn from(hire: &Hire) -> Self {
        Self {
            custodian: hire.key.to_hex(),
            contract_addr: hire.contract_addr.clone(),
            hired_at: hire.hired_at,
        }
    }
}

impl TryFrom<HireRecord> for Hire {
    type Error = NetworkError;

    fn try_from(record: HireRecord) -> NetworkResult<Self> {
        Ok(Self {
            key: parse_custodian(&record.custodian)?,
            contract_addr: record.contract_addr,
            hired_at: record.hired_at,
        })
    }
}

#[derive(Default)]
struct LoopbackState {
    hires: HashMap<BagId, Vec<Hire>>,
    downloading: HashSet<BagId>,
}

pub struct LoopbackNetwork {
    remote_dir: PathBuf,
    downloads_dir: PathBuf,
    max_span: Duration,
    state: Arc<Mutex<LoopbackState>>,
    /// Serialises ledger writes so files land in the order state changed.
    ledger_writes: AsyncMutex<()>,
}

impl LoopbackNetwork {
    /// Open the network rooted at `remote_dir`, reloading hires recorded by
    /// earlier processes.
    pub fn new(remote_dir: impl Into<PathBuf>, downloads_dir: impl Into<PathBuf>) -> Self {
        let remote_dir = remote_dir.into();
        let hires = load_ledger(&remote_dir.join(LEDGER_DIR));
        if !hires.is_empty() {
            info!(bags = hires.len(), "loopback hires reloaded");
        }
        Self {
            remote_dir,
            downloads_dir: downloads_dir.into(),
            max_span: DEFAULT_MAX_SPAN,
            state: Arc::new(Mutex::new(LoopbackState {
                hires,
                downloading: HashSet::new(),
            })),
            ledger_writes: AsyncMutex::new(()),
        }
    }

    pub fn with_max_span(mut self, max_span: Duration) -> Self {
        self.max_span = max_span;
        self
    }

    fn remote_bag_dir(&self, bag: &BagId) -> PathBuf {
        self.remote_dir.join(bag.to_hex())
    }

    fn local_bag_dir(&self, bag: &BagId) -> PathBuf {
        self.downloads_dir.join(bag.to_hex())
    }

    fn lock(&self) -> NetworkResult<std::sync::MutexGuard<'_, LoopbackState>> {
        self.state
            .lock()
            .map_err(|_| NetworkError::Other("loopback state poisoned".into()))
    }

    fn ledger_path(&self, bag: &BagId) -> PathBuf {
        self.remote_dir
            .join(LEDGER_DIR)
            .join(format!("{}.json", bag.to_hex()))
    }

    /// Write the bag's current hires to disk. Callers hold `ledger_writes`.
    async fn persist_hires(&self, bag: &BagId) -> NetworkResult<()> {
        let records: Vec<HireRecord> = {
            let state = self.lock()?;
            state
                .hires
                .get(bag)
                .map(|hires| hires.iter().map(HireRecord::from).collect())
                .unwrap_or_default()
        };
        let path = self.ledger_path(bag);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(&records)
            .map_err(|err| NetworkError::Other(format!("encoding hires for {bag}: {err}")))?;
        let tmp = path.with_extension(format!("json{PARTIAL_SUFFIX}"));
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    fn find_hire(&self, bag: &BagId, key: &CustodianKey) -> NetworkResult<Option<Hire>> {
        let state = self.lock()?;
        Ok(state
            .hires
            .get(bag)
            .and_then(|hires| hires.iter().find(|h| h.key == *key).cloned()))
    }
}

fn parse_custodian(custodian: &str) -> NetworkResult<CustodianKey> {
    CustodianKey::parse(custodian).map_err(|_| NetworkError::InvalidAddress(custodian.to_string()))
}

/// Read every `<bag>.json` under `dir`. Unreadable files are skipped with a warning.
fn load_ledger(dir: &Path) -> HashMap<BagId, Vec<Hire>> {
    let mut ledger = HashMap::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return ledger;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(bag) = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.parse::<BagId>().ok())
        else {
            continue;
        };

        let loaded = std::fs::read(&path)
            .map_err(NetworkError::from)
            .and_then(|bytes| {
                serde_json::from_slice::<Vec<HireRecord>>(&bytes)
                    .map_err(|err| NetworkError::Other(err.to_string()))
            })
            .and_then(|records| {
                records
                    .into_iter()
                    .map(Hire::try_from)
                    .collect::<NetworkResult<Vec<_>>>()
            });
        match loaded {
            Ok(hires) => {
                ledger.insert(bag, hires);
            }
            Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable hire ledger"),
        }
    }
    ledger
}

fn file_name_of(path: &Path) -> NetworkResult<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| NetworkError::Other(format!("no file name in {}", path.display())))
}

/// Digest over the file name and content, so the same bytes under two names
/// are two bags.
async fn digest_file(path: &Path, name: &str) -> NetworkResult<BagId> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0u8]);

    let mut buf = vec![0u8; HASH_CHUNK];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(BagId::from_bytes(hasher.finalize().into()))
}

fn contract_address(bag: &BagId, key: &CustodianKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bag.as_bytes());
    hasher.update(key.to_hex().as_bytes());
    format!("0:{}", hex::encode(hasher.finalize()))
}

/// Copy into `dest` through a temporary sibling so readers never see a partial file.
async fn copy_atomically(src: &Path, dest: &Path) -> std::io::Result<()> {
    let name = dest.file_name().and_then(|n| n.to_str()).unwrap_or("bag");
    let tmp = dest.with_file_name(format!(".{name}{PARTIAL_SUFFIX}"));
    fs::copy(src, &tmp).await?;
    fs::rename(&tmp, dest).await
}

async fn copy_bag(remote: PathBuf, local: PathBuf) -> std::io::Result<u64> {
    fs::create_dir_all(&local).await?;
    let mut entries = fs::read_dir(&remote).await?;
    let mut copied = 0;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let partial = name.to_string_lossy().ends_with(PARTIAL_SUFFIX);
        if partial || !entry.file_type().await?.is_file() {
            continue;
        }
        let dest = local.join(&name);
        if fs::try_exists(&dest).await? {
            continue;
        }
        copy_atomically(&entry.path(), &dest).await?;
        copied += 1;
    }
    Ok(copied)
}

async fn dir_size(dir: &Path) -> u64 {
    let Ok(mut entries) = fs::read_dir(dir).await else {
        return 0;
    };
    let mut total = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Ok(meta) = entry.metadata().await {
            if meta.is_file() {
                total += meta.len();
            }
        }
    }
    total
}

#[async_trait]
impl StorageNetwork for LoopbackNetwork {
    async fn create_bag(&self, local_path: &Path) -> NetworkResult<BagId> {
        let name = file_name_of(local_path)?;
        let bag = digest_file(local_path, &name).await?;

        let remote = self.remote_bag_dir(&bag);
        fs::create_dir_all(&remote).await?;
        copy_atomically(local_path, &remote.join(&name)).await?;

        let local = self.local_bag_dir(&bag);
        fs::create_dir_all(&local).await?;
        let dest = local.join(&name);
        if fs::rename(local_path, &dest).await.is_err() {
            // staging and downloads may sit on different filesystems
            copy_atomically(local_path, &dest).await?;
            fs::remove_file(local_path).await?;
        }

        info!(bag = %bag, file = %name, "bag created");
        Ok(bag)
    }

    async fn download_bag(&self, bag: &BagId) -> NetworkResult<()> {
        let remote = self.remote_bag_dir(bag);
        if !fs::try_exists(&remote).await? {
            return Err(NetworkError::NotFound(format!("bag {bag} has no seeders")));
        }

        let started = self.lock()?.downloading.insert(*bag);
        if !started {
            debug!(bag = %bag, "download already running");
            return Ok(());
        }

        let local = self.local_bag_dir(bag);
        let state = Arc::clone(&self.state);
        let bag = *bag;
        tokio::spawn(async move {
            match copy_bag(remote, local).await {
                Ok(files) => info!(bag = %bag, files, "bag downloaded"),
                Err(err) => warn!(bag = %bag, error = %err, "bag download failed"),
            }
            if let Ok(mut state) = state.lock() {
                state.downloading.remove(&bag);
            }
        });
        Ok(())
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
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.map_err(|_| {
            NetworkError::Timeout(format!(
                "{name} in bag {bag} not available after {}s",
                timeout.as_secs()
            ))
        })
    }

    async fn local_file(&self, bag: &BagId, name: &str) -> Option<PathBuf> {
        let path = self.local_bag_dir(bag).join(name);
        match fs::try_exists(&path).await {
            Ok(true) => Some(path),
            _ => None,
        }
    }

    async fn audit_custodian(&self, bag: &BagId, custodian: &str) -> NetworkResult<AuditReport> {
        let key = parse_custodian(custodian)?;
        let Some(hire) = self.find_hire(bag, &key)? else {
            return Ok(AuditReport::missing());
        };

        let now = Utc::now();
        let seeded = fs::try_exists(self.remote_bag_dir(bag)).await?;
        let (last_proof_at, reported) = if seeded {
            (now, CustodianState::active())
        } else {
            (
                hire.hired_at,
                CustodianState {
                    status: "downloading".into(),
                    reason: "custodian has not stored the bag yet".into(),
                },
            )
        };

        Ok(AuditReport::assess(
            last_proof_at,
            self.max_span,
            now,
            Ok(reported),
        ))
    }

    async fn ping_custodian(&self, bag: &BagId, custodian: &str) -> NetworkResult<()> {
        let key = parse_custodian(custodian)?;
        if self.find_hire(bag, &key)?.is_none() {
            return Err(NetworkError::Unreachable(format!(
                "{custodian} does not serve bag {bag}"
            )));
        }
        if !fs::try_exists(self.remote_bag_dir(bag)).await? {
            return Err(NetworkError::Unreachable(format!("bag {bag} has no seeders")));
        }
        Ok(())
    }

    async fn hire_custodian(
        &self,
        bag: &BagId,
        custodian: &str,
        amount_nano: u64,
    ) -> NetworkResult<String> {
        let key = parse_custodian(custodian)?;
        if amount_nano == 0 {
            return Err(NetworkError::Rejected("escrow amount must be positive".into()));
        }
        if !fs::try_exists(self.remote_bag_dir(bag)).await? {
            return Err(NetworkError::NotFound(format!("bag {bag} has no seeders")));
        }

        let contract_addr = contract_address(bag, &key);
        let _guard = self.ledger_writes.lock().await;
        let added = {
            let mut state = self.lock()?;
            let hires = state.hires.entry(*bag).or_default();
            let added = !hires.iter().any(|h| h.key == key);
            if added {
                hires.push(Hire {
                    key,
                    contract_addr: contract_addr.clone(),
                    hired_at: Utc::now(),
                });
            }
            added
        };
        if added {
            self.persist_hires(bag).await?;
        }
        Ok(contract_addr)
    }

    async fn remove_custodian(&self, bag: &BagId, custodian: &str) -> NetworkResult<String> {
        let key = parse_custodian(custodian)?;
        let _guard = self.ledger_writes.lock().await;
        let removed = {
            let mut state = self.lock()?;
            let hires = state.hires.entry(*bag).or_default();
            let Some(pos) = hires.iter().position(|h| h.key == key) else {
                return Err(NetworkError::NotFound(format!(
                    "{custodian} holds no contract for bag {bag}"
                )));
            };
            hires.remove(pos)
        };
        self.persist_hires(bag).await?;

        let mut hasher = Sha256::new();
        hasher.update(b"remove");
        hasher.update(removed.contract_addr.as_bytes());
        hasher.update(Utc::now().timestamp_nanos_opt().unwrap_or_default().to_be_bytes());
        Ok(hex::encode(hasher.finalize()))
    }

    async fn delete_local_copy(&self, bag: &BagId) -> NetworkResult<()> {
        match fs::remove_dir_all(self.local_bag_dir(bag)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn bag_stats(&self, bag: &BagId) -> NetworkResult<BagStats> {
        let (peers, downloading) = {
            let state = self.lock()?;
            (
                state.hires.get(bag).map_or(0, Vec::len),
                state.downloading.contains(bag),
            )
        };
        let local = self.local_bag_dir(bag);
        let downloaded = dir_size(&local).await;
        let present = fs::try_exists(&local).await.unwrap_or(false);

        Ok(BagStats {
            upload_speed: 0,
            uploaded_total: 0,
            peers,
            active: fs::try_exists(self.remote_bag_dir(bag)).await?,
            downloaded,
            completed: present && !downloading,
        })
    }
}
