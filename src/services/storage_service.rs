//! src/services/storage_service.rs
//!
//! StorageService: the operations the S3 and admin surfaces call. Uploads are
//! staged on disk, turned into bags and recorded as `pending` objects; the
//! loops take it from there. Reads go through the restore tracker, so an
//! offloaded object is fetched back from its custodians transparently.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use rand::{SeedableRng, rngs::StdRng};
use serde::Serialize;
use std::{
    collections::BTreeSet,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    daemons::replicator::{BASE_ESCROW_NANO, HireError, hire_one},
    db::{StateStore, StoreError},
    models::{
        bucket::Bucket,
        contract::{Contract, ContractStatus, ContractWithBag},
        download::DownloadJob,
        object::{NewObject, Object, ObjectStatus},
    },
    network::{AuditReport, BagId, BagStats, NetworkError, StorageNetwork},
    providers::ProviderDirectory,
    services::restore::{RestoreError, RestoreTracker},
};

#[derive(Clone, Debug)]
pub struct ListObjectsParams {
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    pub continuation_token: Option<String>,
    pub start_after: Option<String>,
    pub max_keys: usize,
}

#[derive(Debug)]
pub struct ListObjectsResult {
    pub objects: Vec<Object>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
    pub key_count: usize,
}

/// One object with everything the admin surface shows about it.
#[derive(Debug, Serialize)]
pub struct ObjectDetails {
    #[serde(flatten)]
    pub object: Object,
    pub active_replicas: usize,
    pub contracts: Vec<Contract>,
    pub restoring: bool,
}

#[derive(Debug, Serialize)]
pub struct Withdrawal {
    pub contract_id: i64,
    pub tx_hash: String,
    pub object_downgraded: bool,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{0}` already exists")]
    BucketAlreadyExists(String),
    #[error("bucket `{0}` is not empty")]
    BucketNotEmpty(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("object `{key}` already exists in bucket `{bucket}`")]
    ObjectAlreadyExists { bucket: String, key: String },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("replica count must be between 1 and 16, got {0}")]
    InvalidReplicas(i64),
    #[error("Content-MD5 does not match the uploaded bytes")]
    BadDigest,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Restore(#[from] RestoreError),
    #[error(transparent)]
    Hire(#[from] HireError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
pub const MAX_REPLICAS: i64 = 16;

#[derive(Clone)]
pub struct StorageService {
    pub store: StateStore,
    pub network: Arc<dyn StorageNetwork>,
    pub providers: Arc<ProviderDirectory>,
    pub restore: RestoreTracker,

    /// Uploads are written here before they become bags.
    pub staging_dir: PathBuf,

    /// Target replica count when the upload does not ask for one.
    pub default_replicas: i64,
}

impl StorageService {
    pub fn new(
        store: StateStore,
        network: Arc<dyn StorageNetwork>,
        providers: Arc<ProviderDirectory>,
        restore: RestoreTracker,
        staging_dir: impl Into<PathBuf>,
        default_replicas: i64,
    ) -> Self {
        Self {
            store,
            network,
            providers,
            restore,
            staging_dir: staging_dir.into(),
            default_replicas,
        }
    }

    /// Reject empty or oversized keys, absolute paths, `..` and control bytes.
    fn ensure_key_safe(&self, key: &str) -> StorageResult<()> {
        let unsafe_key = key.is_empty()
            || key.len() > MAX_OBJECT_KEY_LEN
            || key.starts_with('/')
            || key.ends_with('/')
            || key.contains("..")
            || key.bytes().any(|b| b.is_ascii_control() || b == b'\\');
        if unsafe_key {
            return Err(StorageError::InvalidObjectKey);
        }
        Ok(())
    }

    /// S3 bucket naming rules.
    fn ensure_bucket_name_safe(&self, name: &str) -> StorageResult<()> {
        let invalid = |reason: &str| {
            Err(StorageError::InvalidBucketName {
                name: name.to_string(),
                reason: reason.to_string(),
            })
        };

        if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&name.len()) {
            return invalid("must be between 3 and 63 characters");
        }
        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return invalid("allowed characters are lowercase letters, digits, dots, and hyphens");
        }
        let edges = [name.chars().next(), name.chars().last()];
        if edges.iter().any(|c| matches!(c, Some('.') | Some('-'))) {
            return invalid("must start and end with a lowercase letter or digit");
        }
        if name.contains("..") || name.contains("-.") || name.contains(".-") {
            return invalid("cannot contain consecutive dots or dot-hyphen combinations");
        }
        if is_ipv4_like(name) {
            return invalid("must not be formatted like an IP address");
        }
        Ok(())
    }

    async fn ensure_bucket(&self, bucket: &str) -> StorageResult<()> {
        self.ensure_bucket_name_safe(bucket)?;
        if !self.store.bucket_exists(bucket).await? {
            return Err(StorageError::BucketNotFound(bucket.to_string()));
        }
        Ok(())
    }

    async fn fetch_object(&self, bucket: &str, key: &str) -> StorageResult<Object> {
        self.store
            .find_object(bucket, key)
            .await
            .map_err(|err| match err {
                StoreError::NotFound { .. } => StorageError::ObjectNotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                },
                other => other.into(),
            })
    }

    /// Live (non-deleted) object by id.
    async fn live_object(&self, object_id: i64) -> StorageResult<Object> {
        let object = self.store.get_object(object_id).await?;
        if object.status == ObjectStatus::Deleted {
            return Err(StoreError::not_found("object", object_id).into());
        }
        Ok(object)
    }

    fn bag_of(object: &Object) -> StorageResult<BagId> {
        object
            .bag()
            .map_err(|err| StoreError::Integrity(format!("object {}: {err}", object.id)).into())
    }

    pub async fn create_bucket(&self, name: &str) -> StorageResult<Bucket> {
        self.ensure_bucket_name_safe(name)?;
        self.store.create_bucket(name).await.map_err(|err| match err {
            StoreError::AlreadyExists(_) => StorageError::BucketAlreadyExists(name.to_string()),
            other => other.into(),
        })
    }

    pub async fn list_buckets(&self) -> StorageResult<Vec<Bucket>> {
        Ok(self.store.list_buckets().await?)
    }

    /// Only empty buckets can be deleted.
    pub async fn delete_bucket(&self, name: &str) -> StorageResult<()> {
        self.ensure_bucket_name_safe(name)?;
        if self.store.count_live_objects(name).await? > 0 {
            return Err(StorageError::BucketNotEmpty(name.to_string()));
        }
        self.store.delete_bucket(name).await.map_err(|err| match err {
            StoreError::NotFound { .. } => StorageError::BucketNotFound(name.to_string()),
            other => other.into(),
        })
    }

    /// Stage an upload, turn it into a bag and record it as a pending object.
    ///
    /// - Streams into `staging_dir/<uuid>/<file name>`, hashing as it goes.
    /// - Verifies `Content-MD5` when given (base64 of the raw digest).
    /// - Rejects keys that already hold a live object.
    pub async fn upload_object_stream<S>(
        &self,
        bucket: &str,
        key: &str,
        replicas: Option<i64>,
        content_md5: Option<&str>,
        stream: S,
    ) -> StorageResult<Object>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.ensure_key_safe(key)?;
        self.ensure_bucket(bucket).await?;

        let target_replicas = replicas.unwrap_or(self.default_replicas);
        if !(1..=MAX_REPLICAS).contains(&target_replicas) {
            return Err(StorageError::InvalidReplicas(target_replicas));
        }

        match self.store.find_object(bucket, key).await {
            Ok(_) => {
                return Err(StorageError::ObjectAlreadyExists {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                });
            }
            Err(StoreError::NotFound { .. }) => {}
            Err(err) => return Err(err.into()),
        }

        let staging = self.staging_dir.join(Uuid::new_v4().to_string());
        fs::create_dir_all(&staging).await?;
        let file_name = key.rsplit('/').next().unwrap_or(key);
        let staged_path = staging.join(file_name);

        let result = self
            .stage_and_record(bucket, key, target_replicas, content_md5, &staged_path, stream)
            .await;

        if let Err(err) = fs::remove_dir_all(&staging).await {
            if err.kind() != io::ErrorKind::NotFound {
                debug!("failed to remove staging directory {}: {}", staging.display(), err);
            }
        }
        result
    }

    async fn stage_and_record<S>(
        &self,
        bucket: &str,
        key: &str,
        target_replicas: i64,
        content_md5: Option<&str>,
        staged_path: &Path,
        stream: S,
    ) -> StorageResult<Object>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let mut file = File::create(staged_path).await?;
        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            size_bytes += chunk.len() as i64;
            digest.consume(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Some(expected) = content_md5 {
            let computed = digest.compute();
            let matches = STANDARD
                .decode(expected.trim())
                .is_ok_and(|raw| raw.as_slice() == computed.0.as_slice());
            if !matches {
                return Err(StorageError::BadDigest);
            }
        }

        let bag = self.network.create_bag(staged_path).await?;
        let object = self
            .store
            .create_object(&NewObject {
                bucket_name: bucket.to_string(),
                object_key: key.to_string(),
                bag_id: bag,
                size_bytes,
                target_replicas,
            })
            .await
            .map_err(|err| match err {
                StoreError::AlreadyExists(_) => StorageError::ObjectAlreadyExists {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                },
                other => other.into(),
            })?;

        info!(
            object_id = object.id,
            bag = %bag,
            size_bytes,
            target_replicas,
            "object uploaded"
        );
        Ok(object)
    }

    /// Open an object for reading, restoring it from custodians if it was offloaded.
    pub async fn get_object_reader(&self, bucket: &str, key: &str) -> StorageResult<(Object, File)> {
        self.ensure_key_safe(key)?;
        self.ensure_bucket(bucket).await?;
        let object = self.fetch_object(bucket, key).await?;

        let path = self.restore.fetch(&object).await?;
        let file = self.open_or_restore(&object, &path).await?;
        Ok((object, file))
    }

    /// Open a path returned by the restore tracker. The cleaner may remove the
    /// local copy in between, so a missing file gets one more restore.
    async fn open_or_restore(&self, object: &Object, path: &Path) -> StorageResult<File> {
        match File::open(path).await {
            Ok(file) => Ok(file),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(object_id = object.id, "local copy vanished before open, restoring again");
                let path = self.restore.fetch(object).await?;
                Ok(File::open(&path).await?)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_object_metadata(&self, bucket: &str, key: &str) -> StorageResult<Object> {
        self.ensure_key_safe(key)?;
        self.ensure_bucket(bucket).await?;
        self.fetch_object(bucket, key).await
    }

    /// ListObjectsV2: prefix filter, delimiter grouping and key continuation.
    pub async fn list_objects_v2(
        &self,
        bucket: &str,
        params: ListObjectsParams,
    ) -> StorageResult<ListObjectsResult> {
        self.ensure_bucket(bucket).await?;
        let max_keys = params.max_keys.clamp(1, 1000);
        let fetch_limit = max_keys + 1;

        let after = params
            .continuation_token
            .as_deref()
            .or(params.start_after.as_deref());
        let mut rows = self
            .store
            .list_bucket_objects(bucket, params.prefix.as_deref(), after, fetch_limit as i64)
            .await?;

        let mut is_truncated = false;
        let mut next_continuation_token = None;
        if rows.len() == fetch_limit {
            rows.pop();
            next_continuation_token = rows.last().map(|o| o.object_key.clone());
            is_truncated = true;
        }

        let mut contents = Vec::new();
        let mut common_prefixes = BTreeSet::new();
        for obj in rows {
            if let Some(delim) = &params.delimiter {
                if let Some(prefix) =
                    compute_common_prefix(&obj.object_key, params.prefix.as_deref(), delim)
                {
                    common_prefixes.insert(prefix);
                    continue;
                }
            }
            contents.push(obj);
        }

        let key_count = contents.len() + common_prefixes.len();
        Ok(ListObjectsResult {
            objects: contents,
            common_prefixes: common_prefixes.into_iter().collect(),
            is_truncated,
            next_continuation_token,
            key_count,
        })
    }

    pub async fn delete_object(&self, bucket: &str, key: &str) -> StorageResult<Object> {
        self.ensure_key_safe(key)?;
        self.ensure_bucket(bucket).await?;
        let object = self.fetch_object(bucket, key).await?;
        self.remove_object(&object).await?;
        Ok(object)
    }

    pub async fn delete_object_by_id(&self, object_id: i64) -> StorageResult<Object> {
        let object = self.live_object(object_id).await?;
        self.remove_object(&object).await?;
        Ok(object)
    }

    /// Drop the local copy and release live custodians, both best-effort, then
    /// soft-delete the object and fail its live contracts. A bag still
    /// referenced by another live object keeps its files and custodians.
    async fn remove_object(&self, object: &Object) -> StorageResult<()> {
        let siblings = self
            .store
            .count_live_objects_with_bag(&object.bag_id, object.id)
            .await?;
        match object.bag() {
            Ok(_) if siblings > 0 => {
                debug!(
                    object_id = object.id,
                    bag = %object.bag_id,
                    siblings,
                    "bag shared with live objects, keeping local copy and custodians"
                );
            }
            Ok(bag) => {
                if let Err(err) = self.network.delete_local_copy(&bag).await {
                    warn!(object_id = object.id, error = %err, "failed to delete local copy");
                }
                for contract in self.store.object_contracts(object.id).await? {
                    if contract.status == ContractStatus::Failed {
                        continue;
                    }
                    if let Err(err) = self
                        .network
                        .remove_custodian(&bag, &contract.provider_addr)
                        .await
                    {
                        warn!(
                            object_id = object.id,
                            contract_id = contract.id,
                            error = %err,
                            "failed to remove custodian"
                        );
                    }
                }
            }
            Err(err) => warn!(object_id = object.id, error = %err, "object has malformed bag id"),
        }

        if !self.store.delete_object(object.id).await? {
            return Err(StorageError::ObjectNotFound {
                bucket: object.bucket_name.clone(),
                key: object.object_key.clone(),
            });
        }
        info!(object_id = object.id, "object deleted");
        Ok(())
    }

    pub async fn list_all_objects(&self, limit: i64, offset: i64) -> StorageResult<Vec<Object>> {
        Ok(self.store.list_objects(limit.clamp(1, 1000), offset.max(0)).await?)
    }

    pub async fn object_details(&self, object_id: i64) -> StorageResult<ObjectDetails> {
        let object = self.store.get_object(object_id).await?;
        let contracts = self.store.object_contracts(object_id).await?;
        let restoring = self.store.is_object_downloading(object_id).await?;
        let active_replicas = contracts
            .iter()
            .filter(|c| c.status == ContractStatus::Active)
            .count();
        Ok(ObjectDetails {
            object,
            active_replicas,
            contracts,
            restoring,
        })
    }

    /// Start a background restore and return the job to poll.
    pub async fn restore_object(&self, object_id: i64) -> StorageResult<DownloadJob> {
        let object = self.live_object(object_id).await?;
        Ok(self.restore.restore(&object).await?)
    }

    pub async fn download_job(&self, job_id: i64) -> StorageResult<DownloadJob> {
        Ok(self.store.get_download_job(job_id).await?)
    }

    /// Hire one extra custodian now, outside the replicator loop. Custodians
    /// with a live contract for the object are excluded.
    pub async fn replicate_object(&self, object_id: i64) -> StorageResult<Contract> {
        let object = self.live_object(object_id).await?;
        let bag = Self::bag_of(&object)?;
        let mut exclude: Vec<String> = self
            .store
            .object_contracts(object_id)
            .await?
            .into_iter()
            .filter(|c| c.status != ContractStatus::Failed)
            .map(|c| c.provider_addr)
            .collect();

        let mut rng = StdRng::from_entropy();
        let contract = hire_one(
            &self.store,
            self.network.as_ref(),
            &self.providers,
            object.id,
            &bag,
            &mut exclude,
            BASE_ESCROW_NANO,
            &mut rng,
        )
        .await?;
        info!(object_id, contract_id = contract.id, custodian = %contract.provider_addr, "manual replication");
        Ok(contract)
    }

    pub async fn object_stats(&self, object_id: i64) -> StorageResult<BagStats> {
        let object = self.live_object(object_id).await?;
        let bag = Self::bag_of(&object)?;
        Ok(self.network.bag_stats(&bag).await?)
    }

    /// Audit one contract on demand. Reports only; the auditor owns transitions.
    pub async fn audit_contract(&self, contract_id: i64) -> StorageResult<AuditReport> {
        let contract = self.store.get_contract(contract_id).await?;
        let bag = contract_bag(&contract)?;
        Ok(self
            .network
            .audit_custodian(&bag, &contract.contract.provider_addr)
            .await?)
    }

    /// Remove a custodian on-chain and fail its contract. Unlike the auditor,
    /// an on-chain failure aborts the withdrawal so the operator can retry.
    pub async fn withdraw_contract(&self, contract_id: i64) -> StorageResult<Withdrawal> {
        let contract = self.store.get_contract(contract_id).await?;
        let bag = contract_bag(&contract)?;
        let tx_hash = self
            .network
            .remove_custodian(&bag, &contract.contract.provider_addr)
            .await?;

        self.store.mark_contract_failed(contract_id).await?;
        let object_downgraded = self
            .store
            .downgrade_object_if_underreplicated(contract.contract.object_id)
            .await?;
        info!(contract_id, tx = %tx_hash, "contract withdrawn");

        Ok(Withdrawal {
            contract_id,
            tx_hash,
            object_downgraded,
        })
    }
}

fn contract_bag(contract: &ContractWithBag) -> StorageResult<BagId> {
    contract.bag_id.parse().map_err(|err| {
        StoreError::Integrity(format!("contract {}: {err}", contract.contract.id)).into()
    })
}

/// Synthetic "common prefix" for delimiter listings, or None when the key is
/// listed directly.
fn compute_common_prefix(
    key: &str,
    requested_prefix: Option<&str>,
    delimiter: &str,
) -> Option<String> {
    let prefix = requested_prefix.unwrap_or("");
    let rest = key.strip_prefix(prefix)?;
    let pos = rest.find(delimiter)?;
    Some(format!("{prefix}{}", &rest[..pos + delimiter.len()]))
}

/// Dotted-quad names such as `1.2.3.4`.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}
