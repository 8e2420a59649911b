//! Release identity and persisted release state. Each custom resource instance
//! maps to exactly one chart release, and the mapping must be injective: two
//! distinct resources must never collide on a release name, because the chart
//! engine keys its revision history by (namespace, release name).
use crate::helm::Release;
use crate::reconcile::Phase;
use crate::resource::ResourceIdentity;
use crate::values;

use regex::Regex;
use sha2::{Digest, Sha256};

use std::collections::HashMap;
use std::fmt::{self, Display, Write};
use std::sync::RwLock;

/// Helm limits release names to 53 characters (DNS-1123 label rules apply to
/// the resources the chart stamps out of the name).
pub const MAX_RELEASE_NAME_LEN: usize = 53;

const HASH_SUFFIX_LEN: usize = 8;

lazy_static::lazy_static! {
    static ref INVALID_NAME_CHARS: Regex = Regex::new("[^a-z0-9-]+").unwrap();
}

/// The name and target namespace of one release.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReleaseIdent {
    pub name: String,
    pub namespace: String,
}

impl Display for ReleaseIdent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct InvalidIdentityError {
    pub message: &'static str,
}

impl Display for InvalidIdentityError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Invalid resource identity: {}", self.message)
    }
}

impl std::error::Error for InvalidIdentityError {}

/// Derives the release name and target namespace for a resource identity.
///
/// Deterministic and pure: the same identity always yields the same release
/// name. The readable prefix combines kind, namespace, and name; because '-'
/// can appear inside any of those parts, the prefix alone is not injective,
/// so an 8-hex-char digest of the delimited identity tuple is always
/// appended. The prefix is truncated as needed to stay within the 53
/// character limit.
///
/// An empty resource name is a programming error in the watch layer and is
/// rejected rather than retried.
pub fn resolve(identity: &ResourceIdentity) -> Result<ReleaseIdent, InvalidIdentityError> {
    if identity.name.is_empty() {
        return Err(InvalidIdentityError {
            message: "resource name must not be empty",
        });
    }
    if identity.kind.is_empty() {
        return Err(InvalidIdentityError {
            message: "resource kind must not be empty",
        });
    }
    let namespace = identity
        .namespace()
        .unwrap_or("default")
        .to_owned();

    let mut digest_input = String::with_capacity(64);
    for part in &[
        identity.group.as_str(),
        identity.kind.as_str(),
        namespace.as_str(),
        identity.name.as_str(),
    ] {
        digest_input.push_str(part);
        digest_input.push('\u{1f}');
    }
    let digest = Sha256::digest(digest_input.as_bytes());
    let mut suffix = String::with_capacity(HASH_SUFFIX_LEN);
    for byte in digest.iter().take(HASH_SUFFIX_LEN / 2) {
        let _ = write!(suffix, "{:02x}", byte);
    }

    let raw_prefix = format!("{}-{}", identity.kind.to_lowercase(), identity.name);
    let mut prefix = sanitize(&raw_prefix);
    let max_prefix = MAX_RELEASE_NAME_LEN - HASH_SUFFIX_LEN - 1;
    if prefix.len() > max_prefix {
        prefix.truncate(max_prefix);
        let trimmed = prefix.trim_end_matches('-').len();
        prefix.truncate(trimmed);
    }
    let name = format!("{}-{}", prefix, suffix);

    Ok(ReleaseIdent { name, namespace })
}

/// Lowercases and squashes any run of characters that are not valid in a
/// DNS-1123 label into a single '-', trimming from the ends.
fn sanitize(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let replaced = INVALID_NAME_CHARS.replace_all(&lowered, "-");
    replaced.trim_matches('-').to_owned()
}

/// Persisted state for one release: what is installed, at what revision, and
/// the fingerprint of the inputs that produced it. Written only after the
/// underlying chart operation has succeeded, so the record never claims more
/// than the cluster has confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseRecord {
    pub release_name: String,
    pub namespace: String,
    pub chart_version: String,
    pub fingerprint: String,
    pub revision: i32,
    /// The resource generation that produced this release, or -1 when the
    /// record was rebuilt from a live release and the generation is unknown
    pub observed_generation: i64,
    pub phase: Phase,
}

impl ReleaseRecord {
    /// Rebuilds a record from a live release, for releases found in the
    /// cluster with no corresponding record (operator restart, or a record
    /// lost before it was written). The fingerprint is recomputed from the
    /// values the chart engine stored with the release.
    pub fn from_release(release: &Release) -> ReleaseRecord {
        let fingerprint = values::fingerprint(release.chart_version.as_str(), &release.values);
        ReleaseRecord {
            release_name: release.name.clone(),
            namespace: release.namespace.clone(),
            chart_version: release.chart_version.clone(),
            fingerprint,
            revision: release.revision,
            observed_generation: -1,
            phase: Phase::Installed,
        }
    }
}

#[derive(Debug)]
pub enum StoreError {
    /// The backing storage rejected a write due to a stale precondition.
    /// Retryable: redelivery will re-read and reconcile again.
    Conflict(String),
    /// The backing storage was unreachable. Retryable.
    Unavailable(String),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StoreError::Conflict(msg) => write!(f, "Release store conflict: {}", msg),
            StoreError::Unavailable(msg) => write!(f, "Release store unavailable: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Persisted release metadata, keyed by resource identity. At most one record
/// exists per identity. Implementations must be safe to call concurrently for
/// different identities; the reconciler serializes access per identity.
pub trait ReleaseStore: Send + Sync {
    fn get(&self, identity: &ResourceIdentity) -> Result<Option<ReleaseRecord>, StoreError>;
    fn put(&self, identity: &ResourceIdentity, record: ReleaseRecord) -> Result<(), StoreError>;
    fn delete(&self, identity: &ResourceIdentity) -> Result<(), StoreError>;
}

/// In-memory store. The cluster's own release storage remains the source of
/// truth; this is the working copy the reconciler consults between requests,
/// and records are rebuilt from live releases when missing here.
#[derive(Debug, Default)]
pub struct InMemoryReleaseStore {
    records: RwLock<HashMap<ResourceIdentity, ReleaseRecord>>,
}

impl InMemoryReleaseStore {
    pub fn new() -> InMemoryReleaseStore {
        InMemoryReleaseStore::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReleaseStore for InMemoryReleaseStore {
    fn get(&self, identity: &ResourceIdentity) -> Result<Option<ReleaseRecord>, StoreError> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(identity).cloned())
    }

    fn put(&self, identity: &ResourceIdentity, record: ReleaseRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.insert(identity.clone(), record);
        Ok(())
    }

    fn delete(&self, identity: &ResourceIdentity) -> Result<(), StoreError> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.remove(identity);
        Ok(())
    }
}
