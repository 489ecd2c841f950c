//! Guest identity for commenting.
//!
//! Commenters are not accounts. A browser mints a pseudo user id and a random
//! display name the first time it posts or likes, keeps both in its local
//! key-value storage and reuses them afterwards. The identity lasts exactly as
//! long as that storage does, so nothing here should be trusted the way an
//! authenticated principal would be.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Storage key holding the guest user id.
pub const USER_ID_KEY: &str = "CommentId";
/// Storage key holding the guest display name.
pub const USER_NAME_KEY: &str = "Commentby";

const MAX_GUEST_ID_LEN: usize = 128;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

const NAME_PREFIXES: &[&str] = &["i", "I", "ai", "cyber", "digital", "virtual", "tech", "neo", "meta"];
const NAME_MIDDLES: &[&str] = &["ninja", "wizard", "master", "lord", "king", "queen", "hero", "star", "dream"];
const NAME_SUFFIXES: &[&str] = &["pro", "max", "prime", "elite", "ultra", "xtreme", "alpha", "beta", "gamma"];

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("guest id must be 1-128 characters of [A-Za-z0-9_-]")]
pub struct InvalidGuestId;

/// Pseudo user id of a guest, e.g. `guest_1718000000000_k3j9x0a2b`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GuestId(String);

impl GuestId {
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let suffix: String = (0..9).map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char).collect();
        Self(format!("guest_{}_{}", Utc::now().timestamp_millis(), suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for GuestId {
    type Error = InvalidGuestId;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_GUEST_ID_LEN
            && raw.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        if valid {
            Ok(Self(raw))
        } else {
            Err(InvalidGuestId)
        }
    }
}

impl TryFrom<&str> for GuestId {
    type Error = InvalidGuestId;

    fn try_from(raw: &str) -> Result<Self, Self::Error> {
        Self::try_from(raw.to_string())
    }
}

impl From<GuestId> for String {
    fn from(id: GuestId) -> Self {
        id.0
    }
}

impl fmt::Display for GuestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Random handle such as `cyberninjapro42`.
pub fn generate_display_name<R: Rng + ?Sized>(rng: &mut R) -> String {
    let pick = |rng: &mut R, words: &[&'static str]| words[rng.gen_range(0..words.len())];
    let prefix = pick(rng, NAME_PREFIXES);
    let middle = pick(rng, NAME_MIDDLES);
    let suffix = pick(rng, NAME_SUFFIXES);
    format!("{prefix}{middle}{suffix}{}", rng.gen_range(0..1000))
}

/// Anonymous commenting identity. Kept apart from any authenticated account
/// type on purpose: its trust level is "whoever holds the browser storage".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GuestSession {
    #[schema(value_type = String)]
    pub user_id: GuestId,
    pub display_name: String,
}

impl GuestSession {
    pub fn new(user_id: GuestId, display_name: impl Into<String>) -> Self {
        Self { user_id, display_name: display_name.into() }
    }

    pub fn mint<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self { user_id: GuestId::generate(rng), display_name: generate_display_name(rng) }
    }

    /// Reuses the identity held in `storage`, minting and persisting whichever
    /// half is missing or unusable.
    pub fn resume_or_mint<R: Rng + ?Sized>(storage: &dyn ClientStorage, rng: &mut R) -> Result<Self, StorageError> {
        let user_id = match storage.get(USER_ID_KEY).and_then(|raw| GuestId::try_from(raw).ok()) {
            Some(id) => id,
            None => {
                let id = GuestId::generate(rng);
                storage.set(USER_ID_KEY, id.as_str())?;
                id
            }
        };
        let display_name = match storage.get(USER_NAME_KEY).filter(|n| !n.trim().is_empty()) {
            Some(name) => name,
            None => {
                let name = generate_display_name(rng);
                storage.set(USER_NAME_KEY, &name)?;
                name
            }
        };
        Ok(Self { user_id, display_name })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("storage lock poisoned")]
    Poisoned,
}

/// Client-local persistent key-value storage. No eviction, no expiry.
pub trait ClientStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
}

#[derive(Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<DashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClientStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// JSON-file storage, rewritten on every change.
pub struct FileStorage {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, String>>,
}

impl FileStorage {
    /// Opens `path`, starting empty when the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, entries: RwLock::new(entries) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<(), StorageError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&self.path, serde_json::to_vec_pretty(entries)?)?;
        Ok(())
    }
}

impl ClientStorage for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.write().map_err(|_| StorageError::Poisoned)?;
        entries.insert(key.to_string(), value.to_string());
        self.flush(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.write().map_err(|_| StorageError::Poisoned)?;
        if entries.remove(key).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }
}
