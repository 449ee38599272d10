//! File-backed session store.
//!
//! Layout: `{path}/{expiry}_{id}.json`, one file per session, where
//! `expiry` is the epoch-millis expiry (0 for sessions that never expire).
//! Encoding the expiry in the name lets `exists` and `get_expired` answer
//! from an in-memory index without reading any file.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::FileStoreConfig;
use crate::error::{Error, Result};
use crate::session::{Snapshot, now_millis};
use crate::store::SessionDataStore;

const EXTENSION: &str = "json";

/// A parsed session file name.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SessionFile {
    /// Expiry in epoch millis; 0 means never.
    expiry: i64,
    name: String,
}

impl SessionFile {
    fn for_snapshot(snapshot: &Snapshot) -> Self {
        let expiry = snapshot.expiry().unwrap_or(0);
        Self {
            expiry,
            name: format!("{expiry}_{}.{EXTENSION}", snapshot.id),
        }
    }

    /// Split `{expiry}_{id}.json` into its parts.
    fn parse(name: &str) -> Option<(String, Self)> {
        let stem = name.strip_suffix(&format!(".{EXTENSION}"))?;
        let (expiry, id) = stem.split_once('_')?;
        let expiry = expiry.parse::<i64>().ok()?;
        if !is_safe_id(id) {
            return None;
        }
        Some((
            id.to_string(),
            Self {
                expiry,
                name: name.to_string(),
            },
        ))
    }

    fn is_expired(&self, now: i64) -> bool {
        self.expiry > 0 && self.expiry <= now
    }
}

/// Ids that can safely become part of a file name.
fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Session store writing one JSON file per session.
pub struct FileStore {
    dir: PathBuf,
    delete_unrestorable: bool,
    index: Mutex<HashMap<String, SessionFile>>,
}

impl FileStore {
    /// Open the store directory, creating it if needed, and index its files.
    ///
    /// Names that don't parse are deleted when `delete_unrestorable_files`
    /// is set and ignored otherwise. If several files exist for one id,
    /// the one with the latest expiry wins and the rest are removed.
    pub async fn open(config: FileStoreConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.path).await?;

        let mut index: HashMap<String, SessionFile> = HashMap::new();
        let mut entries = tokio::fs::read_dir(&config.path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                // Leftover temp file from an interrupted write.
                remove_quietly(&entry.path()).await;
                continue;
            }
            let Some((id, file)) = SessionFile::parse(&name) else {
                if config.delete_unrestorable_files {
                    warn!(file = %name, "Deleting unrecognized file in session store");
                    remove_quietly(&entry.path()).await;
                } else {
                    warn!(file = %name, "Ignoring unrecognized file in session store");
                }
                continue;
            };
            let stale = match index.remove(&id) {
                Some(existing) if existing.expiry >= file.expiry => {
                    index.insert(id, existing);
                    file
                }
                Some(existing) => {
                    index.insert(id, file);
                    existing
                }
                None => {
                    index.insert(id, file);
                    continue;
                }
            };
            debug!(file = %stale.name, "Removing superseded session file");
            remove_quietly(&config.path.join(&stale.name)).await;
        }

        info!(
            path = %config.path.display(),
            sessions = index.len(),
            "Opened file session store"
        );

        Ok(Self {
            dir: config.path,
            delete_unrestorable: config.delete_unrestorable_files,
            index: Mutex::new(index),
        })
    }

    /// Directory holding the session files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Ids currently indexed.
    pub fn ids(&self) -> Vec<String> {
        self.index.lock().keys().cloned().collect()
    }

    fn path_for(&self, file: &SessionFile) -> PathBuf {
        self.dir.join(&file.name)
    }

    /// Handle a file that exists but can't be turned into a snapshot.
    async fn unrestorable(&self, id: &str, file: &SessionFile, reason: String) -> Result<Option<Snapshot>> {
        if self.delete_unrestorable {
            warn!(session_id = %id, file = %file.name, %reason, "Deleting unrestorable session file");
            self.forget(id, file);
            remove_quietly(&self.path_for(file)).await;
            Ok(None)
        } else {
            Err(Error::CorruptData {
                id: id.to_string(),
                reason,
            })
        }
    }

    /// Drop `id` from the index if it still points at `file`.
    fn forget(&self, id: &str, file: &SessionFile) {
        let mut index = self.index.lock();
        if index.get(id) == Some(file) {
            index.remove(id);
        }
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "Failed to remove session file");
    }
}

#[async_trait]
impl SessionDataStore for FileStore {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn load(&self, id: &str) -> Result<Option<Snapshot>> {
        let Some(file) = self.index.lock().get(id).cloned() else {
            return Ok(None);
        };

        let bytes = match tokio::fs::read(self.path_for(&file)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.forget(id, &file);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<Snapshot>(&bytes) {
            Ok(snapshot) if snapshot.id == id => Ok(Some(snapshot)),
            Ok(snapshot) => {
                self.unrestorable(id, &file, format!("file holds session {}", snapshot.id))
                    .await
            }
            Err(e) => self.unrestorable(id, &file, e.to_string()).await,
        }
    }

    async fn store(&self, id: &str, snapshot: &Snapshot) -> Result<()> {
        if !is_safe_id(id) {
            return Err(Error::InvalidState(format!("session id '{id}' is not storable")));
        }
        let mut snapshot = snapshot.clone();
        snapshot.id = id.to_string();

        let file = SessionFile::for_snapshot(&snapshot);
        let bytes = serde_json::to_vec_pretty(&snapshot)?;

        // Write then rename so readers never see a partial file.
        let tmp = self.dir.join(format!(".{}.tmp", file.name));
        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, self.path_for(&file)).await {
            remove_quietly(&tmp).await;
            return Err(e.into());
        }

        let previous = self.index.lock().insert(id.to_string(), file.clone());
        if let Some(previous) = previous
            && previous != file
        {
            remove_quietly(&self.path_for(&previous)).await;
        }
        debug!(session_id = %id, file = %file.name, "Stored session file");
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let Some(file) = self.index.lock().remove(id) else {
            return Ok(false);
        };
        match tokio::fs::remove_file(self.path_for(&file)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => {
                // Keep the entry so a later delete can retry.
                self.index.lock().entry(id.to_string()).or_insert(file);
                Err(e.into())
            }
        }
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        let now = now_millis();
        Ok(self
            .index
            .lock()
            .get(id)
            .is_some_and(|file| !file.is_expired(now)))
    }

    /// Candidates whose file has expired, plus every other expired file in
    /// the directory (sessions that are no longer resident anywhere).
    async fn get_expired(&self, candidates: &HashSet<String>, now: i64) -> Result<HashSet<String>> {
        let index = self.index.lock();
        let mut expired: HashSet<String> = candidates
            .iter()
            .filter(|id| index.get(*id).is_some_and(|file| file.is_expired(now)))
            .cloned()
            .collect();
        expired.extend(
            index
                .iter()
                .filter(|(_, file)| file.is_expired(now))
                .map(|(id, _)| id.clone()),
        );
        Ok(expired)
    }
}
