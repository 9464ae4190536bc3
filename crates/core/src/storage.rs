//! Local Persistence
//!
//! Session state is kept as JSON blobs in a string-keyed store. `FileStore`
//! writes one file per key into a data directory; `MemoryStore` keeps
//! everything in process. `SessionStore` layers typed load/save on top.

use crate::models::{AcademicMode, Lesson, Message, MentorVoice, Note, Profile, Task};
use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

pub const KEY_MESSAGES: &str = "executive_mentor_history";
pub const KEY_NOTES: &str = "executive_mentor_notes";
pub const KEY_TASKS: &str = "executive_mentor_tasks";
pub const KEY_VAULT: &str = "executive_mentor_vault";
pub const KEY_THEME: &str = "executive_mentor_theme";
pub const KEY_MODE: &str = "executive_mentor_mode";
pub const KEY_VOICE: &str = "executive_mentor_voice";
pub const KEY_PROFILE: &str = "executive_mentor_profile";

pub const ALL_KEYS: [&str; 8] = [
    KEY_MESSAGES,
    KEY_NOTES,
    KEY_TASKS,
    KEY_VAULT,
    KEY_THEME,
    KEY_MODE,
    KEY_VOICE,
    KEY_PROFILE,
];

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error on '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Serialization error on '{key}': {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Storage lock poisoned")]
    Poisoned,
}

/// A string-keyed blob store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    /// Removes every key.
    async fn clear(&self) -> Result<(), StorageError>;
}

/// Stores each key as `<dir>/<key>.json`.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let io_err = |source| StorageError::Io {
            key: key.to_string(),
            source,
        };
        tokio::fs::create_dir_all(&self.dir).await.map_err(io_err)?;

        // Renamed over the target once fully written.
        let tmp_path = self.dir.join(format!(".{key}.{}.tmp", Uuid::new_v4()));
        let write = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(value.as_bytes()).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp_path, self.path_for(key)).await
        };
        if let Err(source) = write.await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(io_err(source));
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        for key in ALL_KEYS {
            match tokio::fs::remove_file(self.path_for(key)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(StorageError::Io {
                        key: key.to_string(),
                        source,
                    });
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.entries
            .lock()
            .map_err(|_| StorageError::Poisoned)?
            .clear();
        Ok(())
    }
}

/// Everything restored at startup.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub messages: Vec<Message>,
    pub notes: Vec<Note>,
    pub tasks: Vec<Task>,
    pub vault: Vec<Lesson>,
    pub dark_mode: bool,
    pub mode: Option<AcademicMode>,
    pub voice: Option<MentorVoice>,
    pub profile: Option<Profile>,
}

/// Typed access to the session keys.
#[derive(Clone)]
pub struct SessionStore {
    kv: Arc<dyn KeyValueStore>,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Loads a JSON blob. Blobs that no longer parse are logged and treated as absent.
    pub async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let Some(raw) = self.kv.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(key, error = %e, "Ignoring unreadable stored value");
                Ok(None)
            }
        }
    }

    pub async fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let json = serde_json::to_string(value).map_err(|source| StorageError::Serialization {
            key: key.to_string(),
            source,
        })?;
        self.kv.set(key, &json).await
    }

    pub async fn load_snapshot(&self) -> Result<SessionSnapshot, StorageError> {
        // Mode, voice and theme are stored as bare strings.
        let mode = self
            .kv
            .get(KEY_MODE)
            .await?
            .and_then(|raw| raw.parse::<AcademicMode>().ok());
        let voice = self
            .kv
            .get(KEY_VOICE)
            .await?
            .and_then(|raw| raw.parse::<MentorVoice>().ok());
        let dark_mode = self.kv.get(KEY_THEME).await?.as_deref() == Some("dark");

        Ok(SessionSnapshot {
            messages: self.load(KEY_MESSAGES).await?.unwrap_or_default(),
            notes: self.load(KEY_NOTES).await?.unwrap_or_default(),
            tasks: self.load(KEY_TASKS).await?.unwrap_or_default(),
            vault: self.load(KEY_VAULT).await?.unwrap_or_default(),
            dark_mode,
            mode,
            voice,
            profile: self.load(KEY_PROFILE).await?,
        })
    }

    pub async fn save_mode(&self, mode: AcademicMode) -> Result<(), StorageError> {
        self.kv.set(KEY_MODE, mode.label()).await
    }

    pub async fn save_voice(&self, voice: MentorVoice) -> Result<(), StorageError> {
        self.kv.set(KEY_VOICE, voice.name()).await
    }

    pub async fn save_theme(&self, dark_mode: bool) -> Result<(), StorageError> {
        self.kv
            .set(KEY_THEME, if dark_mode { "dark" } else { "light" })
            .await
    }

    pub async fn clear(&self) -> Result<(), StorageError> {
        self.kv.clear().await
    }
}
