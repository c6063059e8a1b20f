//! Persistence of session authentication material.
//!
//! Layout mirrors the multi-file auth state used by WhatsApp Web clients:
//! `creds.json` plus one file per signal key entry. Contents are opaque.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    errors::Error,
    messaging::types::{CredentialUpdate, Credentials},
    Result,
};

const CREDS_FILE: &str = "creds.json";

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load everything persisted so far. An empty store yields empty credentials.
    async fn load(&self) -> Result<Credentials>;

    /// Apply an incremental update pushed by the session.
    async fn save(&self, update: &CredentialUpdate) -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct KeyEnvelope {
    key: String,
    value: serde_json::Value,
}

/// Directory-backed store.
#[derive(Clone, Debug)]
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, key: &str) -> Result<PathBuf> {
        let name = key_file_name(key);
        if name.is_empty() || name == CREDS_FILE {
            return Err(Error::InvalidPath {
                path: self.dir.join(&name),
                reason: format!("unusable credential key {key:?}"),
            });
        }
        Ok(self.dir.join(name))
    }
}

/// Keys may contain `/` and `:`; keep them flat and portable on disk.
fn key_file_name(key: &str) -> String {
    let stem = key.trim().replace('/', "__").replace(':', "-");
    if stem.is_empty() || stem.starts_with('.') {
        return String::new();
    }
    format!("{stem}.json")
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<Credentials> {
        let mut out = Credentials::default();

        let mut rd = match tokio::fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(Error::Io(e)),
        };

        while let Some(ent) = rd.next_entry().await? {
            let name = ent.file_name().to_string_lossy().to_string();
            if !name.ends_with(".json") {
                continue;
            }
            let txt = tokio::fs::read_to_string(ent.path()).await?;
            if name == CREDS_FILE {
                out.creds = Some(serde_json::from_str(&txt)?);
                continue;
            }
            match serde_json::from_str::<KeyEnvelope>(&txt) {
                Ok(env) => {
                    out.keys.insert(env.key, env.value);
                }
                Err(e) => {
                    tracing::warn!(file = %name, "skipping unreadable key file: {e}");
                }
            }
        }

        Ok(out)
    }

    async fn save(&self, update: &CredentialUpdate) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        if let Some(creds) = &update.creds {
            let bytes = serde_json::to_vec_pretty(creds)?;
            write_atomic(&self.dir.join(CREDS_FILE), &bytes).await?;
        }

        for (key, value) in &update.keys {
            let path = self.key_path(key)?;
            match value {
                Some(value) => {
                    let env = KeyEnvelope {
                        key: key.clone(),
                        value: value.clone(),
                    };
                    write_atomic(&path, &serde_json::to_vec(&env)?).await?;
                }
                None => match tokio::fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(Error::Io(e)),
                },
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tmp_dir(prefix: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        PathBuf::from(format!("/tmp/{prefix}-{}-{ts}", std::process::id()))
    }

    #[tokio::test]
    async fn missing_directory_loads_as_empty() {
        let store = FileCredentialStore::new(tmp_dir("wab-creds-missing"));
        let creds = store.load().await.unwrap();
        assert!(creds.is_empty());
    }

    #[tokio::test]
    async fn saves_and_reloads_creds_and_keys() {
        let dir = tmp_dir("wab-creds-roundtrip");
        let store = FileCredentialStore::new(&dir);

        let mut update = CredentialUpdate {
            creds: Some(json!({"me": {"id": "1@s.whatsapp.net"}})),
            ..CredentialUpdate::default()
        };
        update
            .keys
            .insert("pre-key:1".to_string(), Some(json!({"k": 1})));
        update
            .keys
            .insert("session/abc".to_string(), Some(json!({"k": 2})));
        store.save(&update).await.unwrap();

        assert!(dir.join("pre-key-1.json").is_file());
        assert!(dir.join("session__abc.json").is_file());

        let creds = store.load().await.unwrap();
        assert_eq!(creds.creds, update.creds);
        assert_eq!(creds.keys.get("pre-key:1"), Some(&json!({"k": 1})));
        assert_eq!(creds.keys.get("session/abc"), Some(&json!({"k": 2})));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn null_key_value_deletes_entry() {
        let dir = tmp_dir("wab-creds-delete");
        let store = FileCredentialStore::new(&dir);

        let mut add = CredentialUpdate::default();
        add.keys.insert("pre-key:7".to_string(), Some(json!(7)));
        store.save(&add).await.unwrap();

        let mut remove = CredentialUpdate::default();
        remove.keys.insert("pre-key:7".to_string(), None);
        store.save(&remove).await.unwrap();
        // Removing twice is not an error.
        store.save(&remove).await.unwrap();

        let creds = store.load().await.unwrap();
        assert!(creds.keys.is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn rejects_keys_that_cannot_be_files() {
        let store = FileCredentialStore::new(tmp_dir("wab-creds-bad"));
        let mut update = CredentialUpdate::default();
        update.keys.insert("  ".to_string(), Some(json!(1)));
        let err = store.save(&update).await.unwrap_err();
        assert!(matches!(err, Error::InvalidPath { .. }));
        let _ = std::fs::remove_dir_all(store.dir());
    }
}
