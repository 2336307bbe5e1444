//! File-based provider implementation for native platforms.

use super::{BoxFuture, Provider, ProviderError, ProviderResult};
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Longest encoded key accepted as a file name.
///
/// Common filesystems cap names at 255 bytes; the rest is left for the
/// `.json` extension and the per-write temporary suffix. Encoding can triple
/// a key's length, so keys of non-alphanumeric bytes hit this well before
/// 200 characters.
pub const MAX_ENCODED_KEY_LEN: usize = 200;

/// File-based provider.
///
/// Stores each key as a JSON file in a directory. Keys are percent-encoded
/// into file names so the mapping is reversible and `list` returns the
/// original keys. Keys whose encoded form exceeds [`MAX_ENCODED_KEY_LEN`]
/// are rejected.
pub struct FileProvider {
    name: String,
    base_path: PathBuf,
}

impl FileProvider {
    /// Create a provider rooted at `base_path`, creating the directory if needed.
    pub fn new(base_path: PathBuf) -> ProviderResult<Self> {
        if !base_path.exists() {
            std::fs::create_dir_all(&base_path).map_err(|e| {
                ProviderError::Io(format!("Failed to create storage directory: {}", e))
            })?;
        }
        Ok(Self {
            name: "file".to_string(),
            base_path,
        })
    }

    /// Create a provider in the default location.
    ///
    /// On Unix: `~/.local/share/pagemark/annotations/`
    /// On Windows: `%LOCALAPPDATA%\pagemark\annotations\`
    pub fn default_location() -> ProviderResult<Self> {
        let base = dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| ProviderError::Io("Could not determine home directory".to_string()))?;
        Self::new(base.join("pagemark").join("annotations"))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn key_path(&self, key: &str) -> ProviderResult<PathBuf> {
        let encoded = encode_key(key);
        if encoded.len() > MAX_ENCODED_KEY_LEN {
            return Err(ProviderError::Other(format!(
                "Key too long for a file name ({} bytes encoded, limit {}): {}",
                encoded.len(),
                MAX_ENCODED_KEY_LEN,
                key
            )));
        }
        Ok(self.base_path.join(format!("{}.json", encoded)))
    }
}

/// Percent-encode everything outside `[A-Za-z0-9_-]`.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

/// Reverse of [`encode_key`]. Returns `None` for names this provider did not write.
fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn io_error(action: &str, path: &Path, key: &str, err: std::io::Error) -> ProviderError {
    if err.kind() == ErrorKind::StorageFull {
        return ProviderError::QuotaExceeded {
            key: key.to_string(),
        };
    }
    ProviderError::Io(format!("Failed to {} {}: {}", action, path.display(), err))
}

impl Provider for FileProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn save(&self, key: &str, value: &Value) -> BoxFuture<'_, ProviderResult<()>> {
        let path = self.key_path(key);
        let key = key.to_string();
        let json = serde_json::to_vec_pretty(value);

        Box::pin(async move {
            let json = json.map_err(|e| ProviderError::Serialization(e.to_string()))?;
            let path = path?;
            // One temporary file per write; concurrent saves to a key must not share it.
            let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4()));
            if let Err(e) = tokio::fs::write(&tmp, &json).await {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(io_error("write", &tmp, &key, e));
            }
            if let Err(e) = tokio::fs::rename(&tmp, &path).await {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(io_error("rename", &path, &key, e));
            }
            Ok(())
        })
    }

    fn load(&self, key: &str) -> BoxFuture<'_, ProviderResult<Option<Value>>> {
        let path = self.key_path(key);
        let key = key.to_string();

        Box::pin(async move {
            let path = path?;
            let json = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(io_error("read", &path, &key, e)),
            };
            serde_json::from_slice(&json).map(Some).map_err(|e| {
                ProviderError::Serialization(format!("Failed to parse {}: {}", path.display(), e))
            })
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, ProviderResult<()>> {
        let path = self.key_path(key);
        let key = key.to_string();

        Box::pin(async move {
            let path = path?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(io_error("delete", &path, &key, e)),
            }
        })
    }

    fn list(&self, prefix: Option<&str>) -> BoxFuture<'_, ProviderResult<Vec<String>>> {
        let base = self.base_path.clone();
        let prefix = prefix.unwrap_or_default().to_string();

        Box::pin(async move {
            let mut entries = match tokio::fs::read_dir(&base).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
                Err(e) => {
                    return Err(ProviderError::Io(format!("Failed to read directory: {}", e)));
                }
            };

            let mut keys = Vec::new();
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| ProviderError::Io(format!("Failed to read directory: {}", e)))?
            {
                let path = entry.path();
                if path.extension().is_none_or(|ext| ext != "json") {
                    continue;
                }
                let Some(key) = path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .and_then(decode_key)
                else {
                    continue;
                };
                if key.starts_with(&prefix) {
                    keys.push(key);
                }
            }
            keys.sort();
            Ok(keys)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_file_provider_save_load() {
        let dir = tempdir().unwrap();
        let provider = FileProvider::new(dir.path().to_path_buf()).unwrap();

        provider.save("doc", &json!({"title": "Test"})).await.unwrap();
        let loaded = provider.load("doc").await.unwrap();
        assert_eq!(loaded, Some(json!({"title": "Test"})));
    }

    #[tokio::test]
    async fn test_file_provider_missing_key() {
        let dir = tempdir().unwrap();
        let provider = FileProvider::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(provider.load("nonexistent").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_provider_list_returns_original_keys() {
        let dir = tempdir().unwrap();
        let provider = FileProvider::new(dir.path().to_path_buf()).unwrap();

        provider.save("annotations/doc1", &json!(1)).await.unwrap();
        provider.save("annotations/doc 2", &json!(2)).await.unwrap();
        provider.save("other", &json!(3)).await.unwrap();

        let keys = provider.list(Some("annotations/")).await.unwrap();
        assert_eq!(keys, vec!["annotations/doc 2", "annotations/doc1"]);
    }

    #[tokio::test]
    async fn test_file_provider_delete() {
        let dir = tempdir().unwrap();
        let provider = FileProvider::new(dir.path().to_path_buf()).unwrap();

        provider.save("test", &json!(true)).await.unwrap();
        provider.delete("test").await.unwrap();
        assert_eq!(provider.load("test").await.unwrap(), None);
        provider.delete("test").await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_file_is_serialization_error() {
        let dir = tempdir().unwrap();
        let provider = FileProvider::new(dir.path().to_path_buf()).unwrap();
        std::fs::write(provider.key_path("bad").unwrap(), "{oops").unwrap();

        assert!(matches!(
            provider.load("bad").await,
            Err(ProviderError::Serialization(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_saves_to_one_key() {
        let dir = tempdir().unwrap();
        let provider = std::sync::Arc::new(FileProvider::new(dir.path().to_path_buf()).unwrap());

        for round in 0..10 {
            let tasks: Vec<_> = (0..8)
                .map(|i| {
                    let provider = provider.clone();
                    tokio::spawn(async move {
                        provider
                            .save("annotations/doc", &json!({"round": round, "writer": i}))
                            .await
                    })
                })
                .collect();
            for task in tasks {
                task.await.unwrap().unwrap();
            }
            let loaded = provider.load("annotations/doc").await.unwrap().unwrap();
            assert_eq!(loaded["round"], round);
        }

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1, "{:?}", leftovers);
        assert_eq!(provider.list(None).await.unwrap(), vec!["annotations/doc"]);
    }

    #[tokio::test]
    async fn test_overlong_key_is_rejected() {
        let dir = tempdir().unwrap();
        let provider = FileProvider::new(dir.path().to_path_buf()).unwrap();
        let key = "/".repeat(MAX_ENCODED_KEY_LEN / 3 + 1);

        assert!(matches!(
            provider.save(&key, &json!(1)).await,
            Err(ProviderError::Other(_))
        ));
        let fits = "a".repeat(MAX_ENCODED_KEY_LEN);
        provider.save(&fits, &json!(1)).await.unwrap();
        assert_eq!(provider.load(&fits).await.unwrap(), Some(json!(1)));
    }

    #[test]
    fn test_key_encoding_is_reversible() {
        for key in ["annotations/a:b*c", "plain-key_1", "ünïcode/ß", "50%"] {
            let encoded = encode_key(key);
            assert!(!encoded.contains('/'));
            assert_eq!(decode_key(&encoded).as_deref(), Some(key));
        }
        assert_eq!(decode_key("bad%Z1"), None);
    }
}
