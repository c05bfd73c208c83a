//! Durable key/value storage behind an opaque map contract, plus settings.

mod settings;

pub use settings::DisplayPreferences;
pub use settings::Settings;
pub use settings::keys;

use pw_core::WatchError;
use pw_core::WatchResult;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;

const STORE_FILE_NAME: &str = "portwatch.json";
const STORAGE_DIR_ENV: &str = "PORTWATCH_STORAGE_DIR";

/// Opaque durable map. Values are JSON documents owned by the caller.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> WatchResult<Option<String>>;

    fn set(&mut self, key: &str, value: &str) -> WatchResult<()>;

    fn remove(&mut self, key: &str) -> WatchResult<()>;

    /// Writes several keys as one unit where the backend allows it.
    fn set_many(&mut self, entries: &[(&str, String)]) -> WatchResult<()> {
        for (key, value) in entries {
            self.set(key, value)?;
        }
        Ok(())
    }
}

/// Durable storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageConfig {
    pub root: Option<PathBuf>,
    pub ephemeral_mode: bool,
}

impl StorageConfig {
    pub fn with_root(mut self, root: PathBuf) -> Self {
        self.root = Some(root);
        self
    }

    pub fn ephemeral() -> Self {
        Self {
            root: None,
            ephemeral_mode: true,
        }
    }

    /// Explicit root, then `PORTWATCH_STORAGE_DIR`, then `./.portwatch`.
    pub fn resolved_root(&self) -> PathBuf {
        if let Some(root) = &self.root {
            return root.clone();
        }

        root_from_env(std::env::var_os(STORAGE_DIR_ENV).map(PathBuf::from))
    }
}

fn root_from_env(env_value: Option<PathBuf>) -> PathBuf {
    if let Some(override_root) = env_value.filter(|path| !path.as_os_str().is_empty()) {
        return override_root;
    }

    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".portwatch")
}

/// Opens the backend selected by `config`.
pub fn open_store(config: &StorageConfig) -> WatchResult<Box<dyn KeyValueStore>> {
    if config.ephemeral_mode {
        return Ok(Box::new(MemoryStore::default()));
    }

    Ok(Box::new(FileStore::open(config.resolved_root())?))
}

/// Process-local store used for ephemeral sessions and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStore {
    entries: BTreeMap<String, String>,
}

impl MemoryStore {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> WatchResult<Option<String>> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> WatchResult<()> {
        self.entries.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> WatchResult<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Single-file store: one JSON object mapping each key to its value string.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn open(root: PathBuf) -> WatchResult<Self> {
        fs::create_dir_all(&root).map_err(|error| {
            WatchError::new(
                "storage.dir_create_failed",
                format!(
                    "failed to create storage directory `{}`: {error}",
                    root.display()
                ),
            )
        })?;

        Ok(Self {
            path: root.join(STORE_FILE_NAME),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> WatchResult<Option<String>> {
        let map = read_store_map(&self.path)?;
        Ok(map.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> WatchResult<()> {
        let mut map = read_store_map(&self.path)?;
        map.insert(key.to_owned(), value.to_owned());
        write_store_map(&self.path, &map)
    }

    fn remove(&mut self, key: &str) -> WatchResult<()> {
        let mut map = read_store_map(&self.path)?;
        if map.remove(key).is_none() {
            return Ok(());
        }
        write_store_map(&self.path, &map)
    }

    fn set_many(&mut self, entries: &[(&str, String)]) -> WatchResult<()> {
        let mut map = read_store_map(&self.path)?;
        for (key, value) in entries {
            map.insert((*key).to_owned(), value.clone());
        }
        write_store_map(&self.path, &map)
    }
}

fn read_store_map(path: &Path) -> WatchResult<BTreeMap<String, String>> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(error) => {
            return Err(WatchError::new(
                "storage.read_failed",
                format!("failed to read store file `{}`: {error}", path.display()),
            ));
        }
    };

    serde_json::from_slice(&content).map_err(|error| {
        WatchError::new(
            "storage.format_invalid",
            format!("store file `{}` is not a JSON object of strings: {error}", path.display()),
        )
    })
}

fn write_store_map(path: &Path, map: &BTreeMap<String, String>) -> WatchResult<()> {
    let encoded = serde_json::to_vec_pretty(map).map_err(|error| {
        WatchError::new(
            "storage.encode_failed",
            format!("failed to encode store file: {error}"),
        )
    })?;

    // Staged write, then rename into place.
    let staging = path.with_extension("json.tmp");
    fs::write(&staging, encoded).map_err(|error| {
        WatchError::new(
            "storage.write_failed",
            format!(
                "failed to write store file `{}`: {error}",
                staging.display()
            ),
        )
    })?;

    fs::rename(&staging, path).map_err(|error| {
        WatchError::new(
            "storage.rename_failed",
            format!(
                "failed to move `{}` into place: {error}",
                staging.display()
            ),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::FileStore;
    use super::KeyValueStore;
    use super::MemoryStore;
    use super::StorageConfig;
    use super::open_store;
    use super::root_from_env;
    use std::path::PathBuf;

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap_or_else(|_| unreachable!());
        let mut store =
            FileStore::open(dir.path().to_path_buf()).unwrap_or_else(|_| unreachable!());
        assert!(store.set("tab_listeners", r#"{"1":[]}"#).is_ok());
        assert!(
            store
                .set_many(&[("a", "1".to_owned()), ("b", "line\nbreak\t".to_owned())])
                .is_ok()
        );

        let reopened = FileStore::open(dir.path().to_path_buf()).unwrap_or_else(|_| unreachable!());
        assert_eq!(
            reopened.get("tab_listeners"),
            Ok(Some(r#"{"1":[]}"#.to_owned()))
        );
        assert_eq!(reopened.get("b"), Ok(Some("line\nbreak\t".to_owned())));
        assert_eq!(reopened.get("missing"), Ok(None));
    }

    #[test]
    fn file_store_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap_or_else(|_| unreachable!());
        let mut store =
            FileStore::open(dir.path().to_path_buf()).unwrap_or_else(|_| unreachable!());
        assert!(store.set("k", "v").is_ok());
        assert!(store.remove("k").is_ok());
        assert!(store.remove("k").is_ok());
        assert_eq!(store.get("k"), Ok(None));
    }

    #[test]
    fn corrupt_store_file_reports_format_error() {
        let dir = tempfile::tempdir().unwrap_or_else(|_| unreachable!());
        let store = FileStore::open(dir.path().to_path_buf()).unwrap_or_else(|_| unreachable!());
        assert!(std::fs::write(store.path(), "not-a-record\n").is_ok());

        let loaded = store.get("k");
        assert!(loaded.is_err());
        if let Err(error) = loaded {
            assert_eq!(error.code, "storage.format_invalid");
        }
    }

    #[test]
    fn store_file_is_one_json_object() {
        let dir = tempfile::tempdir().unwrap_or_else(|_| unreachable!());
        let mut store =
            FileStore::open(dir.path().to_path_buf()).unwrap_or_else(|_| unreachable!());
        assert!(store.set("dedupe", "true").is_ok());
        assert!(store.set("log_url", r#""http://127.0.0.1:8099/""#).is_ok());
        assert!(store.path().ends_with("portwatch.json"));

        let raw = std::fs::read(store.path()).unwrap_or_else(|_| unreachable!());
        let object: serde_json::Value =
            serde_json::from_slice(&raw).unwrap_or_else(|_| unreachable!());
        assert_eq!(
            object,
            serde_json::json!({"dedupe": "true", "log_url": "\"http://127.0.0.1:8099/\""})
        );
    }

    #[test]
    fn ephemeral_config_opens_memory_store() {
        let store = open_store(&StorageConfig::ephemeral());
        assert!(store.is_ok());
        let mut store = store.unwrap_or_else(|_| unreachable!());
        assert!(store.set("k", "v").is_ok());
        assert_eq!(store.get("k"), Ok(Some("v".to_owned())));
    }

    #[test]
    fn env_override_wins_over_working_directory() {
        assert_eq!(
            root_from_env(Some(PathBuf::from("/tmp/pw-root"))),
            PathBuf::from("/tmp/pw-root")
        );
        assert!(root_from_env(Some(PathBuf::new())).ends_with(".portwatch"));
    }

    #[test]
    fn memory_store_tracks_length() {
        let mut store = MemoryStore::default();
        assert!(store.is_empty());
        assert!(store.set("a", "1").is_ok());
        assert_eq!(store.len(), 1);
    }
}
