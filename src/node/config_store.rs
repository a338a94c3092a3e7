//! Config snapshot storage, keyed by version
//!
//! The change log only keeps a hash of each snapshot. The snapshots live
//! here, one per prepared version.

use crate::common::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

/// Bound shared by every config snapshot type
pub trait ConfigSnapshot:
    Serialize + DeserializeOwned + Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static
{
}

impl<T> ConfigSnapshot for T where
    T: Serialize + DeserializeOwned + Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static
{
}

pub trait ConfigStorage<T: ConfigSnapshot>: Send {
    /// Snapshot saved for `version`. `None` when nothing (or a refused prepare) was saved.
    fn get_config(&self, version: u64) -> Result<Option<T>>;

    fn save_config(&mut self, version: u64, config: Option<&T>) -> Result<()>;

    fn reset(&mut self) -> Result<()>;
}

#[derive(Debug)]
pub struct MemoryConfigStorage<T> {
    configs: HashMap<u64, Option<T>>,
}

impl<T> MemoryConfigStorage<T> {
    pub fn new() -> Self {
        Self {
            configs: HashMap::new(),
        }
    }
}

impl<T> Default for MemoryConfigStorage<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ConfigSnapshot> ConfigStorage<T> for MemoryConfigStorage<T> {
    fn get_config(&self, version: u64) -> Result<Option<T>> {
        Ok(self.configs.get(&version).cloned().flatten())
    }

    fn save_config(&mut self, version: u64, config: Option<&T>) -> Result<()> {
        self.configs.insert(version, config.cloned());
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.configs.clear();
        Ok(())
    }
}

/// One `cluster-config.<version>.json` file per version
#[derive(Debug)]
pub struct FileConfigStorage {
    dir: PathBuf,
}

const FILE_PREFIX: &str = "cluster-config.";
const FILE_SUFFIX: &str = ".json";

impl FileConfigStorage {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, version: u64) -> PathBuf {
        self.dir
            .join(format!("{}{}{}", FILE_PREFIX, version, FILE_SUFFIX))
    }
}

impl<T: ConfigSnapshot> ConfigStorage<T> for FileConfigStorage {
    fn get_config(&self, version: u64) -> Result<Option<T>> {
        let path = self.path_for(version);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice::<Option<T>>(&bytes).map_err(|e| {
            Error::ConfigStorage(format!("unreadable snapshot {}: {}", path.display(), e))
        })
    }

    fn save_config(&mut self, version: u64, config: Option<&T>) -> Result<()> {
        let path = self.path_for(version);
        let temp_path = path.with_extension("json.tmp");

        fs::write(&temp_path, serde_json::to_vec_pretty(&config)?)?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(FILE_PREFIX) && name.ends_with(FILE_SUFFIX) {
                fs::remove_file(entry.path())?;
            }
        }
        tracing::info!("Config snapshots cleared in {}", self.dir.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    type Snapshot = BTreeMap<String, String>;

    fn snapshot(value: &str) -> Snapshot {
        let mut map = BTreeMap::new();
        map.insert("offheap".to_string(), value.to_string());
        map
    }

    #[test]
    fn test_memory_storage() {
        let mut storage = MemoryConfigStorage::<Snapshot>::new();
        storage.save_config(1, Some(&snapshot("1GB"))).unwrap();
        storage.save_config(2, None).unwrap();

        assert_eq!(storage.get_config(1).unwrap(), Some(snapshot("1GB")));
        assert_eq!(storage.get_config(2).unwrap(), None);
        assert_eq!(storage.get_config(3).unwrap(), None);
    }

    #[test]
    fn test_file_storage_persists() {
        let dir = tempdir().unwrap();

        {
            let mut storage = FileConfigStorage::open(dir.path()).unwrap();
            storage.save_config(1, Some(&snapshot("1GB"))).unwrap();
            ConfigStorage::<Snapshot>::save_config(&mut storage, 2, None).unwrap();
        }
        assert!(dir.path().join("cluster-config.1.json").exists());

        let mut storage = FileConfigStorage::open(dir.path()).unwrap();
        let loaded: Option<Snapshot> = storage.get_config(1).unwrap();
        assert_eq!(loaded, Some(snapshot("1GB")));
        let refused: Option<Snapshot> = storage.get_config(2).unwrap();
        assert_eq!(refused, None);

        ConfigStorage::<Snapshot>::reset(&mut storage).unwrap();
        let gone: Option<Snapshot> = storage.get_config(1).unwrap();
        assert_eq!(gone, None);
    }
}
