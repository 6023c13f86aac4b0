use crate::collection::Collection;
use crate::config::{CollectionConfig, CollectionDescriptor};
use crate::error::{NodbError, Result};
use crate::lock::LockRegistry;
use crate::storage::{self, FORMAT_VERSION};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const METADATA_FILE: &str = "nodb.json";

/// Contents of `nodb.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub version: String,
    #[serde(default)]
    pub collections: BTreeMap<String, CollectionDescriptor>,
}

impl Default for Metadata {
    fn default() -> Self {
        Metadata {
            version: FORMAT_VERSION.to_string(),
            collections: BTreeMap::new(),
        }
    }
}

/// A named database directory under a root path.
/// Owns the metadata file and hands out collection handles.
#[derive(Debug)]
pub struct Database {
    name: String,
    dir: PathBuf,
    metadata_path: PathBuf,
    metadata: Metadata,
    locks: &'static LockRegistry,
}

impl Database {
    /// Open the database `name` under `root`, creating its directory and
    /// metadata file on first use. `root` itself must already exist.
    pub fn open(root: impl AsRef<Path>, name: &str) -> Result<Self> {
        let root = root.as_ref();
        if !root.exists() {
            return Err(NodbError::PathNotFound {
                path: root.to_path_buf(),
            });
        }
        validate_name(name)?;

        // Canonical paths so every handle on this directory shares locks
        let dir = root.canonicalize()?.join(name);
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
            log::debug!("Created database directory {}", dir.display());
        }

        let locks = LockRegistry::global();
        let metadata_path = dir.join(METADATA_FILE);
        let metadata = {
            let lock = locks.get_lock(&metadata_path);
            let _guard = lock.write();
            match storage::read_json(&metadata_path)? {
                Some(metadata) => metadata,
                None => {
                    let metadata = Metadata::default();
                    storage::write_json(&metadata_path, &metadata)?;
                    metadata
                }
            }
        };

        Ok(Database {
            name: name.to_string(),
            dir,
            metadata_path,
            metadata,
            locks,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory holding the metadata and collection files.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Names of the collections known as of the last metadata read.
    pub fn collection_names(&self) -> Vec<&str> {
        self.metadata.collections.keys().map(|k| k.as_str()).collect()
    }

    pub fn descriptor(&self, name: &str) -> Option<&CollectionDescriptor> {
        self.metadata.collections.get(name)
    }

    /// Re-read `nodb.json` to pick up collections created through other
    /// handles.
    pub fn reload(&mut self) -> Result<()> {
        let lock = self.locks.get_lock(&self.metadata_path);
        let _guard = lock.read();
        self.metadata = storage::read_json(&self.metadata_path)?.unwrap_or_default();
        Ok(())
    }

    /// Get a handle to collection `name`, creating it with `config` if it
    /// does not exist yet. For an existing collection `config` is ignored.
    pub fn collection(
        &mut self,
        name: &str,
        config: Option<CollectionConfig>,
    ) -> Result<Collection> {
        validate_collection_name(name)?;

        let lock = self.locks.get_lock(&self.metadata_path);
        let _guard = lock.write();
        self.metadata = storage::read_json(&self.metadata_path)?.unwrap_or_default();

        if let Some(descriptor) = self.metadata.collections.get(name) {
            if config.is_some() {
                log::debug!("Collection '{name}' already exists; ignoring supplied config");
            }
            let collection = Collection::new(descriptor.clone(), &self.dir, self.locks);
            if collection.create_if_missing()? {
                log::warn!("Recreated missing file for collection '{name}'");
            }
            return Ok(collection);
        }

        // Collection file first, so metadata never names a file that was
        // never written.
        let config = config.unwrap_or_default();
        config.validate()?;
        let descriptor = CollectionDescriptor::new(name, config);
        let collection = Collection::new(descriptor.clone(), &self.dir, self.locks);
        collection.create_if_missing()?;

        self.metadata.collections.insert(name.to_string(), descriptor);
        storage::write_json(&self.metadata_path, &self.metadata)?;
        log::debug!("Registered collection '{name}' in {}", self.name);

        Ok(collection)
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
    {
        return Err(NodbError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn validate_collection_name(name: &str) -> Result<()> {
    validate_name(name)?;
    if Some(name) == METADATA_FILE.strip_suffix(".json") {
        return Err(NodbError::InvalidName(format!(
            "{name} (reserved for the metadata file)"
        )));
    }
    Ok(())
}
