//! Volume management
//!
//! Volumes are created lazily on first attach and live under
//! `<base>/<name>/_data`. The table is persisted to `<base>/volumes.json`
//! so records survive a restart of the supervisor itself. The core never
//! removes a volume on its own; only [`VolumeManager::remove`] does.

use crate::error::{Result, WardenError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

const INDEX_FILE: &str = "volumes.json";
const DATA_DIR: &str = "_data";

/// Check that a volume name is usable as a directory name
pub fn validate_volume_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            first.is_ascii_alphanumeric()
                && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        }
        None => false,
    };

    if !valid {
        return Err(WardenError::Volume(format!("invalid volume name '{}'", name)));
    }

    // The index and its temporary copy share the directory with volumes
    if name == INDEX_FILE || name == index_tmp_name() {
        return Err(WardenError::Volume(format!(
            "volume name '{}' is reserved",
            name
        )));
    }

    Ok(())
}

fn index_tmp_name() -> String {
    format!("{}.tmp", INDEX_FILE)
}

/// A named persistent storage unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeRecord {
    /// Volume name
    pub name: String,
    /// Resolved storage location on the host
    pub backing_path: PathBuf,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Volume labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl VolumeRecord {
    fn new(name: &str, base_path: &Path, labels: BTreeMap<String, String>) -> Self {
        Self {
            name: name.to_string(),
            backing_path: base_path.join(name).join(DATA_DIR),
            created_at: Utc::now(),
            labels,
        }
    }

    /// Get size in bytes
    pub fn size(&self) -> u64 {
        if !self.backing_path.exists() {
            return 0;
        }

        walkdir::WalkDir::new(&self.backing_path)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter_map(|e| e.metadata().ok())
            .filter(|m| m.is_file())
            .map(|m| m.len())
            .sum()
    }
}

/// Result of attaching a volume to a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// The volume record
    pub record: VolumeRecord,
    /// Where the service expects the volume
    pub mount_path: PathBuf,
    /// Whether this call created the volume
    pub created: bool,
}

/// Volume manager
///
/// Creation goes through a reservation table keyed by name: each name owns a
/// `OnceCell`, so concurrent attaches of one name perform a single physical
/// creation and every caller observes the same record.
pub struct VolumeManager {
    /// Base path for volume storage
    base_path: PathBuf,
    /// Reservations indexed by name
    reservations: Mutex<HashMap<String, Arc<OnceCell<VolumeRecord>>>>,
    /// Attach counts indexed by name
    references: Mutex<HashMap<String, usize>>,
    /// Created records, mirrored to the index file
    catalog: Mutex<BTreeMap<String, VolumeRecord>>,
}

impl VolumeManager {
    /// Create a volume manager, restoring any persisted volumes
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path).map_err(|e| {
            WardenError::Volume(format!(
                "cannot create volume root {}: {}",
                base_path.display(),
                e
            ))
        })?;

        let index_path = base_path.join(INDEX_FILE);
        let mut reservations = HashMap::new();
        let mut catalog = BTreeMap::new();
        if index_path.exists() {
            let content = std::fs::read_to_string(&index_path)?;
            let records: Vec<VolumeRecord> = serde_json::from_str(&content)?;
            tracing::debug!("Restored {} volume(s) from {}", records.len(), index_path.display());
            for record in records {
                catalog.insert(record.name.clone(), record.clone());
                reservations.insert(record.name.clone(), Arc::new(OnceCell::new_with(Some(record))));
            }
        }

        Ok(Self {
            base_path,
            reservations: Mutex::new(reservations),
            references: Mutex::new(HashMap::new()),
            catalog: Mutex::new(catalog),
        })
    }

    /// Base path for volume storage
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Attach a volume, creating it on first use
    pub async fn attach(&self, name: &str, mount_path: &Path) -> Result<Attachment> {
        self.attach_with_labels(name, mount_path, BTreeMap::new()).await
    }

    /// Attach a volume; `labels` only apply when this call creates it
    pub async fn attach_with_labels(
        &self,
        name: &str,
        mount_path: &Path,
        labels: BTreeMap<String, String>,
    ) -> Result<Attachment> {
        validate_volume_name(name)?;

        let cell = self.reservation(name)?;
        let created = AtomicBool::new(false);
        let record = cell
            .get_or_try_init(|| async {
                created.store(true, Ordering::SeqCst);
                self.create_backing(name, labels).await
            })
            .await?
            .clone();

        if !record.backing_path.is_dir() {
            return Err(WardenError::Volume(format!(
                "backing path {} of volume {} is missing",
                record.backing_path.display(),
                name
            )));
        }

        *self
            .references
            .lock()
            .map_err(|_| WardenError::Lock("Failed to acquire volume reference lock".to_string()))?
            .entry(name.to_string())
            .or_insert(0) += 1;

        let created = created.load(Ordering::SeqCst);
        if created {
            tracing::info!("Created volume {} at {}", name, record.backing_path.display());
        }
        tracing::debug!("Attached volume {} at {}", name, mount_path.display());

        Ok(Attachment {
            record,
            mount_path: mount_path.to_path_buf(),
            created,
        })
    }

    /// Release one attachment of a volume
    pub fn detach(&self, name: &str) -> Result<()> {
        let mut references = self
            .references
            .lock()
            .map_err(|_| WardenError::Lock("Failed to acquire volume reference lock".to_string()))?;

        if let Some(count) = references.get_mut(name) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                references.remove(name);
            }
        }

        Ok(())
    }

    /// Number of live attachments of a volume
    pub fn reference_count(&self, name: &str) -> usize {
        self.references
            .lock()
            .map(|r| r.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Get a volume by name
    pub fn get(&self, name: &str) -> Result<VolumeRecord> {
        let reservations = self
            .reservations
            .lock()
            .map_err(|_| WardenError::Lock("Failed to acquire volume table lock".to_string()))?;

        reservations
            .get(name)
            .and_then(|cell| cell.get())
            .cloned()
            .ok_or_else(|| WardenError::VolumeNotFound(name.to_string()))
    }

    /// List all volumes, sorted by name
    pub fn list(&self) -> Result<Vec<VolumeRecord>> {
        let reservations = self
            .reservations
            .lock()
            .map_err(|_| WardenError::Lock("Failed to acquire volume table lock".to_string()))?;

        let mut records: Vec<VolumeRecord> =
            reservations.values().filter_map(|cell| cell.get()).cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Remove a volume and its data
    pub fn remove(&self, name: &str, force: bool) -> Result<()> {
        let in_use = self.reference_count(name);
        if in_use > 0 && !force {
            return Err(WardenError::Volume(format!(
                "Volume {} is in use by {} service(s)",
                name, in_use
            )));
        }

        let record = {
            let mut reservations = self
                .reservations
                .lock()
                .map_err(|_| WardenError::Lock("Failed to acquire volume table lock".to_string()))?;

            let record = match reservations.get(name) {
                Some(cell) => cell.get().cloned().ok_or_else(|| {
                    WardenError::Volume(format!("Volume {} is still being created", name))
                })?,
                None => return Err(WardenError::VolumeNotFound(name.to_string())),
            };
            reservations.remove(name);
            record
        };

        let volume_dir = self.base_path.join(&record.name);
        if volume_dir.exists() {
            std::fs::remove_dir_all(&volume_dir)?;
        }

        if let Ok(mut references) = self.references.lock() {
            references.remove(name);
        }

        self.update_catalog(|catalog| {
            catalog.remove(name);
        })?;
        tracing::info!("Removed volume {}", name);
        Ok(())
    }

    fn reservation(&self, name: &str) -> Result<Arc<OnceCell<VolumeRecord>>> {
        let mut reservations = self
            .reservations
            .lock()
            .map_err(|_| WardenError::Lock("Failed to acquire volume table lock".to_string()))?;

        Ok(reservations
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone())
    }

    async fn create_backing(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<VolumeRecord> {
        let record = VolumeRecord::new(name, &self.base_path, labels);

        tokio::fs::create_dir_all(&record.backing_path)
            .await
            .map_err(|e| {
                WardenError::Volume(format!(
                    "cannot create backing path {}: {}",
                    record.backing_path.display(),
                    e
                ))
            })?;

        self.update_catalog(|catalog| {
            catalog.insert(record.name.clone(), record.clone());
        })?;
        Ok(record)
    }

    /// Apply a change to the catalog and rewrite the index file under its lock
    fn update_catalog<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut BTreeMap<String, VolumeRecord>),
    {
        let mut catalog = self
            .catalog
            .lock()
            .map_err(|_| WardenError::Lock("Failed to acquire volume catalog lock".to_string()))?;
        change(&mut catalog);

        let records: Vec<&VolumeRecord> = catalog.values().collect();
        let index_path = self.base_path.join(INDEX_FILE);
        let tmp_path = self.base_path.join(index_tmp_name());
        let content = serde_json::to_string_pretty(&records)?;
        std::fs::write(&tmp_path, content)
            .and_then(|_| std::fs::rename(&tmp_path, &index_path))
            .map_err(|e| {
                WardenError::Volume(format!("cannot write {}: {}", index_path.display(), e))
            })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_attach_creates_volume() {
        let temp = tempdir().unwrap();
        let manager = VolumeManager::new(temp.path().to_path_buf()).unwrap();

        let attachment = manager.attach("pgdata", Path::new("/var/lib/postgresql/data")).await.unwrap();
        assert!(attachment.created);
        assert_eq!(attachment.record.name, "pgdata");
        assert!(attachment.record.backing_path.is_dir());
        assert_eq!(attachment.mount_path, PathBuf::from("/var/lib/postgresql/data"));
    }

    #[tokio::test]
    async fn test_attach_is_idempotent_and_keeps_data() {
        let temp = tempdir().unwrap();
        let manager = VolumeManager::new(temp.path().to_path_buf()).unwrap();

        let first = manager.attach("pgdata", Path::new("/data")).await.unwrap();
        std::fs::write(first.record.backing_path.join("PG_VERSION"), "16").unwrap();

        let second = manager.attach("pgdata", Path::new("/other")).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.record, first.record);
        assert_eq!(
            std::fs::read_to_string(second.record.backing_path.join("PG_VERSION")).unwrap(),
            "16"
        );
        assert_eq!(manager.reference_count("pgdata"), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_attach_creates_once() {
        let temp = tempdir().unwrap();
        let manager = Arc::new(VolumeManager::new(temp.path().to_path_buf()).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    manager
                        .attach("shared", Path::new(&format!("/mnt/{}", i)))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut attachments = Vec::new();
        for handle in handles {
            attachments.push(handle.await.unwrap());
        }

        assert_eq!(attachments.iter().filter(|a| a.created).count(), 1);
        let path = &attachments[0].record.backing_path;
        assert!(attachments.iter().all(|a| &a.record.backing_path == path));
        assert_eq!(manager.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_volumes_survive_manager_restart() {
        let temp = tempdir().unwrap();
        let created_at = {
            let manager = VolumeManager::new(temp.path().to_path_buf()).unwrap();
            manager.attach("pgdata", Path::new("/data")).await.unwrap().record.created_at
        };

        let manager = VolumeManager::new(temp.path().to_path_buf()).unwrap();
        assert_eq!(manager.get("pgdata").unwrap().created_at, created_at);

        let again = manager.attach("pgdata", Path::new("/data")).await.unwrap();
        assert!(!again.created);
    }

    #[tokio::test]
    async fn test_missing_backing_path_is_fatal() {
        let temp = tempdir().unwrap();
        let manager = VolumeManager::new(temp.path().to_path_buf()).unwrap();
        let record = manager.attach("pgdata", Path::new("/data")).await.unwrap().record;

        std::fs::remove_dir_all(&record.backing_path).unwrap();
        assert!(matches!(
            manager.attach("pgdata", Path::new("/data")).await,
            Err(WardenError::Volume(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_volume() {
        let temp = tempdir().unwrap();
        let manager = VolumeManager::new(temp.path().to_path_buf()).unwrap();

        manager.attach("scratch", Path::new("/tmp/scratch")).await.unwrap();
        assert!(manager.remove("scratch", false).is_err());

        manager.detach("scratch").unwrap();
        manager.remove("scratch", false).unwrap();
        assert!(matches!(manager.get("scratch"), Err(WardenError::VolumeNotFound(_))));
        assert!(!temp.path().join("scratch").exists());

        let manager = VolumeManager::new(temp.path().to_path_buf()).unwrap();
        assert!(manager.list().unwrap().is_empty());
    }

    #[test]
    fn test_volume_name_validation() {
        assert!(validate_volume_name("pg-data_1.0").is_ok());
        assert!(validate_volume_name("").is_err());
        assert!(validate_volume_name("../etc").is_err());
        assert!(validate_volume_name("a/b").is_err());
    }

    #[tokio::test]
    async fn test_index_file_name_is_reserved() {
        let temp = tempdir().unwrap();
        let manager = VolumeManager::new(temp.path().to_path_buf()).unwrap();

        for name in ["volumes.json", "volumes.json.tmp"] {
            let result = manager.attach(name, Path::new("/data")).await;
            assert!(matches!(result, Err(WardenError::Volume(_))), "{}", name);
        }
        assert!(!temp.path().join("volumes.json").is_dir());

        manager.attach("pgdata", Path::new("/data")).await.unwrap();
        let restored = VolumeManager::new(temp.path().to_path_buf()).unwrap();
        assert!(restored.get("pgdata").is_ok());
    }

    #[tokio::test]
    async fn test_volume_size() {
        let temp = tempdir().unwrap();
        let manager = VolumeManager::new(temp.path().to_path_buf()).unwrap();
        let record = manager.attach("sized", Path::new("/data")).await.unwrap().record;

        std::fs::write(record.backing_path.join("a"), vec![0u8; 100]).unwrap();
        std::fs::create_dir(record.backing_path.join("nested")).unwrap();
        std::fs::write(record.backing_path.join("nested").join("b"), vec![0u8; 28]).unwrap();
        assert_eq!(record.size(), 128);
    }
}
