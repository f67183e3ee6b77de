use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use crawler_core::TaskId;

use crate::{CatalogError, FailedImageRecord};

/// An image that reached permanent storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogImage {
    pub task_id: TaskId,
    pub plugin_id: String,
    pub url: String,
    pub path: PathBuf,
    pub order: u64,
    pub output_album_id: Option<String>,
}

/// Fields of a failed-image record before the catalog assigns an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFailedImage {
    pub task_id: TaskId,
    pub plugin_id: String,
    pub url: String,
    pub order: u64,
    pub created_at: u64,
    pub last_error: Option<String>,
    pub output_album_id: Option<String>,
}

/// Storage collaborator. The engine only reads and writes the fields below;
/// schema and persistence are the implementor's business.
pub trait Catalog: Send + Sync {
    fn register_image(&self, image: CatalogImage) -> Result<(), CatalogError>;
    fn add_failed_image(&self, record: NewFailedImage) -> Result<FailedImageRecord, CatalogError>;
    fn update_failed_image(&self, record: &FailedImageRecord) -> Result<(), CatalogError>;
    fn find_failed_image(
        &self,
        task_id: &str,
        url: &str,
    ) -> Result<Option<FailedImageRecord>, CatalogError>;
    fn get_failed_image(&self, id: u64) -> Result<Option<FailedImageRecord>, CatalogError>;
    /// Returns whether a record was removed.
    fn remove_failed_image(&self, id: u64) -> Result<bool, CatalogError>;
    /// Records for `task_id`, ordered by `order`.
    fn failed_images(&self, task_id: &str) -> Result<Vec<FailedImageRecord>, CatalogError>;
}

#[derive(Debug, Default)]
struct Tables {
    images: Vec<CatalogImage>,
    failed: BTreeMap<u64, FailedImageRecord>,
    next_failed_id: u64,
}

/// Catalog kept in memory.
///
/// Registering an image clears any failed record for the same task and URL.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    tables: Mutex<Tables>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds failed records, e.g. restored from disk.
    pub fn with_failed_images(records: Vec<FailedImageRecord>) -> Self {
        let catalog = Self::new();
        {
            let mut tables = catalog.tables();
            for record in records {
                tables.next_failed_id = tables.next_failed_id.max(record.id + 1);
                tables.failed.insert(record.id, record);
            }
        }
        catalog
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn images(&self) -> Vec<CatalogImage> {
        self.tables().images.clone()
    }

    pub fn all_failed_images(&self) -> Vec<FailedImageRecord> {
        self.tables().failed.values().cloned().collect()
    }

    /// Drops all failed records of a deleted task.
    pub fn forget_task(&self, task_id: &str) {
        self.tables().failed.retain(|_, record| record.task_id != task_id);
    }
}

impl Catalog for InMemoryCatalog {
    fn register_image(&self, image: CatalogImage) -> Result<(), CatalogError> {
        let mut tables = self.tables();
        tables
            .failed
            .retain(|_, record| !(record.task_id == image.task_id && record.url == image.url));
        tables.images.push(image);
        Ok(())
    }

    fn add_failed_image(&self, record: NewFailedImage) -> Result<FailedImageRecord, CatalogError> {
        let mut tables = self.tables();
        let id = tables.next_failed_id;
        tables.next_failed_id += 1;
        let record = FailedImageRecord {
            id,
            task_id: record.task_id,
            plugin_id: record.plugin_id,
            url: record.url,
            order: record.order,
            created_at: record.created_at,
            last_error: record.last_error,
            last_attempted_at: Some(record.created_at),
            output_album_id: record.output_album_id,
        };
        tables.failed.insert(id, record.clone());
        Ok(record)
    }

    fn update_failed_image(&self, record: &FailedImageRecord) -> Result<(), CatalogError> {
        let mut tables = self.tables();
        let stored = tables
            .failed
            .get_mut(&record.id)
            .ok_or(CatalogError::FailedImageNotFound(record.id))?;
        *stored = record.clone();
        Ok(())
    }

    fn find_failed_image(
        &self,
        task_id: &str,
        url: &str,
    ) -> Result<Option<FailedImageRecord>, CatalogError> {
        Ok(self
            .tables()
            .failed
            .values()
            .find(|record| record.task_id == task_id && record.url == url)
            .cloned())
    }

    fn get_failed_image(&self, id: u64) -> Result<Option<FailedImageRecord>, CatalogError> {
        Ok(self.tables().failed.get(&id).cloned())
    }

    fn remove_failed_image(&self, id: u64) -> Result<bool, CatalogError> {
        Ok(self.tables().failed.remove(&id).is_some())
    }

    fn failed_images(&self, task_id: &str) -> Result<Vec<FailedImageRecord>, CatalogError> {
        let mut records: Vec<_> = self
            .tables()
            .failed
            .values()
            .filter(|record| record.task_id == task_id)
            .cloned()
            .collect();
        records.sort_by_key(|record| (record.order, record.id));
        Ok(records)
    }
}
