//! Local implementations of the backup collaborator ports

use crate::domain::ports::{DefinitionStore, DiskSpace, ImageStore};
use crate::domain::service::{ServiceDefinition, ServiceTemplate};
use crate::error::{Error, Result};
use crate::fsutil::{blocking, existing_ancestor, fs_usage, write_atomic};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

// =============================================================================
// Definitions
// =============================================================================

/// On-disk shape of a definitions file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DefinitionsDocument {
    pub templates: Vec<ServiceTemplate>,
    pub services: Vec<ServiceDefinition>,
}

/// Definition store held in memory, optionally backed by a JSON or YAML
/// file that is rewritten after every restore
#[derive(Debug)]
pub struct MemoryDefinitionStore {
    document: RwLock<DefinitionsDocument>,
    persist_to: Option<PathBuf>,
}

impl MemoryDefinitionStore {
    pub fn new(templates: Vec<ServiceTemplate>, services: Vec<ServiceDefinition>) -> Self {
        Self {
            document: RwLock::new(DefinitionsDocument {
                templates,
                services,
            }),
            persist_to: None,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    /// Load definitions from `path`; `.json` files are JSON, anything else
    /// is YAML. A missing file starts an empty store that will be created on
    /// the first restore.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let document = match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => DefinitionsDocument::default(),
            Ok(content) if is_json(&path) => serde_json::from_str(&content)?,
            Ok(content) => serde_yaml::from_str(&content)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Definitions file absent, starting empty");
                DefinitionsDocument::default()
            }
            Err(e) => return Err(e.into()),
        };
        info!(
            path = %path.display(),
            templates = document.templates.len(),
            services = document.services.len(),
            "Loaded definitions"
        );
        Ok(Self {
            document: RwLock::new(document),
            persist_to: Some(path),
        })
    }

    pub fn document(&self) -> DefinitionsDocument {
        self.document.read().clone()
    }

    async fn persist(&self) -> Result<()> {
        let Some(path) = self.persist_to.clone() else {
            return Ok(());
        };
        let document = self.document();
        let data = if is_json(&path) {
            serde_json::to_vec_pretty(&document)?
        } else {
            serde_yaml::to_string(&document)?.into_bytes()
        };
        blocking(move || {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            write_atomic(&path, &data)
        })
        .await
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Replace entries sharing an id, append the rest
fn upsert<T>(existing: &mut Vec<T>, incoming: Vec<T>, id: impl Fn(&T) -> &str) {
    for item in incoming {
        match existing.iter_mut().find(|e| id(&**e) == id(&item)) {
            Some(slot) => *slot = item,
            None => existing.push(item),
        }
    }
}

#[async_trait]
impl DefinitionStore for MemoryDefinitionStore {
    async fn templates(&self) -> Result<Vec<ServiceTemplate>> {
        Ok(self.document.read().templates.clone())
    }

    async fn services(&self) -> Result<Vec<ServiceDefinition>> {
        Ok(self.document.read().services.clone())
    }

    async fn restore_templates(&self, templates: Vec<ServiceTemplate>) -> Result<()> {
        upsert(&mut self.document.write().templates, templates, |t| t.id.as_str());
        self.persist().await
    }

    async fn restore_services(&self, services: Vec<ServiceDefinition>) -> Result<()> {
        upsert(&mut self.document.write().services, services, |s| s.id.as_str());
        self.persist().await
    }
}

// =============================================================================
// Images
// =============================================================================

const INDEX_FILE: &str = "images.json";
const BLOBS_DIR: &str = "blobs";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ImageIndex {
    images: BTreeMap<String, ImageEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ImageEntry {
    /// Blob file name under `blobs/`
    file: String,
    size: u64,
}

/// Image store keeping one blob file per image beneath a directory, with a
/// JSON index mapping image ids to blobs.
///
/// Image exports are plain tar files holding a subset index and the blobs.
pub struct DirectoryImageStore {
    root: PathBuf,
    lock: AsyncMutex<()>,
}

impl DirectoryImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: AsyncMutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store `data` as image `image_id`, replacing an existing image
    pub async fn add_image(&self, image_id: &str, data: Vec<u8>) -> Result<()> {
        if image_id.trim().is_empty() {
            return Err(Error::InvalidName {
                kind: "image",
                name: image_id.to_string(),
            });
        }
        let _guard = self.lock.lock().await;
        let root = self.root.clone();
        let id = image_id.to_string();
        blocking(move || {
            let mut index = load_index(&root)?;
            insert_blob(&root, &mut index, &id, |target| {
                write_atomic(target, &data)?;
                Ok(data.len() as u64)
            })?;
            save_index(&root, &index)
        })
        .await?;
        debug!(image = image_id, "Stored image");
        Ok(())
    }

    /// Ids of all stored images, sorted
    pub async fn images(&self) -> Result<Vec<String>> {
        let root = self.root.clone();
        let index = blocking(move || load_index(&root)).await?;
        Ok(index.images.into_keys().collect())
    }

    pub async fn read_image(&self, image_id: &str) -> Result<Vec<u8>> {
        let root = self.root.clone();
        let id = image_id.to_string();
        blocking(move || {
            let index = load_index(&root)?;
            let entry = lookup(&index, &id)?;
            Ok(fs::read(root.join(BLOBS_DIR).join(&entry.file))?)
        })
        .await
    }
}

fn load_index(root: &Path) -> Result<ImageIndex> {
    match fs::read(root.join(INDEX_FILE)) {
        Ok(data) => Ok(serde_json::from_slice(&data)?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(ImageIndex::default()),
        Err(e) => Err(e.into()),
    }
}

fn save_index(root: &Path, index: &ImageIndex) -> Result<()> {
    fs::create_dir_all(root)?;
    write_atomic(&root.join(INDEX_FILE), &serde_json::to_vec_pretty(index)?)
}

fn lookup<'a>(index: &'a ImageIndex, image_id: &str) -> Result<&'a ImageEntry> {
    index
        .images
        .get(image_id)
        .ok_or_else(|| Error::ResourceNotFound {
            kind: "image".into(),
            name: image_id.to_string(),
        })
}

/// Blob file name for an image id, unique within `index`
fn blob_name(index: &ImageIndex, image_id: &str) -> String {
    if let Some(entry) = index.images.get(image_id) {
        return entry.file.clone();
    }
    let base: String = image_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let base = base.trim_start_matches('.').to_string();
    let taken = |name: &str| index.images.values().any(|e| e.file == name);

    let mut name = base.clone();
    let mut n = 1;
    while name.is_empty() || taken(&name) {
        name = format!("{}-{}", base, n);
        n += 1;
    }
    name
}

fn insert_blob(
    root: &Path,
    index: &mut ImageIndex,
    image_id: &str,
    write: impl FnOnce(&Path) -> Result<u64>,
) -> Result<()> {
    let blobs = root.join(BLOBS_DIR);
    fs::create_dir_all(&blobs)?;
    let file = blob_name(index, image_id);
    let size = write(&blobs.join(&file))?;
    index
        .images
        .insert(image_id.to_string(), ImageEntry { file, size });
    Ok(())
}

#[async_trait]
impl ImageStore for DirectoryImageStore {
    async fn image_size(&self, image_id: &str) -> Result<u64> {
        let root = self.root.clone();
        let id = image_id.to_string();
        blocking(move || Ok(lookup(&load_index(&root)?, &id)?.size)).await
    }

    async fn export_images(&self, image_ids: &[String], filename: &Path) -> Result<()> {
        let _guard = self.lock.lock().await;
        let root = self.root.clone();
        let ids = image_ids.to_vec();
        let target = filename.to_path_buf();
        blocking(move || {
            let index = load_index(&root)?;
            let mut subset = ImageIndex::default();
            for id in &ids {
                subset.images.insert(id.clone(), lookup(&index, id)?.clone());
            }

            let dir = target
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let mut staged = tempfile::Builder::new()
                .prefix(".images-")
                .tempfile_in(dir)?;
            {
                let mut builder = tar::Builder::new(BufWriter::new(staged.as_file_mut()));
                let index_data = serde_json::to_vec_pretty(&subset)?;
                let mut header = tar::Header::new_gnu();
                header.set_size(index_data.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append_data(&mut header, INDEX_FILE, index_data.as_slice())?;

                for entry in subset.images.values() {
                    let blob = root.join(BLOBS_DIR).join(&entry.file);
                    builder.append_path_with_name(&blob, Path::new(BLOBS_DIR).join(&entry.file))?;
                }
                builder.into_inner()?.flush()?;
            }
            staged.as_file().sync_all()?;
            staged.persist(&target).map_err(|e| Error::Io(e.error))?;
            Ok(())
        })
        .await?;
        info!(images = image_ids.len(), file = %filename.display(), "Exported images");
        Ok(())
    }

    async fn import_images(&self, filename: &Path) -> Result<Vec<String>> {
        let _guard = self.lock.lock().await;
        let root = self.root.clone();
        let source = filename.to_path_buf();
        let imported = blocking(move || {
            let invalid = |reason: String| Error::InvalidArchive {
                path: source.clone(),
                reason,
            };

            fs::create_dir_all(&root)?;
            let staging = tempfile::Builder::new()
                .prefix(".import-")
                .tempdir_in(&root)?;
            tar::Archive::new(File::open(&source)?)
                .unpack(staging.path())
                .map_err(|e| invalid(format!("cannot unpack images: {}", e)))?;

            let incoming: ImageIndex = fs::read(staging.path().join(INDEX_FILE))
                .map_err(|e| invalid(format!("missing image index: {}", e)))
                .and_then(|data| {
                    serde_json::from_slice(&data)
                        .map_err(|e| invalid(format!("bad image index: {}", e)))
                })?;

            let mut index = load_index(&root)?;
            for (id, entry) in &incoming.images {
                let plain = Path::new(&entry.file)
                    .file_name()
                    .map(|name| name == entry.file.as_str())
                    .unwrap_or(false);
                if !plain {
                    return Err(invalid(format!("image blob {:?} is not a file name", entry.file)));
                }
                let blob = staging.path().join(BLOBS_DIR).join(&entry.file);
                insert_blob(&root, &mut index, id, |target| {
                    let size = fs::metadata(&blob)?.len();
                    fs::rename(&blob, target)?;
                    Ok(size)
                })?;
            }
            save_index(&root, &index)?;
            Ok(incoming.images.into_keys().collect::<Vec<_>>())
        })
        .await?;
        info!(images = imported.len(), file = %filename.display(), "Imported images");
        Ok(imported)
    }
}

// =============================================================================
// Disk space
// =============================================================================

/// Free-space probe backed by `statvfs`. Paths that do not exist yet are
/// measured at their closest existing ancestor.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsDiskSpace;

impl DiskSpace for StatvfsDiskSpace {
    fn available_bytes(&self, path: &Path) -> Result<u64> {
        let probe = existing_ancestor(path).ok_or_else(|| Error::ResourceNotFound {
            kind: "path".into(),
            name: path.display().to_string(),
        })?;
        Ok(fs_usage(probe)?.available_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    fn sample_services() -> Vec<ServiceDefinition> {
        vec![
            ServiceDefinition::new("app1", "Zenoss").with_image("repo/app:1"),
            ServiceDefinition::new("svc-a", "mysql").with_parent("app1"),
        ]
    }

    #[tokio::test]
    async fn test_definition_store_upserts_and_persists() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("definitions.yaml");

        let store = MemoryDefinitionStore::from_file(&path).unwrap();
        assert!(store.services().await.unwrap().is_empty());

        store.restore_services(sample_services()).await.unwrap();
        store
            .restore_services(vec![ServiceDefinition::new("svc-a", "mariadb").with_parent("app1")])
            .await
            .unwrap();
        store
            .restore_templates(vec![ServiceTemplate::new("t1", "base")])
            .await
            .unwrap();

        let services = store.services().await.unwrap();
        assert_eq!(services.len(), 2);
        assert_eq!(services[1].name, "mariadb");

        let reloaded = MemoryDefinitionStore::from_file(&path).unwrap();
        assert_eq!(reloaded.document(), store.document());
    }

    #[tokio::test]
    async fn test_definition_store_reads_json() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("definitions.json");
        fs::write(
            &path,
            r#"{"services":[{"id":"app1","name":"Zenoss","imageId":"repo/app:1"}]}"#,
        )
        .unwrap();

        let store = MemoryDefinitionStore::from_file(&path).unwrap();
        let services = store.services().await.unwrap();
        assert_eq!(services[0].image_id.as_deref(), Some("repo/app:1"));
        assert!(store.templates().await.unwrap().is_empty());

        fs::write(&path, "{ not json").unwrap();
        assert_matches!(
            MemoryDefinitionStore::from_file(&path),
            Err(Error::JsonParse(_))
        );
    }

    #[tokio::test]
    async fn test_image_store_export_import() {
        let tmp = TempDir::new().unwrap();
        let source = DirectoryImageStore::new(tmp.path().join("src"));
        source.add_image("repo/app:1", b"app layers".to_vec()).await.unwrap();
        source.add_image("repo/app_1", b"other".to_vec()).await.unwrap();
        source.add_image("repo/db:5", b"db layers!".to_vec()).await.unwrap();

        assert_eq!(source.image_size("repo/db:5").await.unwrap(), 10);
        assert_matches!(
            source.image_size("missing").await,
            Err(Error::ResourceNotFound { .. })
        );

        let export = tmp.path().join("images.tar");
        let wanted = vec!["repo/app:1".to_string(), "repo/app_1".to_string()];
        source.export_images(&wanted, &export).await.unwrap();

        let target = DirectoryImageStore::new(tmp.path().join("dst"));
        let imported = target.import_images(&export).await.unwrap();
        assert_eq!(imported, wanted);
        assert_eq!(target.images().await.unwrap(), wanted);
        assert_eq!(target.read_image("repo/app:1").await.unwrap(), b"app layers");
        assert_eq!(target.read_image("repo/app_1").await.unwrap(), b"other");
    }

    #[tokio::test]
    async fn test_image_export_of_unknown_image_fails_cleanly() {
        let tmp = TempDir::new().unwrap();
        let store = DirectoryImageStore::new(tmp.path().join("images"));
        store.add_image("repo/app:1", b"x".to_vec()).await.unwrap();

        let out = tmp.path().join("out");
        fs::create_dir(&out).unwrap();
        let err = store
            .export_images(&["nope".to_string()], &out.join("images.tar"))
            .await
            .unwrap_err();
        assert_matches!(err, Error::ResourceNotFound { .. });
        assert_eq!(fs::read_dir(&out).unwrap().count(), 0);
    }

    #[test]
    fn test_statvfs_probe_uses_existing_ancestor() {
        let tmp = TempDir::new().unwrap();
        let probe = StatvfsDiskSpace;
        let missing = tmp.path().join("backups/nightly");
        assert!(probe.available_bytes(&missing).unwrap() > 0);
    }
}
