//! Copy-on-write disk images.
//!
//! Every VM boots from its own qcow2 overlay whose backing file is a single
//! shared base image. The base is never written to; tearing a VM down only
//! deletes its overlay.

use crate::error::{Result, VmError};
use crate::resource::{ResourceId, ResourceState};
use crate::tool::ToolRunner;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Which image a [`DiskImage`] describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskKind {
    /// Shared read-only base
    Base,
    /// Writable layer owned by one VM
    Overlay {
        /// Owning VM id
        vm: String,
    },
}

/// A disk image on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskImage {
    /// Base or overlay
    pub kind: DiskKind,
    /// Location of the image file
    pub path: PathBuf,
    /// Backing file, for overlays
    pub backing: Option<PathBuf>,
}

impl DiskImage {
    /// Lifecycle id of this image.
    pub fn id(&self) -> ResourceId {
        match &self.kind {
            DiskKind::Base => ResourceId::BaseImage,
            DiskKind::Overlay { vm } => ResourceId::Overlay(vm.clone()),
        }
    }
}

/// What [`ImageManager::create_overlay`] does when the overlay already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverlayPolicy {
    /// Keep the existing overlay and report success
    #[default]
    Reuse,
    /// Fail with [`VmError::ImageExists`]
    Exclusive,
}

/// Where images live on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLayout {
    /// Shared base image
    pub base: PathBuf,
    /// Image the base is materialized from when it is missing. A base without
    /// a source is operator-provided and never removed.
    pub base_source: Option<PathBuf>,
    /// Directory holding one `<vm>.qcow2` overlay per VM
    pub overlay_dir: PathBuf,
}

impl ImageLayout {
    /// Create a layout for an operator-provided base.
    pub fn new(base: impl Into<PathBuf>, overlay_dir: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            base_source: None,
            overlay_dir: overlay_dir.into(),
        }
    }

    /// Materialize the base from `source` when it is missing.
    pub fn with_base_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.base_source = Some(source.into());
        self
    }

    /// Path of the overlay owned by `vm_id`.
    pub fn overlay_path(&self, vm_id: &str) -> PathBuf {
        self.overlay_dir.join(format!("{vm_id}.qcow2"))
    }
}

/// Primitive disk operations an [`ImageManager`] is built on.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    /// Whether an image file exists.
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Produce the base image at `base` from `source`.
    async fn materialize_base(&self, source: &Path, base: &Path) -> Result<()>;

    /// Create a copy-on-write overlay at `overlay` backed by `base`.
    async fn create_overlay(&self, base: &Path, overlay: &Path) -> Result<()>;

    /// Delete an image file. Succeeds if it is already gone.
    async fn remove(&self, path: &Path) -> Result<()>;

    /// Overlay files currently present in `dir`.
    async fn list_overlays(&self, dir: &Path) -> Result<Vec<PathBuf>>;
}

/// Derives per-VM overlays from the shared base and tracks which exist.
pub struct ImageManager<B> {
    backend: B,
    layout: ImageLayout,
    overlays: Mutex<BTreeSet<String>>,
}

impl<B: ImageBackend> ImageManager<B> {
    /// Create a manager over `backend`.
    pub fn new(backend: B, layout: ImageLayout) -> Self {
        Self {
            backend,
            layout,
            overlays: Mutex::new(BTreeSet::new()),
        }
    }

    /// Image locations.
    pub fn layout(&self) -> &ImageLayout {
        &self.layout
    }

    /// Description of the base image.
    pub fn base(&self) -> DiskImage {
        DiskImage {
            kind: DiskKind::Base,
            path: self.layout.base.clone(),
            backing: None,
        }
    }

    /// Description of the overlay owned by `vm_id`.
    pub fn overlay(&self, vm_id: &str) -> DiskImage {
        DiskImage {
            kind: DiskKind::Overlay {
                vm: vm_id.to_string(),
            },
            path: self.layout.overlay_path(vm_id),
            backing: Some(self.layout.base.clone()),
        }
    }

    /// Overlays known to exist, from operations and probes of this manager.
    pub fn overlays(&self) -> Vec<String> {
        self.tracked().iter().cloned().collect()
    }

    fn tracked(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        // The set holds plain strings; a poisoned lock still has valid data.
        self.overlays.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn track(&self, vm_id: &str, present: bool) {
        let mut set = self.tracked();
        if present {
            set.insert(vm_id.to_string());
        } else {
            set.remove(vm_id);
        }
    }

    /// Make sure the shared base exists, materializing it once if a source
    /// is configured. Safe to call repeatedly.
    pub async fn ensure_base(&self) -> Result<DiskImage> {
        let base = self.base();
        if self.backend.exists(&base.path).await? {
            tracing::debug!(path = %base.path.display(), "Base image present");
            return Ok(base);
        }

        let Some(source) = &self.layout.base_source else {
            return Err(VmError::BaseMissing(base.path));
        };

        tracing::info!(
            source = %source.display(),
            path = %base.path.display(),
            "Materializing base image"
        );
        self.backend.materialize_base(source, &base.path).await?;
        Ok(base)
    }

    /// Create the overlay for `vm_id`.
    ///
    /// An existing overlay is kept under [`OverlayPolicy::Reuse`] and rejected
    /// with [`VmError::ImageExists`] under [`OverlayPolicy::Exclusive`].
    pub async fn create_overlay(&self, vm_id: &str, policy: OverlayPolicy) -> Result<DiskImage> {
        let overlay = self.overlay(vm_id);

        if self.backend.exists(&overlay.path).await? {
            self.track(vm_id, true);
            return match policy {
                OverlayPolicy::Reuse => {
                    tracing::info!(vm = vm_id, path = %overlay.path.display(), "Overlay exists, reusing");
                    Ok(overlay)
                }
                OverlayPolicy::Exclusive => Err(VmError::ImageExists(overlay.path)),
            };
        }

        if !self.backend.exists(&self.layout.base).await? {
            return Err(VmError::BaseMissing(self.layout.base.clone()));
        }

        self.backend
            .create_overlay(&self.layout.base, &overlay.path)
            .await?;
        self.track(vm_id, true);
        tracing::info!(vm = vm_id, path = %overlay.path.display(), "Overlay created");
        Ok(overlay)
    }

    /// Delete the overlay for `vm_id`. No-op if it is already absent.
    pub async fn destroy_overlay(&self, vm_id: &str) -> Result<()> {
        let path = self.layout.overlay_path(vm_id);
        if !self.backend.exists(&path).await? {
            tracing::debug!(vm = vm_id, "Overlay already absent");
            self.track(vm_id, false);
            return Ok(());
        }

        self.backend.remove(&path).await?;
        self.track(vm_id, false);
        tracing::info!(vm = vm_id, path = %path.display(), "Overlay removed");
        Ok(())
    }

    /// Remove the base once nothing references it.
    ///
    /// Returns whether the base was removed. Operator-provided bases (no
    /// source configured) are always kept, as is a base with overlays left in
    /// the overlay directory.
    pub async fn release_base(&self) -> Result<bool> {
        if self.layout.base_source.is_none() {
            tracing::debug!("Base image is operator-provided, keeping it");
            return Ok(false);
        }

        let mut remaining = self.backend.list_overlays(&self.layout.overlay_dir).await?;
        remaining.retain(|p| p != &self.layout.base);
        if !remaining.is_empty() {
            tracing::info!(
                remaining = remaining.len(),
                "Base image still referenced by overlays, keeping it"
            );
            return Ok(false);
        }

        if !self.backend.exists(&self.layout.base).await? {
            return Ok(false);
        }

        self.backend.remove(&self.layout.base).await?;
        tracing::info!(path = %self.layout.base.display(), "Base image removed");
        Ok(true)
    }

    /// Whether the base currently exists.
    pub async fn probe_base(&self) -> Result<ResourceState> {
        Ok(presence(self.backend.exists(&self.layout.base).await?))
    }

    /// Whether the overlay for `vm_id` currently exists.
    pub async fn probe_overlay(&self, vm_id: &str) -> Result<ResourceState> {
        let present = self
            .backend
            .exists(&self.layout.overlay_path(vm_id))
            .await?;
        self.track(vm_id, present);
        Ok(presence(present))
    }
}

fn presence(exists: bool) -> ResourceState {
    if exists {
        ResourceState::Defined
    } else {
        ResourceState::Absent
    }
}

/// [`ImageBackend`] using `qemu-img` and the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct QemuImg {
    tools: ToolRunner,
}

impl QemuImg {
    /// Create a backend. Image files are created as the invoking user.
    pub fn new() -> Self {
        Self {
            tools: ToolRunner::new(false),
        }
    }
}

#[async_trait]
impl ImageBackend for QemuImg {
    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }

    #[tracing::instrument(skip(self))]
    async fn materialize_base(&self, source: &Path, base: &Path) -> Result<()> {
        if let Some(parent) = base.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let source = source.to_string_lossy();
        let base = base.to_string_lossy();
        self.tools
            .run("qemu-img", &["convert", "-O", "qcow2", &source, &base])
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn create_overlay(&self, base: &Path, overlay: &Path) -> Result<()> {
        if let Some(parent) = overlay.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Backing paths are resolved relative to the overlay, so pin them.
        let base = tokio::fs::canonicalize(base).await?;
        let base = base.to_string_lossy();
        let overlay = overlay.to_string_lossy();
        self.tools
            .run(
                "qemu-img",
                &["create", "-f", "qcow2", "-F", "qcow2", "-b", &base, &overlay],
            )
            .await?;
        Ok(())
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_overlays(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut overlays = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "qcow2") {
                overlays.push(path);
            }
        }
        overlays.sort();
        Ok(overlays)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_path() {
        let layout = ImageLayout::new("/srv/base.qcow2", "/srv/images");
        assert_eq!(
            layout.overlay_path("backend-1"),
            PathBuf::from("/srv/images/backend-1.qcow2")
        );
        assert!(layout.base_source.is_none());
    }

    #[test]
    fn test_disk_image_ids() {
        let manager = ImageManager::new(QemuImg::new(), ImageLayout::new("b.qcow2", "images"));
        assert_eq!(manager.base().id(), ResourceId::BaseImage);
        let overlay = manager.overlay("router");
        assert_eq!(overlay.id(), ResourceId::Overlay("router".into()));
        assert_eq!(overlay.backing, Some(PathBuf::from("b.qcow2")));
    }

    #[tokio::test]
    async fn test_qemu_img_remove_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let backend = QemuImg::new();
        backend.remove(&dir.path().join("nope.qcow2")).await.unwrap();
    }

    #[tokio::test]
    async fn test_qemu_img_lists_only_qcow2() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("backend-1.qcow2"), b"").unwrap();
        std::fs::write(dir.path().join("router.qcow2"), b"").unwrap();
        std::fs::write(dir.path().join("router.xml"), b"").unwrap();

        let backend = QemuImg::new();
        let listed = backend.list_overlays(dir.path()).await.unwrap();
        assert_eq!(
            listed,
            vec![
                dir.path().join("backend-1.qcow2"),
                dir.path().join("router.qcow2")
            ]
        );
        assert!(backend
            .list_overlays(&dir.path().join("missing"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_ensure_base_without_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ImageManager::new(
            QemuImg::new(),
            ImageLayout::new(dir.path().join("base.qcow2"), dir.path().join("images")),
        );
        let err = manager.ensure_base().await.unwrap_err();
        assert!(matches!(err, VmError::BaseMissing(_)));
        assert_eq!(manager.probe_base().await.unwrap(), ResourceState::Absent);
    }

    #[tokio::test]
    async fn test_release_keeps_operator_base() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.qcow2");
        std::fs::write(&base, b"").unwrap();
        let manager = ImageManager::new(
            QemuImg::new(),
            ImageLayout::new(&base, dir.path().join("images")),
        );
        assert!(!manager.release_base().await.unwrap());
        assert!(base.exists());
    }
}
