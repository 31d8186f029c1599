//! OCI image port (§4.2): pulls, caches, and snapshots container images for
//! use as microVM kernels and rootfs.
//!
//! Layers are cached content-addressed under a blob store shared across
//! every owner, so two VMs pulling the same image only hit the registry
//! once. Snapshots are scoped per `(owner, image_id)`: a lease directory
//! that [`Oci::cleanup`] releases in one shot when a VM is torn down.

#![allow(clippy::missing_docs_in_private_items)]

mod extract;
mod store;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use mikrolite::ports::{ImagePort, PortError, Snapshotter};
use mikrolite::{Mount, MountKind};
pub use store::ImageMeta;

/// Accepted layer media types (OCI + Docker).
const ACCEPTED_MEDIA_TYPES: &[&str] = &[
    "application/vnd.oci.image.layer.v1.tar+gzip",
    "application/vnd.docker.image.rootfs.diff.tar.gzip",
];

/// Headroom added on top of a snapshot's unpacked size when sizing a
/// devmapper image file, to leave room for ext4 metadata and growth.
const DEVMAPPER_SLACK_BYTES: u64 = 32 * 1024 * 1024;

/// Result type for `mikrolite-oci` operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from OCI image operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The image reference string could not be parsed.
    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    /// The registry rejected the pull or was unreachable.
    #[error("registry: {0}")]
    Registry(String),

    /// `snapshotter` named something other than `native` or `devmapper`.
    #[error("unsupported snapshotter: {0:?}")]
    UnsupportedSnapshotter(Snapshotter),

    /// The devmapper snapshotter's `mkfs.ext4` step failed.
    #[error("devmapper snapshot: {0}")]
    Devmapper(String),

    /// A blocking extraction/format task panicked or was cancelled.
    #[error("background task: {0}")]
    Join(String),

    /// Local image index error.
    #[error("local image index: {0}")]
    Index(#[from] rusqlite::Error),

    /// Filesystem I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// OCI image manager backed by a content-addressed blob cache.
pub struct Oci {
    blobs: store::BlobStore,
    leases: store::LeaseStore,
    index: std::sync::Mutex<store::ImageIndex>,
    client: oci_client::Client,
    auth: oci_client::secrets::RegistryAuth,
}

impl std::fmt::Debug for Oci {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Oci").finish_non_exhaustive()
    }
}

impl Oci {
    /// Opens (creating if absent) the image store rooted at `root`, using
    /// anonymous registry authentication.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            blobs: store::BlobStore::open(&root)?,
            leases: store::LeaseStore::open(&root)?,
            index: std::sync::Mutex::new(store::ImageIndex::open(&root)?),
            client: oci_client::Client::new(oci_client::client::ClientConfig::default()),
            auth: oci_client::secrets::RegistryAuth::Anonymous,
        })
    }

    /// Lists every locally cached image.
    pub fn images(&self) -> Result<Vec<ImageMeta>> {
        Ok(self.index.lock().expect("lock").list()?)
    }

    /// Pulls `image_name`, caching each layer blob content-addressed, and
    /// returns the decoded layer bytes in order.
    async fn pull_layers(&self, image_name: &str) -> Result<Vec<Vec<u8>>> {
        let reference: oci_client::Reference = image_name
            .parse()
            .map_err(|e: oci_client::ParseError| Error::InvalidReference(e.to_string()))?;

        let image_data = self
            .client
            .pull(&reference, &self.auth, ACCEPTED_MEDIA_TYPES.to_vec())
            .await
            .map_err(|e| Error::Registry(e.to_string()))?;

        let mut layers = Vec::with_capacity(image_data.layers.len());
        let mut total_size: u64 = 0;
        for layer in &image_data.layers {
            let digest = store::content_digest(&layer.data);
            self.blobs.save(&digest, &layer.data)?;
            total_size += layer.data.len() as u64;
            layers.push(layer.data.clone());
        }

        self.index.lock().expect("lock").upsert(&ImageMeta {
            reference: reference.to_string(),
            digest: image_data.digest.clone().unwrap_or_default(),
            size: total_size,
        })?;

        Ok(layers)
    }

    async fn native_snapshot(
        &self,
        owner: &str,
        image_name: &str,
        image_id: &str,
    ) -> Result<Mount> {
        let dir = self.leases.native_snapshot_dir(owner, image_id);
        if dir.is_dir() {
            return Ok(Mount { kind: MountKind::FilesystemPath, location: path_to_string(&dir) });
        }

        let layers = self.pull_layers(image_name).await?;
        let parent = dir.parent().expect("lease dir has a parent").to_path_buf();
        let target = dir.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            std::fs::create_dir_all(&parent)?;
            let staging = tempfile::tempdir_in(&parent)?;
            extract::extract_layers(&layers, staging.path())?;
            if !target.is_dir() {
                std::fs::rename(staging.path(), &target)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| Error::Join(e.to_string()))??;

        Ok(Mount { kind: MountKind::FilesystemPath, location: path_to_string(&dir) })
    }

    async fn devmapper_snapshot(
        &self,
        owner: &str,
        image_name: &str,
        image_id: &str,
    ) -> Result<Mount> {
        let image_file = self.leases.devmapper_snapshot_file(owner, image_id);
        if image_file.is_file() {
            return Ok(Mount {
                kind: MountKind::BlockDevice,
                location: path_to_string(&image_file),
            });
        }

        let layers = self.pull_layers(image_name).await?;
        let parent = image_file
            .parent()
            .expect("lease file has a parent")
            .to_path_buf();
        let staging = tokio::task::spawn_blocking(move || -> Result<tempfile::TempDir> {
            std::fs::create_dir_all(&parent)?;
            let staging = tempfile::tempdir_in(&parent)?;
            extract::extract_layers(&layers, staging.path())?;
            Ok(staging)
        })
        .await
        .map_err(|e| Error::Join(e.to_string()))??;

        mkfs_ext4(staging.path(), &image_file).await?;
        Ok(Mount { kind: MountKind::BlockDevice, location: path_to_string(&image_file) })
    }
}

#[async_trait]
impl ImagePort for Oci {
    async fn pull_and_mount(
        &self,
        owner: &str,
        image_name: &str,
        image_id: &str,
        snapshotter: Snapshotter,
    ) -> std::result::Result<Mount, PortError> {
        let mount = match snapshotter {
            Snapshotter::Native => self.native_snapshot(owner, image_name, image_id).await?,
            Snapshotter::Devmapper => self.devmapper_snapshot(owner, image_name, image_id).await?,
            other => return Err(Error::UnsupportedSnapshotter(other).into()),
        };
        Ok(mount)
    }

    async fn cleanup(&self, owner: &str) -> std::result::Result<(), PortError> {
        self.leases.cleanup(owner).map_err(Error::from)?;
        Ok(())
    }
}

/// Formats `image` as ext4 sized to fit `source_dir` plus slack, seeding it
/// with `source_dir`'s contents via `mkfs.ext4 -d`.
async fn mkfs_ext4(source_dir: &Path, image: &Path) -> Result<()> {
    let size = directory_size(source_dir)? + DEVMAPPER_SLACK_BYTES;
    let file = std::fs::File::create(image)?;
    file.set_len(size)?;
    drop(file);

    let status = tokio::process::Command::new("mkfs.ext4")
        .arg("-q")
        .arg("-d")
        .arg(source_dir)
        .arg(image)
        .status()
        .await?;

    if !status.success() {
        let _ = std::fs::remove_file(image);
        return Err(Error::Devmapper(format!("mkfs.ext4 exited with {status}")));
    }
    Ok(())
}

/// Recursively sums the byte size of every regular file under `dir`.
fn directory_size(dir: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        total += if metadata.is_dir() {
            directory_size(&entry.path())?
        } else {
            metadata.len()
        };
    }
    Ok(total)
}

fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
