//! Content-addressed blob cache, per-owner snapshot leases, and the index of
//! locally pulled images.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rusqlite::OptionalExtension as _;
use sha2::Digest as _;

const BLOBS_DIR: &str = "blobs/sha256";
const LEASES_DIR: &str = "leases";

/// Metadata for a locally cached image, indexed by reference string.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ImageMeta {
    /// Full image reference, e.g. `docker.io/library/alpine:3.19`.
    pub reference: String,
    /// Manifest content digest.
    pub digest: String,
    /// Total compressed layer size in bytes.
    pub size: u64,
}

/// Computes the `sha256:<hex>` digest of a byte slice.
pub fn content_digest(data: &[u8]) -> String {
    let hash = sha2::Sha256::digest(data);
    let hex: String = hash.iter().map(|b| format!("{b:02x}")).collect();
    format!("sha256:{hex}")
}

/// Content-addressed cache of OCI layer blobs, shared across every owner.
#[derive(Debug)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Opens the blob cache rooted at `root`, creating it if absent.
    pub fn open(root: &Path) -> io::Result<Self> {
        fs::create_dir_all(root.join(BLOBS_DIR))?;
        Ok(Self { root: root.to_path_buf() })
    }

    /// Path a blob with `digest` is (or would be) stored at.
    pub fn path(&self, digest: &str) -> PathBuf {
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        self.root.join(BLOBS_DIR).join(hex)
    }

    /// Returns `true` if a blob with `digest` is already cached.
    pub fn has(&self, digest: &str) -> bool {
        self.path(digest).exists()
    }

    /// Writes `data` under its content digest, skipping the write if it is
    /// already cached.
    pub fn save(&self, digest: &str, data: &[u8]) -> io::Result<()> {
        if self.has(digest) {
            return Ok(());
        }
        fs::write(self.path(digest), data)
    }
}

/// Per-`(owner, image_id)` snapshot leases (§4.2, §9 shared-resource
/// policy).
///
/// Every owner's snapshots live under one directory so `cleanup` can
/// release all of them in a single `remove_dir_all`. The blob cache above
/// is untouched by this, since it is shared across owners.
#[derive(Debug)]
pub struct LeaseStore {
    root: PathBuf,
}

impl LeaseStore {
    /// Opens the lease store rooted at `root`, creating it if absent.
    pub fn open(root: &Path) -> io::Result<Self> {
        fs::create_dir_all(root.join(LEASES_DIR))?;
        Ok(Self { root: root.to_path_buf() })
    }

    /// Directory a native snapshot for `(owner, image_id)` unpacks into.
    pub fn native_snapshot_dir(&self, owner: &str, image_id: &str) -> PathBuf {
        self.root.join(LEASES_DIR).join(owner).join(image_id)
    }

    /// File a devmapper snapshot for `(owner, image_id)` occupies.
    pub fn devmapper_snapshot_file(&self, owner: &str, image_id: &str) -> PathBuf {
        self.root
            .join(LEASES_DIR)
            .join(owner)
            .join(format!("{image_id}.img"))
    }

    /// Deletes every snapshot pinned by `owner`'s lease. Tolerates the lease
    /// already being gone.
    pub fn cleanup(&self, owner: &str) -> io::Result<()> {
        match fs::remove_dir_all(self.root.join(LEASES_DIR).join(owner)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// SQLite index of locally pulled images, keyed by reference string.
#[derive(Debug)]
pub struct ImageIndex {
    conn: rusqlite::Connection,
}

impl ImageIndex {
    /// Opens (creating if absent) the index database under `root`.
    pub fn open(root: &Path) -> rusqlite::Result<Self> {
        let conn = rusqlite::Connection::open(root.join("images.db"))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS images (
                reference TEXT PRIMARY KEY,
                digest    TEXT NOT NULL,
                size      INTEGER NOT NULL
            )",
        )?;
        Ok(Self { conn })
    }

    /// Inserts or replaces an image's index entry.
    pub fn upsert(&self, meta: &ImageMeta) -> rusqlite::Result<()> {
        self.conn.execute(
            "INSERT INTO images (reference, digest, size) VALUES (?1, ?2, ?3)
             ON CONFLICT(reference) DO UPDATE SET digest = excluded.digest, size = excluded.size",
            rusqlite::params![meta.reference, meta.digest, meta.size],
        )?;
        Ok(())
    }

    /// Looks up an image by reference.
    pub fn get(&self, reference: &str) -> rusqlite::Result<Option<ImageMeta>> {
        self.conn
            .query_row(
                "SELECT reference, digest, size FROM images WHERE reference = ?1",
                [reference],
                row_to_meta,
            )
            .optional()
    }

    /// Lists every indexed image, ordered by reference.
    pub fn list(&self) -> rusqlite::Result<Vec<ImageMeta>> {
        let mut stmt = self
            .conn
            .prepare("SELECT reference, digest, size FROM images ORDER BY reference")?;
        let rows = stmt.query_map([], row_to_meta)?;
        rows.collect()
    }
}

fn row_to_meta(row: &rusqlite::Row<'_>) -> rusqlite::Result<ImageMeta> {
    Ok(ImageMeta {
        reference: row.get(0)?,
        digest: row.get(1)?,
        size: row.get(2)?,
    })
}
