//! Disk port (§4.4): builds small labeled FAT32/ISO9660 images containing
//! the files a cloud-init datasource expects to find on a seed volume.
//!
//! Both writers are hand-rolled, pure-Rust byte-buffer builders with no
//! FFI, in the same spirit as a minimal disk-image generator that only
//! needs to produce something real tooling can read, not every corner of
//! its format.

mod fat32;
mod iso9660;

use std::path::Path;

use async_trait::async_trait;
use base64::Engine as _;
use mikrolite::ports::{DiskFile, DiskImageType, DiskPort, PortError};

/// Errors building a disk image.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// `path` already exists and `overwrite` was false.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// The `size` string couldn't be parsed (e.g. `"8Mb"`, `"512Kb"`).
    #[error("invalid size {0:?}")]
    InvalidSize(String),

    /// A [`DiskFile`]'s `content_base64` field was not valid base64.
    #[error("invalid base64 content for {0}: {1}")]
    InvalidContent(String, base64::DecodeError),

    /// Filesystem I/O error writing the image.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Disk port backed by the pure-Rust FAT32/ISO9660 writers in this crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct Disk;

#[async_trait]
impl DiskPort for Disk {
    async fn create(
        &self,
        path: &Path,
        size: &str,
        volume_name: &str,
        image_type: DiskImageType,
        overwrite: bool,
        files: &[DiskFile],
    ) -> Result<(), PortError> {
        if !overwrite && path.exists() {
            return Err(Error::AlreadyExists(path.display().to_string()).into());
        }

        let min_size = parse_size(size)?;
        let decoded = decode_files(files)?;

        match image_type {
            DiskImageType::Fat32 => {
                let entries: Vec<fat32::FileEntry<'_>> = decoded
                    .iter()
                    .map(|(name, data)| fat32::FileEntry { name, data })
                    .collect();
                fat32::create(path, min_size, volume_name, &entries).map_err(Error::Io)?;
            }
            DiskImageType::Iso9660 => {
                let entries: Vec<iso9660::FileEntry<'_>> = decoded
                    .iter()
                    .map(|(name, data)| iso9660::FileEntry { name, data })
                    .collect();
                iso9660::create(path, min_size, volume_name, &entries).map_err(Error::Io)?;
            }
            other => return Err(Error::Io(unsupported_image_type(other)).into()),
        }

        Ok(())
    }
}

fn decode_files(files: &[DiskFile]) -> Result<Vec<(String, Vec<u8>)>, Error> {
    files
        .iter()
        .map(|f| {
            let data = base64::engine::general_purpose::STANDARD
                .decode(&f.content_base64)
                .map_err(|e| Error::InvalidContent(f.path.clone(), e))?;
            Ok((f.path.clone(), data))
        })
        .collect()
}

/// Parses a human-readable size such as `"8Mb"`/`"512Kb"`/`"1Gb"` into bytes.
/// Accepts a bare byte count too (`"4194304"`).
fn parse_size(s: &str) -> Result<u64, Error> {
    let trimmed = s.trim();
    let split_at = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split_at);
    let value: u64 = digits.parse().map_err(|_| Error::InvalidSize(s.to_owned()))?;
    let multiplier = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kb" | "k" => 1024,
        "mb" | "m" => 1024 * 1024,
        "gb" | "g" => 1024 * 1024 * 1024,
        _ => return Err(Error::InvalidSize(s.to_owned())),
    };
    Ok(value * multiplier)
}

fn unsupported_image_type(image_type: DiskImageType) -> std::io::Error {
    std::io::Error::other(format!("unsupported disk image type: {image_type:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_human_readable_sizes() {
        assert_eq!(parse_size("8Mb").unwrap(), 8 * 1024 * 1024);
        assert_eq!(parse_size("512Kb").unwrap(), 512 * 1024);
        assert_eq!(parse_size("1Gb").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("4194304").unwrap(), 4_194_304);
        assert!(parse_size("not-a-size").is_err());
    }

    #[tokio::test]
    async fn creates_a_fat32_seed_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cidata.img");
        let files = vec![DiskFile {
            path: "meta-data".to_owned(),
            content_base64: base64::engine::general_purpose::STANDARD.encode(b"instance-id: x\n"),
        }];
        Disk
            .create(&path, "8Mb", "CIDATA", DiskImageType::Fat32, true, &files)
            .await
            .unwrap();
        assert!(path.exists());
        assert!(std::fs::metadata(&path).unwrap().len() >= 8 * 1024 * 1024);
    }

    #[tokio::test]
    async fn refuses_to_overwrite_unless_asked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cidata.img");
        std::fs::write(&path, b"existing").unwrap();

        let err = Disk
            .create(&path, "8Mb", "CIDATA", DiskImageType::Fat32, false, &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }
}
