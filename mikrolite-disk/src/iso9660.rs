//! Minimal ISO9660 image writer (pure Rust, no external dependencies).
//!
//! A single flat root directory, no Rock Ridge or Joliet extensions — this
//! is enough for a cloud-init NoCloud seed volume (a handful of small
//! files, no subdirectories), the same scope `fat32` covers for the other
//! `DiskImageType`.

use std::io::Write as _;
use std::path::Path;

const SECTOR_SIZE: u32 = 2048;
const PVD_LBA: u32 = 16;
const TERMINATOR_LBA: u32 = 17;
const PATH_TABLE_L_LBA: u32 = 18;
const PATH_TABLE_M_LBA: u32 = 19;
const ROOT_DIR_LBA: u32 = 20;

/// A file to place in the image's flat root directory.
pub struct FileEntry<'a> {
    /// The file's name, as it should appear in the guest.
    pub name: &'a str,
    /// The file's content.
    pub data: &'a [u8],
}

/// Writes an ISO9660 image at `path`, at least `min_size` bytes, labeled
/// `volume_label`, containing `files` at the root directory.
pub fn create(
    path: &Path,
    min_size: u64,
    volume_label: &str,
    files: &[FileEntry<'_>],
) -> std::io::Result<()> {
    let names: Vec<Vec<u8>> = files.iter().map(|f| iso_name(f.name)).collect();

    let root_dir_len = directory_size(&names) as u32;
    let root_dir_sectors = sectors_for(u64::from(root_dir_len));

    let mut next_lba = ROOT_DIR_LBA + root_dir_sectors;
    let mut file_locations = Vec::with_capacity(files.len());
    for file in files {
        file_locations.push(next_lba);
        next_lba += sectors_for(file.data.len() as u64).max(1);
    }

    let required_bytes = u64::from(next_lba) * u64::from(SECTOR_SIZE);
    let total_bytes =
        min_size.max(required_bytes).div_ceil(u64::from(SECTOR_SIZE)) * u64::from(SECTOR_SIZE);
    let total_sectors = (total_bytes / u64::from(SECTOR_SIZE)) as u32;

    let mut buf = vec![0u8; total_bytes as usize];

    write_pvd(&mut buf, volume_label, total_sectors, root_dir_len);
    write_terminator(&mut buf);
    write_path_tables(&mut buf, &names);

    let root_dir_bytes = build_root_directory(&names, files, &file_locations, root_dir_len);
    let root_off = (ROOT_DIR_LBA * SECTOR_SIZE) as usize;
    buf[root_off..root_off + root_dir_bytes.len()].copy_from_slice(&root_dir_bytes);

    for (file, &lba) in files.iter().zip(&file_locations) {
        let off = (lba * SECTOR_SIZE) as usize;
        buf[off..off + file.data.len()].copy_from_slice(file.data);
    }

    let mut out = std::fs::File::create(path)?;
    out.write_all(&buf)?;
    out.sync_all()
}

fn sectors_for(byte_len: u64) -> u32 {
    byte_len.div_ceil(u64::from(SECTOR_SIZE)) as u32
}

/// Folds a file name into an ISO9660 identifier: uppercase, `;1` version
/// suffix, disallowed bytes replaced with `_`. No extension handling is
/// needed since every file this crate writes has none.
fn iso_name(name: &str) -> Vec<u8> {
    let mut out: Vec<u8> = name
        .bytes()
        .map(|b| {
            if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' {
                b.to_ascii_uppercase()
            } else {
                b'_'
            }
        })
        .collect();
    out.extend_from_slice(b";1");
    out
}

fn record_len(id_len: usize) -> usize {
    let base = 33 + id_len;
    if base % 2 == 1 { base + 1 } else { base }
}

fn directory_size(names: &[Vec<u8>]) -> usize {
    record_len(1) + record_len(1) + names.iter().map(|n| record_len(n.len())).sum::<usize>()
}

fn push_dir_record(buf: &mut Vec<u8>, id: &[u8], extent_lba: u32, data_len: u32, is_dir: bool) {
    let len = record_len(id.len());
    buf.push(len as u8);
    buf.push(0); // extended attribute record length
    push_both32(buf, extent_lba);
    push_both32(buf, data_len);
    buf.extend_from_slice(&[0u8; 7]); // recording date/time, unset
    buf.push(if is_dir { 0x02 } else { 0x00 });
    buf.push(0); // file unit size
    buf.push(0); // interleave gap size
    push_both16(buf, 1); // volume sequence number
    buf.push(id.len() as u8);
    buf.extend_from_slice(id);
    if (33 + id.len()) % 2 == 1 {
        buf.push(0);
    }
}

fn build_root_directory(
    names: &[Vec<u8>],
    files: &[FileEntry<'_>],
    file_locations: &[u32],
    root_len: u32,
) -> Vec<u8> {
    let mut buf = Vec::new();
    push_dir_record(&mut buf, &[0x00], ROOT_DIR_LBA, root_len, true);
    push_dir_record(&mut buf, &[0x01], ROOT_DIR_LBA, root_len, true);
    for ((name, file), &lba) in names.iter().zip(files).zip(file_locations) {
        push_dir_record(&mut buf, name, lba, file.data.len() as u32, false);
    }
    buf
}

fn write_path_tables(buf: &mut [u8], names: &[Vec<u8>]) {
    // A single-directory volume's path table is just the root entry.
    let write_table = |buf: &mut [u8], lba: u32, big_endian: bool| {
        let off = (lba * SECTOR_SIZE) as usize;
        buf[off] = 1; // directory identifier length
        buf[off + 1] = 0; // extended attribute record length
        if big_endian {
            buf[off + 2..off + 6].copy_from_slice(&ROOT_DIR_LBA.to_be_bytes());
            buf[off + 6..off + 8].copy_from_slice(&1u16.to_be_bytes());
        } else {
            buf[off + 2..off + 6].copy_from_slice(&ROOT_DIR_LBA.to_le_bytes());
            buf[off + 6..off + 8].copy_from_slice(&1u16.to_le_bytes());
        }
        buf[off + 8] = 0; // root directory identifier: single zero byte
    };
    write_table(buf, PATH_TABLE_L_LBA, false);
    write_table(buf, PATH_TABLE_M_LBA, true);
    let _ = names; // only one directory exists, so the names aren't needed yet
}

fn write_terminator(buf: &mut [u8]) {
    let off = (TERMINATOR_LBA * SECTOR_SIZE) as usize;
    buf[off] = 255;
    buf[off + 1..off + 6].copy_from_slice(b"CD001");
    buf[off + 6] = 1;
}

fn write_pvd(buf: &mut [u8], volume_label: &str, total_sectors: u32, root_dir_len: u32) {
    let off = (PVD_LBA * SECTOR_SIZE) as usize;
    let pvd = &mut buf[off..off + SECTOR_SIZE as usize];

    pvd[0] = 1;
    pvd[1..6].copy_from_slice(b"CD001");
    pvd[6] = 1;

    pad_ascii(&mut pvd[8..40], "");
    pad_ascii(&mut pvd[40..72], volume_label);

    write_both32(pvd, 80, total_sectors);
    write_both16(pvd, 120, 1); // volume set size
    write_both16(pvd, 124, 1); // volume sequence number
    write_both16(pvd, 128, SECTOR_SIZE as u16);

    let path_table_size = 10u32; // one root entry: 9 bytes rounded to even
    write_both32(pvd, 132, path_table_size);
    pvd[140..144].copy_from_slice(&PATH_TABLE_L_LBA.to_le_bytes());
    pvd[148..152].copy_from_slice(&PATH_TABLE_M_LBA.to_be_bytes());

    let mut root_record = Vec::new();
    push_dir_record(&mut root_record, &[0x00], ROOT_DIR_LBA, root_dir_len, true);
    pvd[156..156 + root_record.len()].copy_from_slice(&root_record);

    pad_ascii(&mut pvd[190..318], "");
    pad_ascii(&mut pvd[318..446], "");
    pad_ascii(&mut pvd[446..574], "");
    pad_ascii(&mut pvd[574..702], "");

    pvd[882] = 1; // file structure version
}

fn pad_ascii(dst: &mut [u8], s: &str) {
    dst.fill(b' ');
    let bytes = s.as_bytes();
    let n = bytes.len().min(dst.len());
    dst[..n].copy_from_slice(&bytes[..n]);
}

fn push_both16(buf: &mut Vec<u8>, val: u16) {
    buf.extend_from_slice(&val.to_le_bytes());
    buf.extend_from_slice(&val.to_be_bytes());
}

fn push_both32(buf: &mut Vec<u8>, val: u32) {
    buf.extend_from_slice(&val.to_le_bytes());
    buf.extend_from_slice(&val.to_be_bytes());
}

fn write_both16(buf: &mut [u8], offset: usize, val: u16) {
    buf[offset..offset + 2].copy_from_slice(&val.to_le_bytes());
    buf[offset + 4..offset + 6].copy_from_slice(&val.to_be_bytes());
}

fn write_both32(buf: &mut [u8], offset: usize, val: u32) {
    buf[offset..offset + 4].copy_from_slice(&val.to_le_bytes());
    buf[offset + 8..offset + 12].copy_from_slice(&val.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_a_valid_primary_volume_descriptor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cidata.iso");
        let files = [FileEntry { name: "meta-data", data: b"instance-id: x\n" }];
        create(&path, 1024 * 1024, "cidata", &files).expect("create");

        let data = std::fs::read(&path).expect("read");
        let pvd_off = (PVD_LBA * SECTOR_SIZE) as usize;
        assert_eq!(data[pvd_off], 1);
        assert_eq!(&data[pvd_off + 1..pvd_off + 6], b"CD001");
        assert_eq!(&data[pvd_off + 40..pvd_off + 46], b"CIDATA");
    }

    #[test]
    fn iso_name_uppercases_and_adds_version() {
        assert_eq!(iso_name("meta-data"), b"META-DATA;1");
    }
}
