//! Minimal FAT32 image writer (pure Rust, no external dependencies).
//!
//! Supports exactly what a cloud-init seed volume needs: a flat root
//! directory of a handful of small files. Each file gets a VFAT long-name
//! entry (so names like `network-config` survive) followed by its
//! generated 8.3 short-name alias, the way real FAT32 volumes mix the two.

use std::io::Write as _;
use std::path::Path;

const BYTES_PER_SECTOR: u32 = 512;
const SECTORS_PER_CLUSTER: u32 = 8; // 4 KiB clusters
const RESERVED_SECTORS: u32 = 32;
const NUM_FATS: u32 = 1;
const ROOT_CLUSTER: u32 = 2;
const BYTES_PER_CLUSTER: u32 = BYTES_PER_SECTOR * SECTORS_PER_CLUSTER;
const DIR_ENTRY_SIZE: u32 = 32;
const FAT_ENTRY_SIZE: u32 = 4;

const FAT32_EOC: u32 = 0x0FFF_FFF8;

/// A file to place in the image's flat root directory.
pub struct FileEntry<'a> {
    /// The file's name, as it should appear in the guest (not 8.3-folded).
    pub name: &'a str,
    /// The file's content.
    pub data: &'a [u8],
}

/// Writes a FAT32 image at `path`, at least `min_size` bytes, labeled
/// `volume_label` (folded to 11 characters), containing `files` at the
/// root directory.
pub fn create(
    path: &Path,
    min_size: u64,
    volume_label: &str,
    files: &[FileEntry<'_>],
) -> std::io::Result<()> {
    let file_clusters: Vec<u32> = files
        .iter()
        .map(|f| clusters_for(f.data.len() as u64))
        .collect();
    let data_clusters = 1 + file_clusters.iter().sum::<u32>(); // +1 for the root directory

    let fat_size_sectors =
        ((2 + data_clusters) * FAT_ENTRY_SIZE).div_ceil(BYTES_PER_SECTOR);
    let first_data_sector = RESERVED_SECTORS + NUM_FATS * fat_size_sectors;
    let required_sectors = first_data_sector + data_clusters * SECTORS_PER_CLUSTER;
    let required_bytes = u64::from(required_sectors) * u64::from(BYTES_PER_SECTOR);
    let total_sectors = (min_size.max(required_bytes) / u64::from(BYTES_PER_SECTOR)) as u32;

    let mut buf = vec![0u8; (total_sectors as u64 * u64::from(BYTES_PER_SECTOR)) as usize];

    write_boot_sector(&mut buf, total_sectors, fat_size_sectors, volume_label);
    write_fsinfo(&mut buf);
    // Backup boot sector, per the FAT32 spec, lives at sector 6.
    let (head, tail) = buf.split_at_mut(BYTES_PER_SECTOR as usize * 6);
    tail[..BYTES_PER_SECTOR as usize]
        .copy_from_slice(&head[..BYTES_PER_SECTOR as usize]);

    let fat_offset = (RESERVED_SECTORS * BYTES_PER_SECTOR) as usize;
    write_fat_entry(&mut buf, fat_offset, 0, 0x0FFF_FFF8);
    write_fat_entry(&mut buf, fat_offset, 1, 0x0FFF_FFFF);

    let mut next_free_cluster = ROOT_CLUSTER + 1;
    let root_chain = allocate_chain(&mut buf, fat_offset, ROOT_CLUSTER, 1, &mut next_free_cluster);
    debug_assert_eq!(root_chain, ROOT_CLUSTER);

    let root_dir_offset = cluster_offset(root_chain, first_data_sector);
    let mut dir_cursor = root_dir_offset;
    write_volume_label(&mut buf, &mut dir_cursor, volume_label);

    for (file, &clusters) in files.iter().zip(&file_clusters) {
        let first_cluster = if clusters == 0 {
            0
        } else {
            allocate_chain(&mut buf, fat_offset, 0, clusters, &mut next_free_cluster)
        };
        write_file_entry(&mut buf, &mut dir_cursor, file.name, file.data.len() as u32, first_cluster);
        if first_cluster != 0 {
            let mut offset = cluster_offset(first_cluster, first_data_sector);
            let mut remaining = file.data;
            let mut cluster = first_cluster;
            loop {
                let take = remaining.len().min(BYTES_PER_CLUSTER as usize);
                buf[offset..offset + take].copy_from_slice(&remaining[..take]);
                remaining = &remaining[take..];
                if remaining.is_empty() {
                    break;
                }
                cluster = next_cluster(&buf, fat_offset, cluster);
                offset = cluster_offset(cluster, first_data_sector);
            }
        }
    }

    let mut out = std::fs::File::create(path)?;
    out.write_all(&buf)?;
    out.sync_all()
}

fn clusters_for(byte_len: u64) -> u32 {
    if byte_len == 0 {
        0
    } else {
        byte_len.div_ceil(u64::from(BYTES_PER_CLUSTER)) as u32
    }
}

fn cluster_offset(cluster: u32, first_data_sector: u32) -> usize {
    let sector = first_data_sector + (cluster - ROOT_CLUSTER) * SECTORS_PER_CLUSTER;
    (sector * BYTES_PER_SECTOR) as usize
}

fn fat_entry_offset(fat_offset: usize, cluster: u32) -> usize {
    fat_offset + (cluster as usize) * FAT_ENTRY_SIZE as usize
}

fn write_fat_entry(buf: &mut [u8], fat_offset: usize, cluster: u32, value: u32) {
    let offset = fat_entry_offset(fat_offset, cluster);
    buf[offset..offset + 4].copy_from_slice(&(value & 0x0FFF_FFFF).to_le_bytes());
}

fn next_cluster(buf: &[u8], fat_offset: usize, cluster: u32) -> u32 {
    let offset = fat_entry_offset(fat_offset, cluster);
    u32::from_le_bytes(buf[offset..offset + 4].try_into().expect("4 bytes")) & 0x0FFF_FFFF
}

/// Allocates a chain of `count` clusters, starting at `start` if non-zero
/// (used for the fixed root-directory cluster) or the next free cluster
/// otherwise, writing FAT links as it goes. Returns the chain's first
/// cluster.
fn allocate_chain(
    buf: &mut [u8],
    fat_offset: usize,
    start: u32,
    count: u32,
    next_free: &mut u32,
) -> u32 {
    let first = if start != 0 {
        start
    } else {
        let c = *next_free;
        *next_free += 1;
        c
    };
    let mut cluster = first;
    for _ in 1..count {
        let next = *next_free;
        *next_free += 1;
        write_fat_entry(buf, fat_offset, cluster, next);
        cluster = next;
    }
    write_fat_entry(buf, fat_offset, cluster, FAT32_EOC);
    first
}

fn write_boot_sector(buf: &mut [u8], total_sectors: u32, fat_size_sectors: u32, volume_label: &str) {
    buf[0] = 0xEB;
    buf[1] = 0x58;
    buf[2] = 0x90;
    buf[3..11].copy_from_slice(b"MIKROLIT");
    le16(buf, 11, BYTES_PER_SECTOR as u16);
    buf[13] = SECTORS_PER_CLUSTER as u8;
    le16(buf, 14, RESERVED_SECTORS as u16);
    buf[16] = NUM_FATS as u8;
    le16(buf, 17, 0); // root_entry_count: 0 for FAT32
    le16(buf, 19, 0); // total_sectors_16: 0, using the 32-bit field
    buf[21] = 0xF8; // media: fixed disk
    le16(buf, 22, 0); // fat_size_16: 0, using fat_size_32
    le16(buf, 24, 63); // sectors_per_track
    le16(buf, 26, 255); // num_heads
    le32(buf, 28, 0); // hidden_sectors
    le32(buf, 32, total_sectors);
    le32(buf, 36, fat_size_sectors);
    le16(buf, 40, 0); // ext_flags: mirrored FATs
    le16(buf, 42, 0); // fs_version
    le32(buf, 44, ROOT_CLUSTER);
    le16(buf, 48, 1); // fs_info sector
    le16(buf, 50, 6); // backup boot sector
    buf[64] = 0x80; // drive_number
    buf[66] = 0x29; // boot_signature
    le32(buf, 67, 0x5A5A_5A5A); // volume_id
    write_padded_ascii(&mut buf[71..82], volume_label, b' ');
    buf[82..90].copy_from_slice(b"FAT32   ");
    le16(buf, 510, 0xAA55);
}

fn write_fsinfo(buf: &mut [u8]) {
    let base = BYTES_PER_SECTOR as usize;
    le32(buf, base, 0x4161_5252);
    le32(buf, base + 484, 0x6141_7272);
    le32(buf, base + 488, 0xFFFF_FFFF); // free_cluster_count: unknown
    le32(buf, base + 492, 0xFFFF_FFFF); // next_free_cluster: unknown
    le16(buf, base + 510, 0xAA55);
}

fn write_volume_label(buf: &mut [u8], cursor: &mut usize, label: &str) {
    let entry = &mut buf[*cursor..*cursor + DIR_ENTRY_SIZE as usize];
    write_padded_ascii(&mut entry[0..11], label, b' ');
    entry[11] = 0x08; // ATTR_VOLUME_ID
    *cursor += DIR_ENTRY_SIZE as usize;
}

fn write_file_entry(buf: &mut [u8], cursor: &mut usize, name: &str, size: u32, first_cluster: u32) {
    let short = short_name(name);
    let checksum = lfn_checksum(&short);

    let lfn_entries = lfn_entries(name, checksum);
    for entry in &lfn_entries {
        buf[*cursor..*cursor + 32].copy_from_slice(entry);
        *cursor += 32;
    }

    let entry = &mut buf[*cursor..*cursor + DIR_ENTRY_SIZE as usize];
    entry[0..11].copy_from_slice(&short);
    entry[11] = 0x20; // ATTR_ARCHIVE
    le16(entry, 20, (first_cluster >> 16) as u16);
    le16(entry, 26, (first_cluster & 0xFFFF) as u16);
    le32(entry, 28, size);
    *cursor += DIR_ENTRY_SIZE as usize;
}

/// Folds an arbitrary file name into an 11-byte 8.3 short name. Assumes
/// every name this crate is asked to write is unique, so a fixed `~1`
/// numeric tail (rather than a collision-avoiding counter) is enough.
fn short_name(name: &str) -> [u8; 11] {
    let (base, ext) = name.rsplit_once('.').map_or((name, ""), |(b, e)| (b, e));
    let base_upper: Vec<u8> = base
        .bytes()
        .filter(|b| b.is_ascii_alphanumeric() || *b == b'-' || *b == b'_')
        .map(|b| b.to_ascii_uppercase())
        .collect();
    let ext_upper: Vec<u8> = ext
        .bytes()
        .filter(|b| b.is_ascii_alphanumeric())
        .map(|b| b.to_ascii_uppercase())
        .take(3)
        .collect();

    let mut out = [b' '; 11];
    let truncated = base_upper.len() > 8 || !ext.is_empty();
    let stem_len = if truncated { 6 } else { base_upper.len().min(8) };
    out[..stem_len].copy_from_slice(&base_upper[..stem_len]);
    if truncated {
        out[stem_len] = b'~';
        out[stem_len + 1] = b'1';
    }
    out[8..8 + ext_upper.len()].copy_from_slice(&ext_upper);
    out
}

fn lfn_checksum(short_name: &[u8; 11]) -> u8 {
    short_name
        .iter()
        .fold(0u8, |sum, &b| sum.rotate_right(1).wrapping_add(b))
}

/// Builds the VFAT long-name entries for `name`, in on-disk order (the
/// entry marked with the 0x40 "last logical entry" bit comes first).
fn lfn_entries(name: &str, checksum: u8) -> Vec<[u8; 32]> {
    let units: Vec<u16> = name.encode_utf16().collect();
    let chunk_count = units.len().div_ceil(13).max(1);

    let mut entries = Vec::with_capacity(chunk_count);
    for chunk_index in 0..chunk_count {
        let mut chars = [0xFFFFu16; 13];
        let start = chunk_index * 13;
        for (i, slot) in chars.iter_mut().enumerate() {
            if let Some(&u) = units.get(start + i) {
                *slot = u;
            } else if start + i == units.len() {
                *slot = 0x0000;
            }
        }

        let mut entry = [0u8; 32];
        let sequence = (chunk_index + 1) as u8;
        entry[0] = if chunk_index == chunk_count - 1 {
            sequence | 0x40
        } else {
            sequence
        };
        for (i, &u) in chars[0..5].iter().enumerate() {
            le16(&mut entry, 1 + i * 2, u);
        }
        entry[11] = 0x0F; // ATTR_LONG_NAME
        entry[13] = checksum;
        for (i, &u) in chars[5..11].iter().enumerate() {
            le16(&mut entry, 14 + i * 2, u);
        }
        for (i, &u) in chars[11..13].iter().enumerate() {
            le16(&mut entry, 28 + i * 2, u);
        }
        entries.push(entry);
    }
    entries.reverse();
    entries
}

fn write_padded_ascii(dst: &mut [u8], s: &str, pad: u8) {
    dst.fill(pad);
    let bytes = s.as_bytes();
    let n = bytes.len().min(dst.len());
    dst[..n].copy_from_slice(&bytes[..n]);
}

fn le16(buf: &mut [u8], offset: usize, val: u16) {
    buf[offset..offset + 2].copy_from_slice(&val.to_le_bytes());
}

fn le32(buf: &mut [u8], offset: usize, val: u32) {
    buf[offset..offset + 4].copy_from_slice(&val.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_a_valid_boot_sector() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cidata.img");
        let files = [FileEntry { name: "meta-data", data: b"instance-id: x\n" }];
        create(&path, 8 * 1024 * 1024, "CIDATA", &files).expect("create");

        let data = std::fs::read(&path).expect("read");
        assert_eq!(u16::from_le_bytes(data[510..512].try_into().unwrap()), 0xAA55);
        assert_eq!(&data[82..90], b"FAT32   ");
        assert!(data.len() as u64 >= 8 * 1024 * 1024);
    }

    #[test]
    fn short_name_folds_long_names() {
        assert_eq!(&short_name("network-config"), b"NETWOR~1   ");
        assert_eq!(&short_name("meta-data"), b"META-D~1   ");
    }

    #[test]
    fn lfn_checksum_matches_known_vector() {
        // "FOO     BAR" -> checksum 39, a commonly cited VFAT test vector.
        let short: [u8; 11] = *b"FOO     BAR";
        assert_eq!(lfn_checksum(&short), 39);
    }
}
