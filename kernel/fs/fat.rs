//! FAT driver (read side)
//!
//! FAT16/FAT32 with 8.3 names: probe the BPB, walk directories, read
//! file contents, stat. Long file names and the write side are not
//! carried; those operations answer `NotSupported`.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::devices::Device;

use super::vfs::Filesystem;
use super::{DirEntry, FsStatus, Stat, IFDIR, IFREG};

/// Synthetic inode for the root directory.
const ROOT_INO: u64 = 1;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Variant {
    Fat16,
    Fat32,
}

struct Geometry {
    variant: Variant,
    bytes_per_sector: u64,
    sectors_per_cluster: u64,
    fat_start: u64,
    /// FAT16: sector of the fixed root directory; FAT32: first root
    /// cluster.
    root_base: u64,
    root_entries: u64,
    data_start: u64,
    total_clusters: u64,
}

pub struct FatFilesystem {
    device: Arc<dyn Device>,
    geo: Geometry,
}

/// Probe `device` for a FAT BPB.
pub fn probe(device: &Arc<dyn Device>) -> Option<Arc<dyn Filesystem>> {
    let mut bpb = [0u8; 512];
    device.read(0, &mut bpb).ok()?;

    if bpb[510] != 0x55 || bpb[511] != 0xAA {
        return None;
    }
    let bytes_per_sector = u16::from_le_bytes([bpb[11], bpb[12]]) as u64;
    let sectors_per_cluster = bpb[13] as u64;
    if !bytes_per_sector.is_power_of_two() || bytes_per_sector < 512 || sectors_per_cluster == 0 {
        return None;
    }

    let reserved = u16::from_le_bytes([bpb[14], bpb[15]]) as u64;
    let fat_count = bpb[16] as u64;
    let root_entries = u16::from_le_bytes([bpb[17], bpb[18]]) as u64;
    let total16 = u16::from_le_bytes([bpb[19], bpb[20]]) as u64;
    let fat_size16 = u16::from_le_bytes([bpb[22], bpb[23]]) as u64;
    let total32 = u32::from_le_bytes([bpb[32], bpb[33], bpb[34], bpb[35]]) as u64;
    let fat_size32 = u32::from_le_bytes([bpb[36], bpb[37], bpb[38], bpb[39]]) as u64;

    if fat_count == 0 {
        return None;
    }

    let fat_size = if fat_size16 != 0 { fat_size16 } else { fat_size32 };
    let total_sectors = if total16 != 0 { total16 } else { total32 };
    if fat_size == 0 || total_sectors == 0 {
        return None;
    }

    let root_dir_sectors = (root_entries * 32).div_ceil(bytes_per_sector);
    let data_start = reserved + fat_count * fat_size + root_dir_sectors;
    let total_clusters = (total_sectors - data_start) / sectors_per_cluster;

    let variant = if total_clusters >= 65525 {
        Variant::Fat32
    } else {
        Variant::Fat16
    };

    let root_base = match variant {
        Variant::Fat16 => reserved + fat_count * fat_size,
        Variant::Fat32 => u32::from_le_bytes([bpb[44], bpb[45], bpb[46], bpb[47]]) as u64,
    };

    Some(Arc::new(FatFilesystem {
        device: device.clone(),
        geo: Geometry {
            variant,
            bytes_per_sector,
            sectors_per_cluster,
            fat_start: reserved,
            root_base,
            root_entries,
            data_start,
            total_clusters,
        },
    }))
}

/// Encode a directory-entry location as an inode number so the stat
/// and read paths can find the entry again: sector * 16 + slot + 2.
fn entry_ino(sector: u64, slot: u64) -> u64 {
    sector * 16 + slot + 2
}

fn ino_entry(ino: u64) -> (u64, u64) {
    let v = ino - 2;
    (v / 16, v % 16)
}

impl FatFilesystem {
    fn cluster_sector(&self, cluster: u64) -> u64 {
        self.geo.data_start + (cluster - 2) * self.geo.sectors_per_cluster
    }

    fn next_cluster(&self, cluster: u64) -> Result<Option<u64>, FsStatus> {
        let (offset, width) = match self.geo.variant {
            Variant::Fat16 => (cluster * 2, 2usize),
            Variant::Fat32 => (cluster * 4, 4usize),
        };
        let mut raw = [0u8; 4];
        self.device
            .read(
                self.geo.fat_start * self.geo.bytes_per_sector + offset,
                &mut raw[..width],
            )
            .map_err(|_| FsStatus::IoFailure)?;
        let value = match self.geo.variant {
            Variant::Fat16 => u16::from_le_bytes([raw[0], raw[1]]) as u64,
            Variant::Fat32 => {
                u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as u64 & 0x0FFF_FFFF
            }
        };
        let end = match self.geo.variant {
            Variant::Fat16 => value >= 0xFFF8,
            Variant::Fat32 => value >= 0x0FFF_FFF8,
        };
        if end || value < 2 || value >= self.geo.total_clusters + 2 {
            Ok(None)
        } else {
            Ok(Some(value))
        }
    }

    /// Read the raw 32-byte directory entry an inode number points at.
    fn raw_entry(&self, ino: u64) -> Result<[u8; 32], FsStatus> {
        let (sector, slot) = ino_entry(ino);
        let mut raw = [0u8; 32];
        self.device
            .read(sector * self.geo.bytes_per_sector + slot * 32, &mut raw)
            .map_err(|_| FsStatus::IoFailure)?;
        if raw[0] == 0x00 || raw[0] == 0xE5 {
            return Err(FsStatus::InvalidValue);
        }
        Ok(raw)
    }

    fn entry_first_cluster(raw: &[u8; 32]) -> u64 {
        let low = u16::from_le_bytes([raw[26], raw[27]]) as u64;
        let high = u16::from_le_bytes([raw[20], raw[21]]) as u64;
        (high << 16) | low
    }

    /// Visit each 32-byte entry of a directory, with its sector/slot.
    fn for_each_entry(
        &self,
        dir_ino: u64,
        mut f: impl FnMut(u64, u64, &[u8; 32]) -> bool,
    ) -> Result<(), FsStatus> {
        let sector_bytes = self.geo.bytes_per_sector as usize;
        let mut sector_buf = vec![0u8; sector_bytes];

        let mut visit_sector =
            |this: &Self, sector: u64, buf: &mut [u8]| -> Result<bool, FsStatus> {
                this.device
                    .read(sector * this.geo.bytes_per_sector, buf)
                    .map_err(|_| FsStatus::IoFailure)?;
                for slot in 0..(buf.len() / 32) as u64 {
                    let at = (slot * 32) as usize;
                    let mut raw = [0u8; 32];
                    raw.copy_from_slice(&buf[at..at + 32]);
                    if raw[0] == 0x00 {
                        return Ok(false); // end of directory
                    }
                    if raw[0] == 0xE5 || raw[11] & 0x08 != 0 {
                        continue; // deleted or volume label / LFN
                    }
                    if !f(sector, slot, &raw) {
                        return Ok(false);
                    }
                }
                Ok(true)
            };

        if dir_ino == ROOT_INO && self.geo.variant == Variant::Fat16 {
            let sectors = (self.geo.root_entries * 32).div_ceil(self.geo.bytes_per_sector);
            for s in 0..sectors {
                if !visit_sector(self, self.geo.root_base + s, &mut sector_buf)? {
                    return Ok(());
                }
            }
            return Ok(());
        }

        let mut cluster = if dir_ino == ROOT_INO {
            self.geo.root_base
        } else {
            let raw = self.raw_entry(dir_ino)?;
            Self::entry_first_cluster(&raw)
        };

        loop {
            let base = self.cluster_sector(cluster);
            for s in 0..self.geo.sectors_per_cluster {
                if !visit_sector(self, base + s, &mut sector_buf)? {
                    return Ok(());
                }
            }
            match self.next_cluster(cluster)? {
                Some(next) => cluster = next,
                None => return Ok(()),
            }
        }
    }

    fn walk(&self, path: &str) -> Result<u64, FsStatus> {
        let mut ino = ROOT_INO;
        for component in super::path::components(path) {
            let wanted = short_name(component).ok_or(FsStatus::InvalidValue)?;
            let mut found = None;
            self.for_each_entry(ino, |sector, slot, raw| {
                if raw[..11] == wanted {
                    found = Some(entry_ino(sector, slot));
                    return false;
                }
                true
            })?;
            ino = found.ok_or(FsStatus::InvalidValue)?;
        }
        Ok(ino)
    }

    fn read_file(&self, ino: u64, offset: u64, buf: &mut [u8]) -> Result<usize, FsStatus> {
        let raw = self.raw_entry(ino)?;
        let size = u32::from_le_bytes([raw[28], raw[29], raw[30], raw[31]]) as u64;
        if offset >= size {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(size - offset) as usize;

        let cluster_bytes = self.geo.bytes_per_sector * self.geo.sectors_per_cluster;
        let mut cluster = Self::entry_first_cluster(&raw);

        // Skip whole clusters before the offset
        let mut skip = offset / cluster_bytes;
        while skip > 0 {
            cluster = self
                .next_cluster(cluster)?
                .ok_or(FsStatus::InvalidValue)?;
            skip -= 1;
        }

        let mut cluster_buf = vec![0u8; cluster_bytes as usize];
        let mut done = 0usize;
        let mut within = (offset % cluster_bytes) as usize;
        loop {
            let base = self.cluster_sector(cluster) * self.geo.bytes_per_sector;
            self.device
                .read(base, &mut cluster_buf)
                .map_err(|_| FsStatus::IoFailure)?;
            let chunk = (cluster_bytes as usize - within).min(want - done);
            buf[done..done + chunk].copy_from_slice(&cluster_buf[within..within + chunk]);
            done += chunk;
            within = 0;
            if done >= want {
                return Ok(done);
            }
            match self.next_cluster(cluster)? {
                Some(next) => cluster = next,
                None => return Ok(done),
            }
        }
    }
}

/// Encode a component as an 8.3 directory-entry name.
fn short_name(component: &str) -> Option<[u8; 11]> {
    let mut out = [b' '; 11];
    let upper = |c: u8| c.to_ascii_uppercase();

    let (stem, ext) = match component.rsplit_once('.') {
        Some((s, e)) if !s.is_empty() => (s, e),
        _ => (component, ""),
    };
    if stem.len() > 8 || ext.len() > 3 || stem.is_empty() {
        return None;
    }
    for (i, &b) in stem.as_bytes().iter().enumerate() {
        out[i] = upper(b);
    }
    for (i, &b) in ext.as_bytes().iter().enumerate() {
        out[8 + i] = upper(b);
    }
    Some(out)
}

/// Render an 8.3 name back into `name.ext` form.
fn display_name(raw: &[u8; 32]) -> String {
    let stem: Vec<u8> = raw[..8]
        .iter()
        .copied()
        .take_while(|&b| b != b' ')
        .collect();
    let ext: Vec<u8> = raw[8..11]
        .iter()
        .copied()
        .take_while(|&b| b != b' ')
        .collect();
    let mut name = String::new();
    for b in stem {
        name.push(b.to_ascii_lowercase() as char);
    }
    if !ext.is_empty() {
        name.push('.');
        for b in ext {
            name.push(b.to_ascii_lowercase() as char);
        }
    }
    name
}

impl Filesystem for FatFilesystem {
    fn open(&self, path: &str) -> Result<u64, FsStatus> {
        self.walk(path)
    }

    fn read(&self, ino: u64, offset: u64, buf: &mut [u8]) -> Result<usize, FsStatus> {
        if ino == ROOT_INO {
            return Err(FsStatus::InvalidValue);
        }
        self.read_file(ino, offset, buf)
    }

    fn write(&self, _ino: u64, _offset: u64, _data: &[u8]) -> Result<usize, FsStatus> {
        Err(FsStatus::RoFailure)
    }

    fn stat(&self, ino: u64) -> Result<Stat, FsStatus> {
        if ino == ROOT_INO {
            return Ok(Stat {
                inode: ino,
                mode: IFDIR | 0o755,
                link_count: 1,
                block_size: self.geo.bytes_per_sector,
                ..Stat::default()
            });
        }
        let raw = self.raw_entry(ino)?;
        let size = u32::from_le_bytes([raw[28], raw[29], raw[30], raw[31]]) as u64;
        let is_dir = raw[11] & 0x10 != 0;
        Ok(Stat {
            inode: ino,
            mode: if is_dir { IFDIR | 0o755 } else { IFREG | 0o644 },
            link_count: 1,
            byte_size: size,
            block_size: self.geo.bytes_per_sector,
            block_count: size.div_ceil(self.geo.bytes_per_sector),
            ..Stat::default()
        })
    }

    fn read_entries(&self, ino: u64, offset: u64, entries: &mut Vec<DirEntry>) -> FsStatus {
        let mut index = 0u64;
        let result = self.for_each_entry(ino, |sector, slot, raw| {
            if index >= offset {
                let kind = if raw[11] & 0x10 != 0 {
                    super::DT_DIR
                } else {
                    super::DT_REG
                };
                entries.push(DirEntry::new(
                    entry_ino(sector, slot),
                    index + 1,
                    kind,
                    &display_name(raw),
                ));
            }
            index += 1;
            true
        });
        match result {
            Ok(()) => FsStatus::Success,
            Err(status) => status,
        }
    }

    fn synchronize(&self) -> FsStatus {
        FsStatus::Success
    }

    fn synchronize_inode(&self, _ino: u64) -> FsStatus {
        FsStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_names_encode() {
        assert_eq!(short_name("hello.txt").unwrap(), *b"HELLO   TXT");
        assert_eq!(short_name("init").unwrap(), *b"INIT       ");
        assert!(short_name("toolongname.txt").is_none());
        assert!(short_name("a.toolong").is_none());
    }

    #[test]
    fn entry_ino_roundtrip() {
        let ino = entry_ino(97, 5);
        assert_eq!(ino_entry(ino), (97, 5));
        assert!(ino > ROOT_INO);
    }
}
