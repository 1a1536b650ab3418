//! ext2 driver (read side)
//!
//! Enough of ext2 to probe a volume, walk directories, read file and
//! symlink contents, and answer stat. Write-side operations return
//! `NotSupported`; the uniform contract treats the driver internals as
//! a collaborator.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::devices::Device;

use super::vfs::Filesystem;
use super::{DirEntry, FsStatus, Stat, TimeSpec};

const SUPERBLOCK_OFFSET: u64 = 1024;
const EXT2_MAGIC: u16 = 0xEF53;
const ROOT_INO: u64 = 2;

const DIRECT_BLOCKS: usize = 12;

/// Cached superblock geometry.
struct Geometry {
    block_size: u64,
    inodes_per_group: u32,
    inode_size: u64,
    /// Block number of the group descriptor table.
    gdt_block: u64,
    total_blocks: u64,
}

/// On-disk inode, the fields this driver consumes.
#[derive(Debug, Clone, Copy, Default)]
struct RawInode {
    mode: u16,
    uid: u16,
    size: u32,
    atime: u32,
    ctime: u32,
    mtime: u32,
    gid: u16,
    links: u16,
    sectors: u32,
    block: [u32; 15],
}

pub struct ExtFilesystem {
    device: Arc<dyn Device>,
    geo: Geometry,
}

/// Probe `device` for an ext2 superblock.
pub fn probe(device: &Arc<dyn Device>) -> Option<Arc<dyn Filesystem>> {
    let mut sb = [0u8; 1024];
    device.read(SUPERBLOCK_OFFSET, &mut sb).ok()?;

    let magic = u16::from_le_bytes([sb[56], sb[57]]);
    if magic != EXT2_MAGIC {
        return None;
    }

    let log_block_size = u32::from_le_bytes([sb[24], sb[25], sb[26], sb[27]]);
    let block_size = 1024u64 << log_block_size;
    let inodes_per_group = u32::from_le_bytes([sb[40], sb[41], sb[42], sb[43]]);
    let total_blocks = u32::from_le_bytes([sb[4], sb[5], sb[6], sb[7]]) as u64;
    let revision = u32::from_le_bytes([sb[76], sb[77], sb[78], sb[79]]);
    let inode_size = if revision >= 1 {
        u16::from_le_bytes([sb[88], sb[89]]) as u64
    } else {
        128
    };
    if inodes_per_group == 0 || inode_size == 0 {
        return None;
    }

    Some(Arc::new(ExtFilesystem {
        device: device.clone(),
        geo: Geometry {
            block_size,
            inodes_per_group,
            inode_size,
            gdt_block: if block_size == 1024 { 2 } else { 1 },
            total_blocks,
        },
    }))
}

impl ExtFilesystem {
    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<(), FsStatus> {
        self.device
            .read(block * self.geo.block_size, buf)
            .map_err(|_| FsStatus::IoFailure)?;
        Ok(())
    }

    fn read_inode(&self, ino: u64) -> Result<RawInode, FsStatus> {
        if ino == 0 {
            return Err(FsStatus::InvalidValue);
        }
        let index = ino - 1;
        let group = index / self.geo.inodes_per_group as u64;
        let within = index % self.geo.inodes_per_group as u64;

        // Group descriptor: 32 bytes each, inode table block at +8
        let gd_offset = self.geo.gdt_block * self.geo.block_size + group * 32;
        let mut gd = [0u8; 32];
        self.device
            .read(gd_offset, &mut gd)
            .map_err(|_| FsStatus::IoFailure)?;
        let inode_table = u32::from_le_bytes([gd[8], gd[9], gd[10], gd[11]]) as u64;

        let offset = inode_table * self.geo.block_size + within * self.geo.inode_size;
        let mut raw = [0u8; 128];
        self.device
            .read(offset, &mut raw)
            .map_err(|_| FsStatus::IoFailure)?;

        let mut inode = RawInode {
            mode: u16::from_le_bytes([raw[0], raw[1]]),
            uid: u16::from_le_bytes([raw[2], raw[3]]),
            size: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            atime: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            ctime: u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]),
            mtime: u32::from_le_bytes([raw[16], raw[17], raw[18], raw[19]]),
            gid: u16::from_le_bytes([raw[24], raw[25]]),
            links: u16::from_le_bytes([raw[26], raw[27]]),
            sectors: u32::from_le_bytes([raw[28], raw[29], raw[30], raw[31]]),
            block: [0; 15],
        };
        for (i, slot) in inode.block.iter_mut().enumerate() {
            let at = 40 + i * 4;
            *slot = u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        }
        Ok(inode)
    }

    /// Data block number for logical block `n` of an inode, following
    /// single and double indirection.
    fn data_block(&self, inode: &RawInode, n: u64) -> Result<u64, FsStatus> {
        let per_block = self.geo.block_size / 4;

        if n < DIRECT_BLOCKS as u64 {
            return Ok(inode.block[n as usize] as u64);
        }
        let n = n - DIRECT_BLOCKS as u64;

        let mut table = vec![0u8; self.geo.block_size as usize];
        if n < per_block {
            self.read_block(inode.block[12] as u64, &mut table)?;
            let at = (n * 4) as usize;
            return Ok(u32::from_le_bytes([
                table[at],
                table[at + 1],
                table[at + 2],
                table[at + 3],
            ]) as u64);
        }
        let n = n - per_block;

        if n < per_block * per_block {
            self.read_block(inode.block[13] as u64, &mut table)?;
            let outer = ((n / per_block) * 4) as usize;
            let indirect = u32::from_le_bytes([
                table[outer],
                table[outer + 1],
                table[outer + 2],
                table[outer + 3],
            ]) as u64;
            self.read_block(indirect, &mut table)?;
            let inner = ((n % per_block) * 4) as usize;
            return Ok(u32::from_le_bytes([
                table[inner],
                table[inner + 1],
                table[inner + 2],
                table[inner + 3],
            ]) as u64);
        }

        Err(FsStatus::InvalidValue)
    }

    fn read_data(&self, inode: &RawInode, offset: u64, buf: &mut [u8]) -> Result<usize, FsStatus> {
        let size = inode.size as u64;
        if offset >= size {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(size - offset) as usize;

        let mut block_buf = vec![0u8; self.geo.block_size as usize];
        let mut done = 0usize;
        while done < want {
            let pos = offset + done as u64;
            let logical = pos / self.geo.block_size;
            let within = (pos % self.geo.block_size) as usize;
            let chunk = (self.geo.block_size as usize - within).min(want - done);

            let block = self.data_block(inode, logical)?;
            if block == 0 {
                // Sparse hole
                buf[done..done + chunk].fill(0);
            } else {
                self.read_block(block, &mut block_buf)?;
                buf[done..done + chunk].copy_from_slice(&block_buf[within..within + chunk]);
            }
            done += chunk;
        }
        Ok(done)
    }

    /// Scan directory `inode` for `name`; returns the child inode.
    fn lookup_in_dir(&self, inode: &RawInode, name: &str) -> Result<u64, FsStatus> {
        let mut data = vec![0u8; inode.size as usize];
        self.read_data(inode, 0, &mut data)?;

        let mut at = 0usize;
        while at + 8 <= data.len() {
            let ino = u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
            let rec_len =
                u16::from_le_bytes([data[at + 4], data[at + 5]]) as usize;
            let name_len = data[at + 6] as usize;
            if rec_len < 8 || at + rec_len > data.len() {
                break;
            }
            if ino != 0
                && name_len > 0
                && at + 8 + name_len <= data.len()
                && &data[at + 8..at + 8 + name_len] == name.as_bytes()
            {
                return Ok(ino as u64);
            }
            at += rec_len;
        }
        Err(FsStatus::InvalidValue)
    }

    fn walk(&self, path: &str) -> Result<u64, FsStatus> {
        let mut ino = ROOT_INO;
        for component in super::path::components(path) {
            let inode = self.read_inode(ino)?;
            if inode.mode & 0xF000 != 0x4000 {
                return Err(FsStatus::InvalidValue);
            }
            ino = self.lookup_in_dir(&inode, component)?;
        }
        Ok(ino)
    }
}

/// Map an ext2 on-disk file type byte to a dirent type.
fn dirent_type(ft: u8) -> u8 {
    match ft {
        2 => super::DT_DIR,
        7 => super::DT_LNK,
        3 => super::DT_CHR,
        4 => super::DT_BLK,
        _ => super::DT_REG,
    }
}

impl Filesystem for ExtFilesystem {
    fn open(&self, path: &str) -> Result<u64, FsStatus> {
        self.walk(path)
    }

    fn read(&self, ino: u64, offset: u64, buf: &mut [u8]) -> Result<usize, FsStatus> {
        let inode = self.read_inode(ino)?;
        self.read_data(&inode, offset, buf)
    }

    fn write(&self, _ino: u64, _offset: u64, _data: &[u8]) -> Result<usize, FsStatus> {
        Err(FsStatus::RoFailure)
    }

    fn stat(&self, ino: u64) -> Result<Stat, FsStatus> {
        let inode = self.read_inode(ino)?;
        Ok(Stat {
            device: 0,
            inode: ino,
            mode: inode.mode as u32,
            link_count: inode.links as u32,
            uid: inode.uid as u32,
            gid: inode.gid as u32,
            rdevice: 0,
            byte_size: inode.size as u64,
            access_time: TimeSpec {
                seconds: inode.atime as u64,
                nanoseconds: 0,
            },
            modify_time: TimeSpec {
                seconds: inode.mtime as u64,
                nanoseconds: 0,
            },
            change_time: TimeSpec {
                seconds: inode.ctime as u64,
                nanoseconds: 0,
            },
            block_size: self.geo.block_size,
            block_count: inode.sectors as u64,
        })
    }

    fn read_entries(&self, ino: u64, offset: u64, entries: &mut Vec<DirEntry>) -> FsStatus {
        let Ok(inode) = self.read_inode(ino) else {
            return FsStatus::InvalidValue;
        };
        if inode.mode & 0xF000 != 0x4000 {
            return FsStatus::InvalidValue;
        }
        let mut data = vec![0u8; inode.size as usize];
        if self.read_data(&inode, 0, &mut data).is_err() {
            return FsStatus::IoFailure;
        }

        let mut at = 0usize;
        let mut index = 0u64;
        while at + 8 <= data.len() {
            let child = u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
            let rec_len = u16::from_le_bytes([data[at + 4], data[at + 5]]) as usize;
            let name_len = data[at + 6] as usize;
            let ftype = data[at + 7];
            if rec_len < 8 || at + rec_len > data.len() {
                break;
            }
            if child != 0 && name_len > 0 && at + 8 + name_len <= data.len() {
                if index >= offset {
                    if let Ok(name) = core::str::from_utf8(&data[at + 8..at + 8 + name_len]) {
                        entries.push(DirEntry::new(
                            child as u64,
                            index + 1,
                            dirent_type(ftype),
                            name,
                        ));
                    }
                }
                index += 1;
            }
            at += rec_len;
        }
        FsStatus::Success
    }

    fn read_symbolic_link(&self, ino: u64, target: &mut String) -> FsStatus {
        let Ok(inode) = self.read_inode(ino) else {
            return FsStatus::InvalidValue;
        };
        if inode.mode & 0xF000 != 0xA000 {
            return FsStatus::InvalidValue;
        }

        let len = (inode.size as usize).min(super::path::PATH_MAX);
        if inode.sectors == 0 {
            // Fast symlink: the target lives in the block array
            let mut raw = [0u8; 60];
            for (i, b) in inode.block.iter().enumerate() {
                raw[i * 4..i * 4 + 4].copy_from_slice(&b.to_le_bytes());
            }
            if let Ok(s) = core::str::from_utf8(&raw[..len.min(60)]) {
                target.push_str(s);
                return FsStatus::Success;
            }
            return FsStatus::IoFailure;
        }

        let mut data = vec![0u8; len];
        if self.read_data(&inode, 0, &mut data).is_err() {
            return FsStatus::IoFailure;
        }
        match core::str::from_utf8(&data) {
            Ok(s) => {
                target.push_str(s);
                FsStatus::Success
            }
            Err(_) => FsStatus::IoFailure,
        }
    }

    fn synchronize(&self) -> FsStatus {
        // Nothing dirty on a read-only driver
        FsStatus::Success
    }

    fn synchronize_inode(&self, _ino: u64) -> FsStatus {
        FsStatus::Success
    }

    fn io_control(&self, _ino: u64, request: u64, _argument: u64) -> Result<u64, FsStatus> {
        match request {
            // Block-size query, mirroring the device layer
            0x4004_1201 => Ok(self.geo.block_size),
            0x4004_1202 => Ok(self.geo.total_blocks),
            _ => Err(FsStatus::NotSupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KResult;

    /// An in-memory volume image.
    struct MemDevice(Vec<u8>);

    impl Device for MemDevice {
        fn read(&self, offset: u64, buf: &mut [u8]) -> KResult<usize> {
            let start = (offset as usize).min(self.0.len());
            let n = buf.len().min(self.0.len() - start);
            buf[..n].copy_from_slice(&self.0[start..start + n]);
            Ok(n)
        }

        fn block_count(&self) -> u64 {
            (self.0.len() as u64).div_ceil(512)
        }
    }

    fn put16(img: &mut [u8], at: usize, v: u16) {
        img[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn put32(img: &mut [u8], at: usize, v: u32) {
        img[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// A 64 KiB rev-0 volume: root directory holding `hello.txt`
    /// ("hello") and a symlink `greeting` pointing at it.
    fn tiny_volume() -> Arc<dyn Device> {
        let mut img = alloc::vec![0u8; 64 * 1024];

        // Superblock at 1024: 64 blocks of 1024 bytes, one group
        put32(&mut img, 1024 + 4, 64); // blocks
        put32(&mut img, 1024 + 24, 0); // log block size
        put32(&mut img, 1024 + 40, 32); // inodes per group
        put16(&mut img, 1024 + 56, EXT2_MAGIC);
        put32(&mut img, 1024 + 76, 0); // revision 0: 128-byte inodes

        // Group descriptor at block 2: inode table at block 5
        put32(&mut img, 2048 + 8, 5);

        let inode = |ino: usize| 5 * 1024 + (ino - 1) * 128;

        // Root directory (ino 2): one data block at 6
        let root = inode(2);
        put16(&mut img, root, 0o40755);
        put32(&mut img, root + 4, 1024);
        put16(&mut img, root + 26, 3);
        put32(&mut img, root + 28, 2);
        put32(&mut img, root + 40, 6);

        // hello.txt (ino 5): data block 7
        let file = inode(5);
        put16(&mut img, file, 0o100644);
        put32(&mut img, file + 4, 5);
        put16(&mut img, file + 26, 1);
        put32(&mut img, file + 28, 2);
        put32(&mut img, file + 40, 7);

        // greeting (ino 6): fast symlink to hello.txt
        let link = inode(6);
        put16(&mut img, link, 0o120777);
        put32(&mut img, link + 4, 9);
        put16(&mut img, link + 26, 1);
        put32(&mut img, link + 28, 0); // no sectors: target inline
        img[link + 40..link + 49].copy_from_slice(b"hello.txt");

        // Root entries: ".", "..", "hello.txt", "greeting"
        let dir = 6 * 1024;
        put32(&mut img, dir, 2);
        put16(&mut img, dir + 4, 12);
        img[dir + 6] = 1;
        img[dir + 7] = 2;
        img[dir + 8] = b'.';

        put32(&mut img, dir + 12, 2);
        put16(&mut img, dir + 16, 12);
        img[dir + 18] = 2;
        img[dir + 19] = 2;
        img[dir + 20..dir + 22].copy_from_slice(b"..");

        put32(&mut img, dir + 24, 5);
        put16(&mut img, dir + 28, 20);
        img[dir + 30] = 9;
        img[dir + 31] = 1;
        img[dir + 32..dir + 41].copy_from_slice(b"hello.txt");

        put32(&mut img, dir + 44, 6);
        put16(&mut img, dir + 48, (1024 - 44) as u16);
        img[dir + 50] = 8;
        img[dir + 51] = 7;
        img[dir + 52..dir + 60].copy_from_slice(b"greeting");

        // File contents
        img[7 * 1024..7 * 1024 + 5].copy_from_slice(b"hello");

        Arc::new(MemDevice(img))
    }

    #[test]
    fn probe_recognizes_the_magic() {
        let dev = tiny_volume();
        assert!(probe(&dev).is_some());

        let blank: Arc<dyn Device> = Arc::new(MemDevice(alloc::vec![0u8; 8192]));
        assert!(probe(&blank).is_none());
    }

    #[test]
    fn open_stat_read_roundtrip() {
        let dev = tiny_volume();
        let fs = probe(&dev).unwrap();

        let ino = fs.open("/hello.txt").unwrap();
        let stat = fs.stat(ino).unwrap();
        assert_eq!(stat.byte_size, 5);

        // stat size equals the bytes read before EOF
        let mut buf = [0u8; 16];
        let n = fs.read(ino, 0, &mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(fs.read(ino, 5, &mut buf).unwrap(), 0);
    }

    #[test]
    fn directory_listing_has_the_entries() {
        let dev = tiny_volume();
        let fs = probe(&dev).unwrap();
        let root = fs.open("/").unwrap();

        let mut entries = Vec::new();
        assert_eq!(fs.read_entries(root, 0, &mut entries), FsStatus::Success);
        let names: Vec<String> = entries
            .iter()
            .map(|e| {
                let len = e.d_name.iter().position(|&b| b == 0).unwrap();
                String::from(core::str::from_utf8(&e.d_name[..len]).unwrap())
            })
            .collect();
        assert!(names.contains(&String::from("hello.txt")));
        assert!(names.contains(&String::from("greeting")));
    }

    #[test]
    fn symlink_resolves_to_its_target() {
        let dev = tiny_volume();
        let fs = probe(&dev).unwrap();
        let ino = fs.open("/greeting").unwrap();

        let mut target = String::new();
        assert_eq!(fs.read_symbolic_link(ino, &mut target), FsStatus::Success);
        assert_eq!(target, "hello.txt");
    }

    #[test]
    fn writes_are_refused_read_only() {
        let dev = tiny_volume();
        let fs = probe(&dev).unwrap();
        let ino = fs.open("/hello.txt").unwrap();
        assert!(matches!(
            fs.write(ino, 0, b"x"),
            Err(FsStatus::RoFailure)
        ));
    }

    #[test]
    fn auto_probe_mounts_the_volume() {
        // Scenario: register the image as a device, mount without a
        // kind, read through the mount table.
        let _ = crate::devices::register(String::from("extdisk"), tiny_volume());
        crate::fs::mount::mount("extdisk", "/mnt", None).unwrap();

        let (_, fs, relative) = crate::fs::mount::resolve("/mnt/hello.txt").unwrap();
        assert_eq!(relative, "/hello.txt");
        let ino = fs.open(&relative).unwrap();
        assert_eq!(fs.stat(ino).unwrap().byte_size, 5);

        crate::fs::mount::unmount("/mnt", false).unwrap();
    }
}
