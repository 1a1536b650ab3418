//! Device registry
//!
//! Uniform interface the VFS and descriptor layer drive devices
//! through. Boot "RAM files" register as `ramdev0..N` block devices;
//! the kernel console registers as `console`. `/dev/NAME` opens route
//! here.

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::RwLock;

use crate::error::{Errno, KResult};
use crate::mm::AddressSpace;
use crate::poll::PollStatus;

/// Operations every device implements. Unsupported operations keep
/// their default `NotImplemented` bodies.
pub trait Device: Send + Sync {
    fn read(&self, _offset: u64, _buf: &mut [u8]) -> KResult<usize> {
        Err(Errno::NotImplemented)
    }

    fn write(&self, _offset: u64, _data: &[u8]) -> KResult<usize> {
        Err(Errno::NotImplemented)
    }

    fn ioctl(&self, _request: u64, _argument: u64) -> KResult<u64> {
        Err(Errno::NotImplemented)
    }

    /// Map the device into a user address space (uid-0 callers only;
    /// the syscall layer enforces that).
    fn mmap(&self, _space: &AddressSpace, _virt: u64, _len: u64) -> KResult<()> {
        Err(Errno::NotImplemented)
    }

    fn poll_status(&self) -> PollStatus {
        PollStatus {
            can_read: true,
            can_write: true,
            is_error: false,
            is_broken: false,
        }
    }

    /// Block devices report a nonzero block count.
    fn block_size(&self) -> u64 {
        512
    }

    fn block_count(&self) -> u64 {
        0
    }

    fn is_block(&self) -> bool {
        self.block_count() != 0
    }
}

static REGISTRY: RwLock<Vec<(String, Arc<dyn Device>)>> = RwLock::new(Vec::new());

/// Register a device under `name`. Refuses duplicates.
pub fn register(name: String, device: Arc<dyn Device>) -> KResult<()> {
    let mut reg = REGISTRY.write();
    if reg.iter().any(|(n, _)| *n == name) {
        return Err(Errno::Busy);
    }
    reg.push((name, device));
    Ok(())
}

/// Look a device up by name.
pub fn lookup(name: &str) -> Option<Arc<dyn Device>> {
    REGISTRY
        .read()
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, d)| d.clone())
}

/// Names of all registered devices.
pub fn names() -> Vec<String> {
    REGISTRY.read().iter().map(|(n, _)| n.clone()).collect()
}

// ---------------------------------------------------------------------------
// RAM device
// ---------------------------------------------------------------------------

/// A boot module exposed as a block device.
pub struct RamDevice {
    base_phys: u64,
    len: usize,
}

impl RamDevice {
    /// Wrap the physical extent of a boot module.
    ///
    /// # Safety
    /// The extent must stay reserved for this device's lifetime.
    pub unsafe fn new(base_phys: u64, len: usize) -> Self {
        Self { base_phys, len }
    }

}

impl Device for RamDevice {
    fn read(&self, offset: u64, buf: &mut [u8]) -> KResult<usize> {
        let start = offset.min(self.len as u64) as usize;
        let n = buf.len().min(self.len - start);
        unsafe {
            ::core::ptr::copy_nonoverlapping(
                crate::mm::phys_to_virt(self.base_phys + start as u64),
                buf.as_mut_ptr(),
                n,
            );
        }
        Ok(n)
    }

    fn write(&self, offset: u64, incoming: &[u8]) -> KResult<usize> {
        let start = offset.min(self.len as u64) as usize;
        let n = incoming.len().min(self.len - start);
        unsafe {
            ::core::ptr::copy_nonoverlapping(
                incoming.as_ptr(),
                crate::mm::phys_to_virt(self.base_phys + start as u64),
                n,
            );
        }
        Ok(n)
    }

    fn mmap(&self, space: &AddressSpace, virt: u64, len: u64) -> KResult<()> {
        if len > self.len as u64 {
            return Err(Errno::InvalidValue);
        }
        space.map_range(
            virt,
            self.base_phys,
            len,
            crate::arch::paging::MapPermissions::USER
                | crate::arch::paging::MapPermissions::WRITE,
        )
    }

    fn block_count(&self) -> u64 {
        (self.len as u64).div_ceil(self.block_size())
    }
}

/// Register one boot module as the next `ramdevN`.
pub fn register_ram_device(index: usize, base_phys: u64, len: usize) -> KResult<()> {
    let dev = unsafe { RamDevice::new(base_phys, len) };
    register(format!("ramdev{}", index), Arc::new(dev))
}

// ---------------------------------------------------------------------------
// Console device
// ---------------------------------------------------------------------------

/// The kernel console as a character device.
pub struct ConsoleDevice;

impl Device for ConsoleDevice {
    fn write(&self, _offset: u64, data: &[u8]) -> KResult<usize> {
        for &b in data {
            if b == b'\n' {
                crate::arch::console_put(b'\r');
            }
            crate::arch::console_put(b);
        }
        Ok(data.len())
    }

    fn poll_status(&self) -> PollStatus {
        PollStatus {
            can_read: false,
            can_write: true,
            is_error: false,
            is_broken: false,
        }
    }
}
