//! QNX filesystem driver
//!
//! Probe-only: the volume is recognized by its superblock signature so
//! it can occupy a mount row, but every operation answers
//! `NotSupported` until the read side is brought over.

use alloc::sync::Arc;

use crate::devices::Device;

use super::vfs::Filesystem;

/// "QNX4FS" signature at the start of the root-block label.
const SIGNATURE: &[u8; 6] = b"QNX4FS";
const SIGNATURE_OFFSET: u64 = 512 * 1 + 4;

pub struct QnxFilesystem;

/// Probe `device` for a QNX volume signature.
pub fn probe(device: &Arc<dyn Device>) -> Option<Arc<dyn Filesystem>> {
    let mut label = [0u8; 6];
    device.read(SIGNATURE_OFFSET, &mut label).ok()?;
    if &label != SIGNATURE {
        return None;
    }
    Some(Arc::new(QnxFilesystem))
}

impl Filesystem for QnxFilesystem {}
