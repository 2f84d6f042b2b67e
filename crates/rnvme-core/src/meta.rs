//! Meta-data buffer registry.
//!
//! The harness allocates fixed-size meta buffers by id and maps them into
//! its address space through the mmap op's type-2 encoding. The buffer size
//! is set once per device before any allocation.

use rnvme_mem::DmaRegion;
use tracing::warn;

use crate::device::Device;
use crate::error::{DriverError, Result};

/// Largest meta buffer size the harness may configure (16 KiB).
pub const MAX_META_BUF_SIZE: u32 = 0x4000;
/// Meta ids must fit the 18-bit id field of the mmap encoding.
const META_ID_LIMIT: u32 = 1 << 18;

#[derive(Debug)]
pub(crate) struct MetaBuf {
    id: u32,
    region: DmaRegion,
}

#[derive(Debug, Default)]
pub(crate) struct MetaRegistry {
    buf_size: Option<u32>,
    bufs: Vec<MetaBuf>,
}

impl MetaRegistry {
    pub(crate) fn find(&self, id: u32) -> Option<DmaRegion> {
        self.bufs.iter().find(|b| b.id == id).map(|b| b.region)
    }
}

impl Device {
    /// Fix the per-buffer size for this device's meta allocations.
    pub fn meta_pool_create(&mut self, buf_size: u32) -> Result<()> {
        if buf_size == 0 || buf_size > MAX_META_BUF_SIZE {
            return Err(DriverError::InvalidArgument("meta buffer size out of range"));
        }
        if self.meta.buf_size.is_some() {
            return Err(DriverError::InvalidState("meta pool already created"));
        }
        self.meta.buf_size = Some(buf_size);
        Ok(())
    }

    /// Allocate one meta buffer under the caller-chosen id.
    pub fn meta_alloc(&mut self, id: u32) -> Result<()> {
        let size = self
            .meta
            .buf_size
            .ok_or(DriverError::InvalidState("meta pool not created"))?;
        if id >= META_ID_LIMIT {
            return Err(DriverError::InvalidArgument("meta id wider than 18 bits"));
        }
        if self.meta.find(id).is_some() {
            return Err(DriverError::Duplicate(id));
        }
        let region = self.dma.alloc_coherent(size)?;
        self.meta.bufs.push(MetaBuf { id, region });
        Ok(())
    }

    pub fn meta_delete(&mut self, id: u32) -> Result<()> {
        let idx = self
            .meta
            .bufs
            .iter()
            .position(|b| b.id == id)
            .ok_or(DriverError::NotFound {
                what: "meta buffer",
                id,
            })?;
        let buf = self.meta.bufs.remove(idx);
        self.dma.free_coherent(buf.region)?;
        Ok(())
    }

    /// Release every meta buffer, best-effort.
    pub(crate) fn meta_teardown(&mut self) {
        for buf in std::mem::take(&mut self.meta.bufs) {
            if let Err(err) = self.dma.free_coherent(buf.region) {
                warn!(id = buf.id, error = %err, "meta buffer not freed");
            }
        }
        self.meta.buf_size = None;
    }
}
