//! DMA mapping of user data buffers.
//!
//! `map_user_buffer` pins the pages backing a user buffer and describes them
//! as a scatter list the PRP builder can walk. The returned
//! [`ScatterMapping`] owns the pinned pages and the platform mapping; it is
//! torn down exactly once by passing it *by value* to `unmap_user_buffer`,
//! so a second teardown of the same mapping is unrepresentable.

use rnvme_mem::{Direction, DmaPlatform, PinnedPage, SgSegment, PAGE_SIZE};

use crate::error::{DriverError, Result};

/// An ordered run of (physical page, offset, length) segments covering a
/// pinned user buffer, plus the transfer direction.
#[derive(Debug)]
pub struct ScatterMapping {
    pub(crate) segments: Vec<SgSegment>,
    pub(crate) dir: Direction,
    pub(crate) pinned: Vec<PinnedPage>,
    pub(crate) user_addr: u64,
    pub(crate) len: u32,
}

impl ScatterMapping {
    pub fn segments(&self) -> &[SgSegment] {
        &self.segments
    }

    pub fn direction(&self) -> Direction {
        self.dir
    }

    /// Number of user pages pinned for this mapping.
    pub fn page_count(&self) -> usize {
        self.pinned.len()
    }

    pub fn user_addr(&self) -> u64 {
        self.user_addr
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Pin and DMA-map `len` bytes of user memory at `user_addr`.
///
/// The address must be non-null and 4-byte aligned and the length nonzero.
/// Every failure path releases whatever was pinned before returning.
pub fn map_user_buffer(
    dma: &dyn DmaPlatform,
    dir: Direction,
    user_addr: u64,
    len: u32,
) -> Result<ScatterMapping> {
    if user_addr == 0 {
        return Err(DriverError::InvalidArgument("null data buffer"));
    }
    if user_addr & 0x3 != 0 {
        return Err(DriverError::InvalidArgument("data buffer not dword aligned"));
    }
    if len == 0 {
        return Err(DriverError::InvalidArgument("zero-length data buffer"));
    }

    let offset = (user_addr % PAGE_SIZE as u64) as u32;
    let count = (offset as usize + len as usize).div_ceil(PAGE_SIZE) as u32;

    let pinned = dma
        .pin_user_pages(user_addr, count)
        .map_err(|_| DriverError::IoFault("user pages not pinnable"))?;
    if (pinned.len() as u32) < count {
        tracing::debug!(pinned = pinned.len(), requested = count, "partial page pin");
        release_pages(dma, pinned);
        return Err(DriverError::IoFault("partial user page pin"));
    }

    // First segment starts at the in-page offset, the last one is truncated
    // to the real end of the buffer.
    let mut segments = Vec::with_capacity(pinned.len());
    let mut remaining = len;
    let mut seg_offset = offset;
    for page in &pinned {
        let seg_len = remaining.min(PAGE_SIZE as u32 - seg_offset);
        segments.push(SgSegment {
            page: page.addr,
            offset: seg_offset,
            len: seg_len,
        });
        remaining -= seg_len;
        seg_offset = 0;
    }
    debug_assert_eq!(remaining, 0);

    if let Err(err) = dma.map_sg(&segments, dir) {
        release_pages(dma, pinned);
        return Err(err.into());
    }

    Ok(ScatterMapping {
        segments,
        dir,
        pinned,
        user_addr,
        len,
    })
}

/// Reverse the DMA map and release every pinned page.
///
/// A mapping with no segments (never fully built) is a no-op.
pub fn unmap_user_buffer(dma: &dyn DmaPlatform, mapping: ScatterMapping) {
    if mapping.segments.is_empty() {
        return;
    }
    dma.unmap_sg(&mapping.segments, mapping.dir);
    release_pages(dma, mapping.pinned);
}

fn release_pages(dma: &dyn DmaPlatform, pages: Vec<PinnedPage>) {
    for page in pages {
        dma.release_user_page(page);
    }
}
