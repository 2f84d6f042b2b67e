//! DMA platform boundary for the rnvme driver core.
//!
//! The engine in `rnvme-core` never touches raw memory: every device-visible
//! byte goes through [`DmaPlatform`], which bundles the services the original
//! kernel driver obtained from the DMA API — coherent allocations for queue
//! backing memory, a pool of page-sized PRP-list allocations, user-page
//! pinning, scatter-list map/unmap, and physical-address reads/writes with
//! little-endian helpers.
//!
//! [`SimPlatform`] is the in-memory reference implementation used by the
//! test-suite: a flat physical address space with a bump allocator,
//! alloc/free/pin/map accounting, and failure injection for the unwind paths.

use std::collections::BTreeSet;
use std::sync::Mutex;

use thiserror::Error;

/// Device memory page size. The controller is programmed with CC.MPS = 0
/// (4 KiB) and every piece of boundary arithmetic in the driver assumes it.
pub const PAGE_SIZE: usize = 4096;

/// Size of one PRP entry in a descriptor-list page.
pub const PRP_ENTRY_SIZE: usize = 8;

/// Errors surfaced by a [`DmaPlatform`] implementation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemError {
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),

    #[error("physical access out of bounds: addr={addr:#x} len={len}")]
    OutOfBounds { addr: u64, len: usize },

    #[error("no pinnable user range at {0:#x}")]
    BadUserRange(u64),

    #[error("scatter-list DMA map failed")]
    MapFailed,

    #[error("free of address {0:#x} which is not an outstanding allocation")]
    BadFree(u64),
}

/// Direction of a DMA transfer, from the host's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToDevice,
    FromDevice,
}

/// One pinned user page (device-physical page base address).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinnedPage {
    pub addr: u64,
}

/// One scatter-list segment: a physical page plus the in-page window the
/// transfer actually uses. Only the first segment may carry an offset and
/// only the last may be short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgSegment {
    pub page: u64,
    pub offset: u32,
    pub len: u32,
}

impl SgSegment {
    /// Bus address the device should DMA to/from for this segment.
    pub fn dma_addr(&self) -> u64 {
        self.page + u64::from(self.offset)
    }
}

/// A coherent DMA allocation: device address plus byte length. The host and
/// device addresses are fixed at allocation time; the region is released
/// exactly once through [`DmaPlatform::free_coherent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaRegion {
    pub addr: u64,
    pub len: u32,
}

/// One page-sized allocation from the PRP-list pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrpPage {
    pub addr: u64,
}

/// Platform services for device-visible memory.
///
/// Mirrors what the kernel DMA API hands a driver, reduced to what this
/// driver actually uses. Implementations are shared between the driver and
/// the harness that plays the device role, so methods take `&self` and
/// serialize internally.
pub trait DmaPlatform: Send + Sync {
    fn read_physical(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemError>;
    fn write_physical(&self, addr: u64, buf: &[u8]) -> Result<(), MemError>;

    fn read_u64(&self, addr: u64) -> Result<u64, MemError> {
        let mut buf = [0u8; 8];
        self.read_physical(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u64(&self, addr: u64, value: u64) -> Result<(), MemError> {
        self.write_physical(addr, &value.to_le_bytes())
    }

    /// Allocate zeroed coherent memory for queue backing or meta buffers.
    fn alloc_coherent(&self, len: u32) -> Result<DmaRegion, MemError>;
    fn free_coherent(&self, region: DmaRegion) -> Result<(), MemError>;

    /// Allocate one page from the PRP-list pool.
    fn pool_alloc(&self) -> Result<PrpPage, MemError>;
    fn pool_free(&self, page: PrpPage) -> Result<(), MemError>;

    /// Pin up to `count` user pages starting at the page containing `addr`.
    /// A short return (fewer pages than requested) is a partial pin; the
    /// caller owns the returned pages either way.
    fn pin_user_pages(&self, addr: u64, count: u32) -> Result<Vec<PinnedPage>, MemError>;
    fn release_user_page(&self, page: PinnedPage);

    fn map_sg(&self, segments: &[SgSegment], dir: Direction) -> Result<(), MemError>;
    fn unmap_sg(&self, segments: &[SgSegment], dir: Direction);
}

#[derive(Default)]
struct SimCounters {
    pool_allocs: u64,
    pool_frees: u64,
    coherent_allocs: u64,
    coherent_frees: u64,
    pins: u64,
    releases: u64,
    maps: u64,
    unmaps: u64,
}

struct SimState {
    memory: Vec<u8>,
    next_free: u64,
    pool_outstanding: BTreeSet<u64>,
    coherent_outstanding: BTreeSet<u64>,
    user_ranges: Vec<(u64, u64)>,
    counters: SimCounters,
    pool_allocs_left: Option<u32>,
    pin_limit: Option<u32>,
    fail_map: bool,
}

/// In-memory [`DmaPlatform`] with alloc/free accounting.
///
/// Physical addresses index a flat byte array; "user" buffers are carved out
/// of the same space, so tests can fill a buffer through
/// [`DmaPlatform::write_physical`] before submitting it and the identity
/// pin mapping stays honest. Failure injection covers the three unwind paths
/// the core has to get right: pool exhaustion mid-list, partial page pins,
/// and scatter-map failure.
pub struct SimPlatform {
    state: Mutex<SimState>,
}

impl SimPlatform {
    pub fn new(mem_bytes: usize) -> Self {
        SimPlatform {
            state: Mutex::new(SimState {
                memory: vec![0u8; mem_bytes],
                // Keep address 0 unused so null checks stay meaningful.
                next_free: PAGE_SIZE as u64,
                pool_outstanding: BTreeSet::new(),
                coherent_outstanding: BTreeSet::new(),
                user_ranges: Vec::new(),
                counters: SimCounters::default(),
                pool_allocs_left: None,
                pin_limit: None,
                fail_map: false,
            }),
        }
    }

    /// Carve a simulated user buffer out of the address space and return its
    /// "user" address: `offset` bytes into the first page.
    pub fn install_user_buffer(&self, len: u32, offset: u32) -> u64 {
        assert!((offset as usize) < PAGE_SIZE);
        let mut st = self.state.lock().unwrap();
        let pages = (offset as usize + len as usize).div_ceil(PAGE_SIZE);
        let base = st.bump(pages * PAGE_SIZE);
        let addr = base + u64::from(offset);
        st.user_ranges.push((addr, u64::from(len)));
        addr
    }

    /// Allow only the next `n` pool allocations to succeed.
    pub fn fail_pool_after(&self, n: u32) {
        self.state.lock().unwrap().pool_allocs_left = Some(n);
    }

    /// Pin at most `n` pages per `pin_user_pages` call (partial-pin fault).
    pub fn limit_pin(&self, n: u32) {
        self.state.lock().unwrap().pin_limit = Some(n);
    }

    /// Make the next `map_sg` calls fail.
    pub fn fail_map(&self, fail: bool) {
        self.state.lock().unwrap().fail_map = fail;
    }

    /// Pool pages currently allocated and not yet freed.
    pub fn pool_outstanding(&self) -> usize {
        self.state.lock().unwrap().pool_outstanding.len()
    }

    pub fn pool_allocs(&self) -> u64 {
        self.state.lock().unwrap().counters.pool_allocs
    }

    pub fn pool_frees(&self) -> u64 {
        self.state.lock().unwrap().counters.pool_frees
    }

    /// Coherent regions currently allocated and not yet freed.
    pub fn coherent_outstanding(&self) -> usize {
        self.state.lock().unwrap().coherent_outstanding.len()
    }

    /// Pinned pages minus released pages.
    pub fn pin_balance(&self) -> i64 {
        let st = self.state.lock().unwrap();
        st.counters.pins as i64 - st.counters.releases as i64
    }

    /// Mapped scatter lists minus unmapped ones.
    pub fn map_balance(&self) -> i64 {
        let st = self.state.lock().unwrap();
        st.counters.maps as i64 - st.counters.unmaps as i64
    }
}

impl SimState {
    fn bump(&mut self, len: usize) -> u64 {
        let base = self.next_free;
        let len = len.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        self.next_free += len as u64;
        assert!(
            self.next_free <= self.memory.len() as u64,
            "sim memory exhausted"
        );
        base
    }

    fn check_range(&self, addr: u64, len: usize) -> Result<usize, MemError> {
        let start = addr as usize;
        let end = start
            .checked_add(len)
            .ok_or(MemError::OutOfBounds { addr, len })?;
        if end > self.memory.len() {
            return Err(MemError::OutOfBounds { addr, len });
        }
        Ok(start)
    }
}

impl DmaPlatform for SimPlatform {
    fn read_physical(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemError> {
        let st = self.state.lock().unwrap();
        let start = st.check_range(addr, buf.len())?;
        buf.copy_from_slice(&st.memory[start..start + buf.len()]);
        Ok(())
    }

    fn write_physical(&self, addr: u64, buf: &[u8]) -> Result<(), MemError> {
        let mut st = self.state.lock().unwrap();
        let start = st.check_range(addr, buf.len())?;
        st.memory[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn alloc_coherent(&self, len: u32) -> Result<DmaRegion, MemError> {
        if len == 0 {
            return Err(MemError::OutOfMemory("zero-length coherent allocation"));
        }
        let mut st = self.state.lock().unwrap();
        let addr = st.bump(len as usize);
        st.memory[addr as usize..addr as usize + len as usize].fill(0);
        st.coherent_outstanding.insert(addr);
        st.counters.coherent_allocs += 1;
        Ok(DmaRegion { addr, len })
    }

    fn free_coherent(&self, region: DmaRegion) -> Result<(), MemError> {
        let mut st = self.state.lock().unwrap();
        if !st.coherent_outstanding.remove(&region.addr) {
            return Err(MemError::BadFree(region.addr));
        }
        st.counters.coherent_frees += 1;
        Ok(())
    }

    fn pool_alloc(&self) -> Result<PrpPage, MemError> {
        let mut st = self.state.lock().unwrap();
        if let Some(left) = st.pool_allocs_left.as_mut() {
            if *left == 0 {
                return Err(MemError::OutOfMemory("prp page pool exhausted"));
            }
            *left -= 1;
        }
        let addr = st.bump(PAGE_SIZE);
        st.pool_outstanding.insert(addr);
        st.counters.pool_allocs += 1;
        Ok(PrpPage { addr })
    }

    fn pool_free(&self, page: PrpPage) -> Result<(), MemError> {
        let mut st = self.state.lock().unwrap();
        if !st.pool_outstanding.remove(&page.addr) {
            return Err(MemError::BadFree(page.addr));
        }
        st.counters.pool_frees += 1;
        Ok(())
    }

    fn pin_user_pages(&self, addr: u64, count: u32) -> Result<Vec<PinnedPage>, MemError> {
        let mut st = self.state.lock().unwrap();
        let known = st
            .user_ranges
            .iter()
            .any(|(base, len)| addr >= *base && addr < *base + *len);
        if !known {
            return Err(MemError::BadUserRange(addr));
        }

        let granted = match st.pin_limit {
            Some(limit) => count.min(limit),
            None => count,
        };
        let first = addr & !(PAGE_SIZE as u64 - 1);
        let pages: Vec<PinnedPage> = (0..granted)
            .map(|i| PinnedPage {
                addr: first + u64::from(i) * PAGE_SIZE as u64,
            })
            .collect();
        st.counters.pins += pages.len() as u64;
        Ok(pages)
    }

    fn release_user_page(&self, _page: PinnedPage) {
        self.state.lock().unwrap().counters.releases += 1;
    }

    fn map_sg(&self, _segments: &[SgSegment], _dir: Direction) -> Result<(), MemError> {
        let mut st = self.state.lock().unwrap();
        if st.fail_map {
            return Err(MemError::MapFailed);
        }
        st.counters.maps += 1;
        Ok(())
    }

    fn unmap_sg(&self, _segments: &[SgSegment], _dir: Direction) {
        self.state.lock().unwrap().counters.unmaps += 1;
    }
}
