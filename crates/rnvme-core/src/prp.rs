//! PRP descriptor construction and release.
//!
//! A transfer is described to the device with at most two direct pointers;
//! anything longer than two pages gets a chained list of pool-allocated
//! descriptor pages. Each list page carries `PAGE_SIZE/8 - 1` data entries,
//! the last slot being reserved for the device address of the next list
//! page. The pages are device-addressed but owned here, as an ordered
//! sequence the build and free paths walk by index.

use rnvme_mem::{DmaPlatform, PrpPage, SgSegment, PAGE_SIZE, PRP_ENTRY_SIZE};

use crate::dma::{self, ScatterMapping};
use crate::error::{DriverError, Result};

/// Total 8-byte slots in one descriptor-list page.
pub const PRPS_PER_PAGE: usize = PAGE_SIZE / PRP_ENTRY_SIZE;
/// Data entries per list page; the last slot chains to the next page.
pub const LIST_DATA_SLOTS: usize = PRPS_PER_PAGE - 1;

/// One descriptor-list page: its pool address, the data entries written into
/// it, and the chain pointer in the reserved last slot (0 on the final page).
#[derive(Debug)]
pub struct PrpListPage {
    pub addr: u64,
    pub entries: Vec<u64>,
    pub next: u64,
}

/// Which of PRP1/PRP2 hold direct addresses and which point at a list.
#[derive(Debug, Default)]
pub enum PrpEntries {
    /// Nothing built (a descriptor that never reached the builder).
    #[default]
    None,
    /// Transfer fits in the first page.
    Direct1(u64),
    /// Two direct pointers, no list.
    Direct2(u64, u64),
    /// PRP1 points at a list (queue-memory path).
    List1 { pages: Vec<PrpListPage> },
    /// PRP1 direct, PRP2 points at a list.
    List2 { prp1: u64, pages: Vec<PrpListPage> },
}

impl PrpEntries {
    /// Value to place in the command's PRP1 field.
    pub fn prp1(&self) -> u64 {
        match self {
            PrpEntries::None => 0,
            PrpEntries::Direct1(addr) => *addr,
            PrpEntries::Direct2(addr, _) => *addr,
            PrpEntries::List1 { pages } => pages.first().map_or(0, |p| p.addr),
            PrpEntries::List2 { prp1, .. } => *prp1,
        }
    }

    /// Value to place in the command's PRP2 field.
    pub fn prp2(&self) -> u64 {
        match self {
            PrpEntries::Direct2(_, addr) => *addr,
            PrpEntries::List2 { pages, .. } => pages.first().map_or(0, |p| p.addr),
            _ => 0,
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, PrpEntries::List1 { .. } | PrpEntries::List2 { .. })
    }

    /// Number of descriptor-list pages backing this entry set.
    pub fn num_pages(&self) -> usize {
        match self {
            PrpEntries::List1 { pages } | PrpEntries::List2 { pages, .. } => pages.len(),
            _ => 0,
        }
    }
}

/// A built transfer description, owning the scatter mapping it came from and
/// any descriptor-list pages. Released exactly once via
/// [`release_descriptor`]; the consuming signature makes a second release of
/// the same descriptor unrepresentable.
#[derive(Debug, Default)]
pub struct PrpDescriptor {
    pub entries: PrpEntries,
    pub data_len: u32,
    pub(crate) mapping: Option<ScatterMapping>,
}

impl PrpDescriptor {
    pub fn new(entries: PrpEntries, data_len: u32, mapping: ScatterMapping) -> Self {
        PrpDescriptor {
            entries,
            data_len,
            mapping: Some(mapping),
        }
    }

    /// Pages pinned for the underlying mapping, if any.
    pub fn pinned_pages(&self) -> usize {
        self.mapping.as_ref().map_or(0, |m| m.page_count())
    }
}

/// Build the PRP entries for a data transfer.
///
/// The first pointer starts at the mapping's in-page offset; the remainder
/// is either one more direct pointer or a chained list. Zero-length buffers
/// never reach this point (rejected when the mapping is built).
pub fn build_data_prps(dma: &dyn DmaPlatform, mapping: &ScatterMapping) -> Result<PrpEntries> {
    let segs = mapping.segments();
    debug_assert!(!segs.is_empty());

    let first = segs[0];
    let prp1 = first.dma_addr();
    let in_first_page = PAGE_SIZE as u32 - first.offset;
    if mapping.len() <= in_first_page {
        return Ok(PrpEntries::Direct1(prp1));
    }

    let remaining = mapping.len() - in_first_page;
    if remaining <= PAGE_SIZE as u32 {
        return Ok(PrpEntries::Direct2(prp1, segs[1].dma_addr()));
    }

    let pages = build_list(dma, &segs[1..])?;
    Ok(PrpEntries::List2 { prp1, pages })
}

/// Build a PRP1-as-list entry set for queue backing memory.
///
/// Queue memory is consumed whole, so it must start on a page boundary.
pub fn build_queue_prps(dma: &dyn DmaPlatform, mapping: &ScatterMapping) -> Result<PrpEntries> {
    let segs = mapping.segments();
    if segs.is_empty() || segs[0].offset != 0 {
        return Err(DriverError::InvalidArgument(
            "queue memory must start page-aligned",
        ));
    }
    let pages = build_list(dma, segs)?;
    Ok(PrpEntries::List1 { pages })
}

fn build_list(dma: &dyn DmaPlatform, segs: &[SgSegment]) -> Result<Vec<PrpListPage>> {
    let mut pages = Vec::new();
    match fill_list(dma, segs, &mut pages) {
        Ok(()) => Ok(pages),
        Err(err) => {
            // Unwind the pages already taken from the pool before reporting.
            for page in pages {
                let _ = dma.pool_free(PrpPage { addr: page.addr });
            }
            Err(err)
        }
    }
}

fn fill_list(dma: &dyn DmaPlatform, segs: &[SgSegment], pages: &mut Vec<PrpListPage>) -> Result<()> {
    let first = dma.pool_alloc()?;
    pages.push(PrpListPage {
        addr: first.addr,
        entries: Vec::new(),
        next: 0,
    });

    for seg in segs {
        if pages.last().expect("list starts non-empty").entries.len() == LIST_DATA_SLOTS {
            let next = dma.pool_alloc()?;
            let prev = pages.last_mut().expect("list starts non-empty");
            prev.next = next.addr;
            dma.write_u64(
                prev.addr + (LIST_DATA_SLOTS * PRP_ENTRY_SIZE) as u64,
                next.addr,
            )?;
            pages.push(PrpListPage {
                addr: next.addr,
                entries: Vec::new(),
                next: 0,
            });
        }

        let page = pages.last_mut().expect("list starts non-empty");
        let slot = page.entries.len();
        let entry = seg.dma_addr();
        dma.write_u64(page.addr + (slot * PRP_ENTRY_SIZE) as u64, entry)?;
        page.entries.push(entry);
    }
    Ok(())
}

/// Tear down a descriptor: reverse the DMA mapping, then return every
/// descriptor-list page to the pool. A descriptor that never reached the
/// builder (no entries, no mapping) is a no-op.
pub fn release_descriptor(dma: &dyn DmaPlatform, desc: PrpDescriptor) {
    let PrpDescriptor {
        entries, mapping, ..
    } = desc;
    if let Some(mapping) = mapping {
        dma::unmap_user_buffer(dma, mapping);
    }
    free_list_pages(dma, entries);
}

/// Return descriptor-list pages to the pool, in forward order by index.
/// Direct and empty entry sets own no pool pages and are a no-op.
pub fn free_list_pages(dma: &dyn DmaPlatform, entries: PrpEntries) {
    let pages = match entries {
        PrpEntries::List1 { pages } | PrpEntries::List2 { pages, .. } => pages,
        _ => return,
    };
    for (idx, page) in pages.iter().enumerate() {
        debug_assert_eq!(
            page.next,
            pages.get(idx + 1).map_or(0, |p| p.addr),
            "chain slot does not name the following page"
        );
        if let Err(err) = dma.pool_free(PrpPage { addr: page.addr }) {
            tracing::warn!(index = idx, error = %err, "prp list page not returned to pool");
        }
    }
}
