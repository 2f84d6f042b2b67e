//! Per-controller device state and the operation surface the dispatch
//! boundary calls into.
//!
//! One [`Device`] exists per physical controller, bundling its register
//! space, DMA platform handle and the SQ/CQ collections. All mutating ops are
//! serialized by the [`DeviceEntry`] mutex, which the dispatch boundary locks
//! before calling in; the core itself takes `&mut Device` and never locks.

use std::sync::{Arc, Mutex, MutexGuard};

use rnvme_mem::{Direction, DmaPlatform, PAGE_SIZE};
use rnvme_regs::RegisterSpace;
use tracing::{debug, warn};

use crate::ctrl::CtrlState;
use crate::dma;
use crate::error::{DriverError, Result};
use crate::meta::MetaRegistry;
use crate::prp::{self, PrpDescriptor};
use crate::queue::{CqMeta, QueueKind, SqMeta};
use crate::track::{self, CmdSet, CmdTrack};

/// Admin opcode creating an I/O submission queue.
const OPC_ADMIN_CREATE_IO_SQ: u8 = 0x01;
/// Admin opcode creating an I/O completion queue.
const OPC_ADMIN_CREATE_IO_CQ: u8 = 0x05;

/// Parameters for preparing an I/O submission queue.
#[derive(Debug, Clone, Copy)]
pub struct PrepSq {
    pub sq_id: u16,
    pub cq_id: u16,
    pub elements: u16,
    pub contig: bool,
}

/// Parameters for preparing an I/O completion queue.
#[derive(Debug, Clone, Copy)]
pub struct PrepCq {
    pub cq_id: u16,
    pub elements: u16,
    pub contig: bool,
}

/// Parameters for queueing one command for submission.
#[derive(Debug, Clone, Copy)]
pub struct SubmitCmd {
    /// SQ the command is queued on.
    pub q_id: u16,
    pub opcode: u8,
    pub cmd_set: CmdSet,
    pub data_buf_addr: u64,
    pub data_buf_len: u32,
    pub dir: Direction,
    /// For queue-creation commands carrying the memory of a non-contiguous
    /// queue: the id of the queue that memory belongs to. The PRP descriptor
    /// then persists on that queue instead of on the command.
    pub persist_q_id: Option<u16>,
}

/// A contiguous kernel region resolved for a memory-map request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmapRegion {
    pub addr: u64,
    pub len: u32,
}

/// Decoded memory-map target. The raw page-offset encoding keeps the region
/// type in bits 19:18 (0 CQ, 1 SQ, 2 meta) and the id in bits 17:0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmapTarget {
    Cq(u16),
    Sq(u16),
    Meta(u32),
}

impl MmapTarget {
    pub fn decode(pgoff: u64) -> Result<Self> {
        let kind = (pgoff >> 18) & 0x3;
        let id = pgoff & 0x3_ffff;
        match kind {
            0 | 1 => {
                if id > u64::from(u16::MAX) {
                    return Err(DriverError::InvalidArgument("queue id wider than 16 bits"));
                }
                if kind == 0 {
                    Ok(MmapTarget::Cq(id as u16))
                } else {
                    Ok(MmapTarget::Sq(id as u16))
                }
            }
            2 => Ok(MmapTarget::Meta(id as u32)),
            _ => Err(DriverError::InvalidArgument("unknown mmap region type")),
        }
    }

    pub fn encode(self) -> u64 {
        match self {
            MmapTarget::Cq(id) => u64::from(id),
            MmapTarget::Sq(id) => (1 << 18) | u64::from(id),
            MmapTarget::Meta(id) => (2 << 18) | u64::from(id),
        }
    }
}

/// State for one controller.
pub struct Device {
    pub(crate) regs: Arc<dyn RegisterSpace>,
    pub(crate) dma: Arc<dyn DmaPlatform>,
    pub(crate) state: CtrlState,
    pub(crate) open: bool,
    pub(crate) sqs: Vec<SqMeta>,
    pub(crate) cqs: Vec<CqMeta>,
    pub(crate) meta: MetaRegistry,
}

impl Device {
    pub fn new(regs: Arc<dyn RegisterSpace>, dma: Arc<dyn DmaPlatform>) -> Self {
        Device {
            regs,
            dma,
            state: CtrlState::Disabled,
            open: false,
            sqs: Vec::new(),
            cqs: Vec::new(),
            meta: MetaRegistry::default(),
        }
    }

    /// Claim the device for a user session. Only one session at a time.
    pub fn open(&mut self) -> Result<()> {
        if self.open {
            return Err(DriverError::InvalidState("device already open"));
        }
        self.open = true;
        Ok(())
    }

    pub fn release(&mut self) {
        self.open = false;
    }

    pub fn ctrl_state(&self) -> CtrlState {
        self.state
    }

    pub(crate) fn find_sq(&self, sq_id: u16) -> Option<&SqMeta> {
        self.sqs.iter().find(|q| q.public.sq_id == sq_id)
    }

    pub(crate) fn find_sq_mut(&mut self, sq_id: u16) -> Option<&mut SqMeta> {
        self.sqs.iter_mut().find(|q| q.public.sq_id == sq_id)
    }

    pub(crate) fn find_cq(&self, q_id: u16) -> Option<&CqMeta> {
        self.cqs.iter().find(|q| q.public.q_id == q_id)
    }

    pub(crate) fn find_cq_mut(&mut self, q_id: u16) -> Option<&mut CqMeta> {
        self.cqs.iter_mut().find(|q| q.public.q_id == q_id)
    }

    pub(crate) fn take_sq(&mut self, sq_id: u16) -> Option<SqMeta> {
        let idx = self.sqs.iter().position(|q| q.public.sq_id == sq_id)?;
        Some(self.sqs.remove(idx))
    }

    pub(crate) fn take_cq(&mut self, q_id: u16) -> Option<CqMeta> {
        let idx = self.cqs.iter().position(|q| q.public.q_id == q_id)?;
        Some(self.cqs.remove(idx))
    }

    /// Retire the ledger, persistent PRPs and backing memory of one SQ.
    pub(crate) fn teardown_sq(&self, mut sq: SqMeta) {
        track::retire_all(self.dma.as_ref(), &mut sq);
        if let Some(prps) = sq.private.prp_persist.take() {
            prp::release_descriptor(self.dma.as_ref(), prps);
        }
        if let Some(backing) = sq.private.backing.take() {
            if let Err(err) = self.dma.free_coherent(backing) {
                warn!(sq_id = sq.public.sq_id, error = %err, "sq backing memory not freed");
            }
        }
    }

    pub(crate) fn teardown_cq(&self, mut cq: CqMeta) {
        if let Some(prps) = cq.private.prp_persist.take() {
            prp::release_descriptor(self.dma.as_ref(), prps);
        }
        if let Some(backing) = cq.private.backing.take() {
            if let Err(err) = self.dma.free_coherent(backing) {
                warn!(cq_id = cq.public.q_id, error = %err, "cq backing memory not freed");
            }
        }
    }

    /// Remove one I/O queue and release everything it owns. The admin pair
    /// is only removed through the controller state ops.
    pub fn delete_queue(&mut self, q_id: u16, kind: QueueKind) -> Result<()> {
        if q_id == 0 {
            return Err(DriverError::InvalidArgument(
                "admin queues are removed by the controller state ops",
            ));
        }
        match kind {
            QueueKind::Sq => {
                let sq = self.take_sq(q_id).ok_or(DriverError::NotFound {
                    what: kind.as_str(),
                    id: u32::from(q_id),
                })?;
                self.teardown_sq(sq);
            }
            QueueKind::Cq => {
                let cq = self.take_cq(q_id).ok_or(DriverError::NotFound {
                    what: kind.as_str(),
                    id: u32::from(q_id),
                })?;
                self.teardown_cq(cq);
            }
        }
        debug!(q_id, ?kind, "queue deleted");
        Ok(())
    }

    /// Map a command's data buffer, build its PRPs and append it to the
    /// target SQ's ledger. The virtual tail advances; the doorbell is rung
    /// separately.
    pub fn submit_command(&mut self, cmd: SubmitCmd) -> Result<()> {
        let sq_idx = self
            .sqs
            .iter()
            .position(|q| q.public.sq_id == cmd.q_id)
            .ok_or(DriverError::NotFound {
                what: QueueKind::Sq.as_str(),
                id: u32::from(cmd.q_id),
            })?;

        let dma = Arc::clone(&self.dma);
        let mapping = dma::map_user_buffer(dma.as_ref(), cmd.dir, cmd.data_buf_addr, cmd.data_buf_len)?;

        let (tracked_prps, persist_q_id) = match cmd.persist_q_id {
            Some(pq) => {
                let entries = match prp::build_queue_prps(dma.as_ref(), &mapping) {
                    Ok(entries) => entries,
                    Err(err) => {
                        dma::unmap_user_buffer(dma.as_ref(), mapping);
                        return Err(err);
                    }
                };
                let desc = PrpDescriptor::new(entries, cmd.data_buf_len, mapping);
                self.attach_persist(&cmd, pq, desc)?;
                (None, pq)
            }
            None => {
                let entries = match prp::build_data_prps(dma.as_ref(), &mapping) {
                    Ok(entries) => entries,
                    Err(err) => {
                        dma::unmap_user_buffer(dma.as_ref(), mapping);
                        return Err(err);
                    }
                };
                (
                    Some(PrpDescriptor::new(entries, cmd.data_buf_len, mapping)),
                    0,
                )
            }
        };

        let sq = &mut self.sqs[sq_idx];
        let unique_id = sq.private.next_cmd_id;
        sq.private.next_cmd_id = sq.private.next_cmd_id.wrapping_add(1);
        sq.private.cmds.push(CmdTrack {
            unique_id,
            persist_q_id,
            opcode: cmd.opcode,
            cmd_set: cmd.cmd_set,
            prps: tracked_prps,
        });
        sq.public.tail_ptr_virt = (sq.public.tail_ptr_virt + 1) % sq.public.elements;
        debug!(
            sq_id = cmd.q_id,
            opcode = cmd.opcode,
            unique_id,
            tail_virt = sq.public.tail_ptr_virt,
            "command queued"
        );
        Ok(())
    }

    /// Park a queue-creation command's descriptor on the queue it creates.
    fn attach_persist(&mut self, cmd: &SubmitCmd, q_id: u16, desc: PrpDescriptor) -> Result<()> {
        let dma = Arc::clone(&self.dma);
        let reject = |desc: PrpDescriptor, err: DriverError| -> Result<()> {
            prp::release_descriptor(dma.as_ref(), desc);
            Err(err)
        };

        if cmd.cmd_set != CmdSet::Admin {
            return reject(
                desc,
                DriverError::InvalidArgument("persistent prps require an admin queue-creation command"),
            );
        }
        match cmd.opcode {
            OPC_ADMIN_CREATE_IO_SQ => match self.find_sq_mut(q_id) {
                Some(sq) if sq.private.contig => reject(
                    desc,
                    DriverError::InvalidArgument("persistent prps on a contiguous queue"),
                ),
                Some(sq) if sq.private.prp_persist.is_some() => reject(
                    desc,
                    DriverError::InvalidState("queue already carries persistent prps"),
                ),
                Some(sq) => {
                    sq.private.prp_persist = Some(desc);
                    Ok(())
                }
                None => reject(
                    desc,
                    DriverError::NotFound {
                        what: QueueKind::Sq.as_str(),
                        id: u32::from(q_id),
                    },
                ),
            },
            OPC_ADMIN_CREATE_IO_CQ => match self.find_cq_mut(q_id) {
                Some(cq) if cq.private.contig => reject(
                    desc,
                    DriverError::InvalidArgument("persistent prps on a contiguous queue"),
                ),
                Some(cq) if cq.private.prp_persist.is_some() => reject(
                    desc,
                    DriverError::InvalidState("queue already carries persistent prps"),
                ),
                Some(cq) => {
                    cq.private.prp_persist = Some(desc);
                    Ok(())
                }
                None => reject(
                    desc,
                    DriverError::NotFound {
                        what: QueueKind::Cq.as_str(),
                        id: u32::from(q_id),
                    },
                ),
            },
            _ => reject(
                desc,
                DriverError::InvalidArgument("opcode does not create a queue"),
            ),
        }
    }

    /// Write the virtual tail to the SQ's tail doorbell.
    pub fn ring_doorbell(&mut self, sq_id: u16) -> Result<()> {
        let (dbs_offset, tail) = {
            let sq = self.find_sq_mut(sq_id).ok_or(DriverError::NotFound {
                what: QueueKind::Sq.as_str(),
                id: u32::from(sq_id),
            })?;
            sq.public.tail_ptr = sq.public.tail_ptr_virt;
            (sq.private.dbs_offset, sq.public.tail_ptr)
        };
        self.regs.write32(dbs_offset, u32::from(tail));
        debug!(sq_id, tail, "tail doorbell rung");
        Ok(())
    }

    /// Copy the fixed-layout public half of a queue into `out`.
    pub fn get_queue_metrics(&self, q_id: u16, kind: QueueKind, out: &mut [u8]) -> Result<()> {
        match kind {
            QueueKind::Sq => self
                .find_sq(q_id)
                .ok_or(DriverError::NotFound {
                    what: kind.as_str(),
                    id: u32::from(q_id),
                })?
                .public
                .write_le(out),
            QueueKind::Cq => self
                .find_cq(q_id)
                .ok_or(DriverError::NotFound {
                    what: kind.as_str(),
                    id: u32::from(q_id),
                })?
                .public
                .write_le(out),
        }
    }

    /// Resolve a memory-map request to the target's contiguous kernel region.
    pub fn mmap_region(&self, pgoff: u64, len: u32) -> Result<MmapRegion> {
        let region = match MmapTarget::decode(pgoff)? {
            MmapTarget::Sq(id) => {
                let sq = self.find_sq(id).ok_or(DriverError::NotFound {
                    what: QueueKind::Sq.as_str(),
                    id: u32::from(id),
                })?;
                if !sq.private.contig {
                    return Err(DriverError::Unsupported("mmap of a non-contiguous sq"));
                }
                sq.private
                    .backing
                    .ok_or(DriverError::InvalidState("queue has no backing memory"))?
            }
            MmapTarget::Cq(id) => {
                let cq = self.find_cq(id).ok_or(DriverError::NotFound {
                    what: QueueKind::Cq.as_str(),
                    id: u32::from(id),
                })?;
                if !cq.private.contig {
                    return Err(DriverError::Unsupported("mmap of a non-contiguous cq"));
                }
                cq.private
                    .backing
                    .ok_or(DriverError::InvalidState("queue has no backing memory"))?
            }
            MmapTarget::Meta(id) => self.meta.find(id).ok_or(DriverError::NotFound {
                what: "meta buffer",
                id,
            })?,
        };

        // A request may round up to the region's page span, nothing beyond.
        let span_pages = region.len as usize / PAGE_SIZE + 1;
        if span_pages * PAGE_SIZE < len as usize {
            return Err(DriverError::InvalidArgument(
                "mmap request exceeds the region's page span",
            ));
        }
        Ok(MmapRegion {
            addr: region.addr,
            len: region.len,
        })
    }
}

/// One registered controller, its state behind the per-device lock.
pub struct DeviceEntry {
    inner: Mutex<Device>,
}

impl DeviceEntry {
    pub fn new(device: Device) -> Self {
        DeviceEntry {
            inner: Mutex::new(device),
        }
    }

    /// Serialize access for one request. Held across the whole core call.
    pub fn lock(&self) -> MutexGuard<'_, Device> {
        self.inner.lock().expect("device lock poisoned")
    }
}

/// All controllers the driver is bound to.
#[derive(Default)]
pub struct DeviceRegistry {
    entries: Vec<Arc<DeviceEntry>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry::default()
    }

    pub fn add(&mut self, device: Device) -> usize {
        self.entries.push(Arc::new(DeviceEntry::new(device)));
        self.entries.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<Arc<DeviceEntry>> {
        self.entries.get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
