//! Per-SQ ledger of in-flight commands.
//!
//! Entries are appended in submission order and retired from the front when
//! their completion is reaped, so each entry's DMA and PRP resources stay
//! alive for as long as the hardware may still reference them.
//!
//! Correlation is strictly FIFO: the oldest tracked command of an SQ is
//! assumed to complete first. The protocol allows out-of-order completion,
//! so this is a deliberate simplification the reap path reports (but does
//! not fail) on; the compliance scenarios this driver serves submit and
//! complete in lockstep.

use rnvme_mem::DmaPlatform;

use crate::prp::{self, PrpDescriptor};
use crate::queue::SqMeta;

/// Which command set an opcode belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdSet {
    Admin,
    Nvme,
    Vendor,
}

/// One outstanding command.
#[derive(Debug)]
pub struct CmdTrack {
    /// Driver-assigned id, monotonic per SQ, wrapping at 16 bits.
    pub unique_id: u16,
    /// Queue id a queue-creation/deletion command operates on (0 otherwise).
    pub persist_q_id: u16,
    pub opcode: u8,
    pub cmd_set: CmdSet,
    /// Transfer resources owned by this command. `None` when the descriptor
    /// persists on the created queue instead.
    pub(crate) prps: Option<PrpDescriptor>,
}

/// Release one entry's DMA mapping and PRP pages.
pub(crate) fn retire_entry(dma: &dyn DmaPlatform, entry: CmdTrack) {
    if let Some(prps) = entry.prps {
        prp::release_descriptor(dma, prps);
    }
}

/// Retire every tracked command of an SQ, best-effort: individual free
/// failures are logged inside the release paths and never stop the sweep.
pub(crate) fn retire_all(dma: &dyn DmaPlatform, sq: &mut SqMeta) {
    let drained: Vec<CmdTrack> = sq.private.cmds.drain(..).collect();
    if !drained.is_empty() {
        tracing::debug!(
            sq_id = sq.public.sq_id,
            count = drained.len(),
            "retiring tracked commands"
        );
    }
    for entry in drained {
        retire_entry(dma, entry);
    }
}
