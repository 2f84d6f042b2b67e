//! Completion reaping with phase-bit and wrap-around semantics.
//!
//! A completion entry is valid only while its phase bit matches the queue's
//! expected phase; the expectation toggles once per wrap of the head
//! pointer. `reap` consumes valid entries (bounded by the caller's budget
//! and buffer), retires the matching tracked commands and rings the CQ head
//! doorbell; `reap_inquiry` runs the same scan without consuming anything,
//! so a partial reap can resume exactly where it stopped.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::device::Device;
use crate::error::{DriverError, Result};
use crate::queue::QueueKind;
use crate::track;

/// Completion queue entry, 16 bytes on the wire, little-endian dwords:
/// dw0 command-specific, dw1 reserved, dw2 = sq_head | sq_id << 16,
/// dw3 = cmd_id | status << 16. Bit 0 of the status word is the phase bit.
#[derive(Debug, Clone, Copy)]
pub struct CompletionEntry {
    pub cmd_specific: u32,
    pub sq_head: u16,
    pub sq_id: u16,
    pub cmd_id: u16,
    pub status: u16,
}

impl CompletionEntry {
    /// Wire size of the fixed part of an entry.
    pub const WIRE_LEN: usize = 16;

    /// Parse the fixed 16-byte layout from the head of `bytes`.
    pub fn from_le_bytes(bytes: &[u8]) -> Self {
        let dw0 = u32::from_le_bytes(bytes[0..4].try_into().expect("16-byte entry"));
        let dw2 = u32::from_le_bytes(bytes[8..12].try_into().expect("16-byte entry"));
        let dw3 = u32::from_le_bytes(bytes[12..16].try_into().expect("16-byte entry"));
        CompletionEntry {
            cmd_specific: dw0,
            sq_head: (dw2 & 0xffff) as u16,
            sq_id: (dw2 >> 16) as u16,
            cmd_id: (dw3 & 0xffff) as u16,
            status: (dw3 >> 16) as u16,
        }
    }

    pub fn phase(&self) -> u8 {
        (self.status & 0x1) as u8
    }
}

/// Counts returned by a reap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapOutcome {
    /// Entries copied out and consumed.
    pub reaped: u16,
    /// Valid entries still waiting after this call.
    pub remaining: u16,
}

/// Scan geometry snapshotted from a CQ before walking its ring.
struct RingView {
    base: u64,
    elements: u16,
    entry_size: usize,
    head: u16,
    phase: u8,
    dbs_offset: u64,
}

impl Device {
    fn ring_view(&self, cq_id: u16) -> Result<RingView> {
        let cq = self.find_cq(cq_id).ok_or(DriverError::NotFound {
            what: QueueKind::Cq.as_str(),
            id: u32::from(cq_id),
        })?;
        let backing = cq
            .private
            .backing
            .ok_or(DriverError::Unsupported("reap of a non-contiguous cq"))?;
        let entry_size = backing.len as usize / cq.public.elements as usize;
        if entry_size < CompletionEntry::WIRE_LEN {
            return Err(DriverError::InvalidState(
                "completion entries smaller than the fixed layout",
            ));
        }
        Ok(RingView {
            base: backing.addr,
            elements: cq.public.elements,
            entry_size,
            head: cq.public.head_ptr,
            phase: cq.public.pbit_new_entry,
            dbs_offset: cq.private.dbs_offset,
        })
    }

    fn read_entry(&self, view: &RingView, head: u16, buf: &mut [u8]) -> Result<CompletionEntry> {
        let addr = view.base + u64::from(head) * view.entry_size as u64;
        self.dma.read_physical(addr, buf)?;
        Ok(CompletionEntry::from_le_bytes(buf))
    }

    /// Count valid-but-unreaped entries without consuming them.
    pub fn reap_inquiry(&self, cq_id: u16) -> Result<u16> {
        let view = self.ring_view(cq_id)?;
        let mut buf = vec![0u8; view.entry_size];
        let mut head = view.head;
        let mut phase = view.phase;
        let mut waiting = 0u16;

        while waiting < view.elements {
            let entry = self.read_entry(&view, head, &mut buf)?;
            if entry.phase() != phase {
                break;
            }
            waiting += 1;
            head += 1;
            if head == view.elements {
                head = 0;
                phase ^= 1;
            }
        }
        Ok(waiting)
    }

    /// Consume up to `max_entries` valid entries into `out`.
    ///
    /// The stored head pointer and expected phase advance only for entries
    /// actually consumed, so reaping `k` of `n` then reaping again yields
    /// the next `n - k` with no repeats or skips. Every consumed entry
    /// retires the oldest tracked command of the SQ it names (the ledger's
    /// documented FIFO assumption) and refreshes that SQ's head pointer.
    pub fn reap(&mut self, cq_id: u16, max_entries: u16, out: &mut [u8]) -> Result<ReapOutcome> {
        let view = self.ring_view(cq_id)?;
        if out.len() < view.entry_size {
            return Err(DriverError::InvalidArgument(
                "reap buffer smaller than one completion entry",
            ));
        }

        let budget = u16::min(
            max_entries,
            u16::try_from(out.len() / view.entry_size).unwrap_or(u16::MAX),
        );
        let mut buf = vec![0u8; view.entry_size];
        let mut head = view.head;
        let mut phase = view.phase;
        let mut reaped = 0u16;

        while reaped < budget {
            let entry = self.read_entry(&view, head, &mut buf)?;
            if entry.phase() != phase {
                break;
            }
            let slot = reaped as usize * view.entry_size;
            out[slot..slot + view.entry_size].copy_from_slice(&buf);

            reaped += 1;
            head += 1;
            if head == view.elements {
                head = 0;
                phase ^= 1;
            }
            self.retire_completed(&entry);
        }

        if let Some(cq) = self.find_cq_mut(cq_id) {
            cq.public.head_ptr = head;
            cq.public.pbit_new_entry = phase;
        }
        if reaped > 0 {
            self.regs.write32(view.dbs_offset, u32::from(head));
        }

        // Anything still valid past the new head is left for the next call.
        let mut remaining = 0u16;
        while remaining < view.elements {
            let entry = self.read_entry(&view, head, &mut buf)?;
            if entry.phase() != phase {
                break;
            }
            remaining += 1;
            head += 1;
            if head == view.elements {
                head = 0;
                phase ^= 1;
            }
        }

        debug!(cq_id, reaped, remaining, "completions reaped");
        Ok(ReapOutcome { reaped, remaining })
    }

    /// Retire the oldest tracked command of the SQ a completion names.
    fn retire_completed(&mut self, entry: &CompletionEntry) {
        let dma = Arc::clone(&self.dma);
        match self.find_sq_mut(entry.sq_id) {
            Some(sq) => {
                sq.public.head_ptr = entry.sq_head;
                if sq.private.cmds.is_empty() {
                    debug!(
                        sq_id = entry.sq_id,
                        cmd_id = entry.cmd_id,
                        "completion with no tracked command"
                    );
                    return;
                }
                let cmd = sq.private.cmds.remove(0);
                if cmd.unique_id != entry.cmd_id {
                    warn!(
                        sq_id = entry.sq_id,
                        tracked = cmd.unique_id,
                        completed = entry.cmd_id,
                        "completion does not match the oldest tracked command"
                    );
                }
                track::retire_entry(dma.as_ref(), cmd);
            }
            None => debug!(sq_id = entry.sq_id, "completion names an unknown sq"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_parse_unpacks_dwords() {
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&0xdead_beefu32.to_le_bytes());
        bytes[8..12].copy_from_slice(&((7u32 << 16) | 3).to_le_bytes());
        bytes[12..16].copy_from_slice(&((0x8001u32 << 16) | 0x42).to_le_bytes());

        let entry = CompletionEntry::from_le_bytes(&bytes);
        assert_eq!(entry.cmd_specific, 0xdead_beef);
        assert_eq!(entry.sq_head, 3);
        assert_eq!(entry.sq_id, 7);
        assert_eq!(entry.cmd_id, 0x42);
        assert_eq!(entry.status, 0x8001);
        assert_eq!(entry.phase(), 1);
    }
}
