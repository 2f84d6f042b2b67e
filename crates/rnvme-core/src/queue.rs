//! Submission/completion queue metadata.
//!
//! Each queue splits into a public half — the geometry and pointers reported
//! back to the harness through the queue-metrics op, serialized in a fixed
//! little-endian layout — and a private half holding the kernel-side
//! resources: backing memory, doorbell location, the command ledger (SQ) and
//! the persistent PRP descriptor of non-contiguous queue memory.

use rnvme_mem::DmaRegion;

use crate::error::{DriverError, Result};
use crate::prp::PrpDescriptor;
use crate::track::CmdTrack;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Sq,
    Cq,
}

impl QueueKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            QueueKind::Sq => "submission queue",
            QueueKind::Cq => "completion queue",
        }
    }
}

/// Public SQ parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqPublic {
    pub sq_id: u16,
    /// The CQ this SQ posts completions to.
    pub cq_id: u16,
    /// Last value actually written to the tail doorbell.
    pub tail_ptr: u16,
    /// Next doorbell value, advanced as commands are copied in.
    pub tail_ptr_virt: u16,
    /// Derived from reaped completions, not read from hardware.
    pub head_ptr: u16,
    pub elements: u16,
}

impl SqPublic {
    /// Serialized size of the metrics layout.
    pub const WIRE_LEN: usize = 12;

    pub fn write_le(&self, out: &mut [u8]) -> Result<()> {
        if out.len() < Self::WIRE_LEN {
            return Err(DriverError::InvalidArgument("metrics buffer too small"));
        }
        out[0..2].copy_from_slice(&self.sq_id.to_le_bytes());
        out[2..4].copy_from_slice(&self.cq_id.to_le_bytes());
        out[4..6].copy_from_slice(&self.tail_ptr.to_le_bytes());
        out[6..8].copy_from_slice(&self.tail_ptr_virt.to_le_bytes());
        out[8..10].copy_from_slice(&self.head_ptr.to_le_bytes());
        out[10..12].copy_from_slice(&self.elements.to_le_bytes());
        Ok(())
    }
}

/// Public CQ parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqPublic {
    pub q_id: u16,
    pub tail_ptr: u16,
    pub head_ptr: u16,
    pub elements: u16,
    /// Phase value a fresh completion entry must carry to be valid; toggles
    /// each time the head wraps.
    pub pbit_new_entry: u8,
}

impl CqPublic {
    pub const WIRE_LEN: usize = 9;

    pub fn write_le(&self, out: &mut [u8]) -> Result<()> {
        if out.len() < Self::WIRE_LEN {
            return Err(DriverError::InvalidArgument("metrics buffer too small"));
        }
        out[0..2].copy_from_slice(&self.q_id.to_le_bytes());
        out[2..4].copy_from_slice(&self.tail_ptr.to_le_bytes());
        out[4..6].copy_from_slice(&self.head_ptr.to_le_bytes());
        out[6..8].copy_from_slice(&self.elements.to_le_bytes());
        out[8] = self.pbit_new_entry;
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct SqPrivate {
    pub(crate) backing: Option<DmaRegion>,
    pub(crate) dbs_offset: u64,
    pub(crate) contig: bool,
    pub(crate) cmds: Vec<CmdTrack>,
    pub(crate) next_cmd_id: u16,
    pub(crate) prp_persist: Option<PrpDescriptor>,
}

#[derive(Debug)]
pub struct SqMeta {
    pub public: SqPublic,
    pub(crate) private: SqPrivate,
}

impl SqMeta {
    pub(crate) fn new(sq_id: u16, cq_id: u16, elements: u16, contig: bool) -> Self {
        SqMeta {
            public: SqPublic {
                sq_id,
                cq_id,
                tail_ptr: 0,
                tail_ptr_virt: 0,
                head_ptr: 0,
                elements,
            },
            private: SqPrivate {
                backing: None,
                dbs_offset: 0,
                contig,
                cmds: Vec::new(),
                next_cmd_id: 0,
                prp_persist: None,
            },
        }
    }
}

#[derive(Debug)]
pub(crate) struct CqPrivate {
    pub(crate) backing: Option<DmaRegion>,
    pub(crate) dbs_offset: u64,
    pub(crate) contig: bool,
    pub(crate) prp_persist: Option<PrpDescriptor>,
}

#[derive(Debug)]
pub struct CqMeta {
    pub public: CqPublic,
    pub(crate) private: CqPrivate,
}

impl CqMeta {
    pub(crate) fn new(q_id: u16, elements: u16, contig: bool) -> Self {
        CqMeta {
            public: CqPublic {
                q_id,
                tail_ptr: 0,
                head_ptr: 0,
                elements,
                // First pass around the ring expects phase 1.
                pbit_new_entry: 1,
            },
            private: CqPrivate {
                backing: None,
                dbs_offset: 0,
                contig,
                prp_persist: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sq_metrics_layout_is_little_endian_in_field_order() {
        let public = SqPublic {
            sq_id: 0x0102,
            cq_id: 0x0304,
            tail_ptr: 0x0506,
            tail_ptr_virt: 0x0708,
            head_ptr: 0x090a,
            elements: 0x0b0c,
        };
        let mut out = [0u8; SqPublic::WIRE_LEN];
        public.write_le(&mut out).unwrap();
        assert_eq!(
            out,
            [0x02, 0x01, 0x04, 0x03, 0x06, 0x05, 0x08, 0x07, 0x0a, 0x09, 0x0c, 0x0b]
        );
    }

    #[test]
    fn cq_metrics_layout_ends_with_the_phase_bit() {
        let public = CqPublic {
            q_id: 7,
            tail_ptr: 0,
            head_ptr: 3,
            elements: 16,
            pbit_new_entry: 1,
        };
        let mut out = [0u8; CqPublic::WIRE_LEN];
        public.write_le(&mut out).unwrap();
        assert_eq!(out[0], 7);
        assert_eq!(out[4], 3);
        assert_eq!(out[8], 1);

        let mut short = [0u8; CqPublic::WIRE_LEN - 1];
        assert!(public.write_le(&mut short).is_err());
    }

    #[test]
    fn fresh_queues_start_at_zero_with_phase_one() {
        let sq = SqMeta::new(5, 1, 64, true);
        assert_eq!(sq.public.tail_ptr_virt, 0);
        assert_eq!(sq.public.head_ptr, 0);
        assert!(sq.private.cmds.is_empty());

        let cq = CqMeta::new(5, 64, true);
        assert_eq!(cq.public.pbit_new_entry, 1);
    }
}
