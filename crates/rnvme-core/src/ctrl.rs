//! Controller enable/disable state machine and queue allocation.
//!
//! Enable sets CC.EN and waits for CSTS.RDY with a budget derived from
//! CAP.TO (500 ms units), polling every 100 ms against a deadline computed
//! up front. The admin completion queue must be created before the admin
//! submission queue: a lone ASQ cannot reach ready state, and the wait will
//! run out its budget. That ordering is the caller's contract, not enforced
//! here.

use std::thread;
use std::time::{Duration, Instant};

use rnvme_regs::{
    cap_doorbell_stride, cap_timeout_units, cq_doorbell, sq_doorbell, Cc, Csts, AQA_ACQS_MASK,
    AQA_ACQS_SHIFT, AQA_ASQS_MASK, CC_IOCQES_SHIFT, CC_IOSQES_SHIFT, CC_QES_MASK, REG_ACQ,
    REG_AQA, REG_ASQ, REG_CAP, REG_CC, REG_CSTS,
};
use tracing::{debug, warn};

use crate::device::{Device, PrepCq, PrepSq};
use crate::error::{DriverError, Result};
use crate::queue::{CqMeta, QueueKind, SqMeta};

/// Upper bound on admin queue elements accepted from the harness.
pub const MAX_AQ_ENTRIES: u16 = 4096;
/// Admin SQ entries are always 64 bytes.
const ASQ_ENTRY_BYTES: u32 = 64;
/// Admin CQ entries are always 16 bytes.
const ACQ_ENTRY_BYTES: u32 = 16;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// CAP.TO is expressed in units of 500 ms.
const CAP_TO_UNIT: Duration = Duration::from_millis(500);

/// Which half of the admin pair to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminQueueRole {
    Sq,
    Cq,
}

/// Requested controller state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvmeState {
    Enable,
    /// Reset the enable bit and release the admin queues.
    Disable,
    /// Disable plus teardown of every queue, tracked command and meta buffer.
    DisableCompletely,
}

/// Where the controller currently is in its enable cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlState {
    Disabled,
    Enabling,
    Ready,
}

impl Device {
    /// Allocate one half of the admin queue pair (id 0) and program the
    /// matching AQA half and base-address register.
    pub fn create_admin_queue(&mut self, role: AdminQueueRole, elements: u16) -> Result<()> {
        if elements == 0 || elements > MAX_AQ_ENTRIES {
            return Err(DriverError::InvalidArgument(
                "admin queue elements out of range",
            ));
        }
        match role {
            AdminQueueRole::Sq => self.create_admin_sq(elements),
            AdminQueueRole::Cq => self.create_admin_cq(elements),
        }
    }

    fn create_admin_sq(&mut self, elements: u16) -> Result<()> {
        if self.find_sq(0).is_some() {
            return Err(DriverError::Duplicate(0));
        }
        let backing = self.dma.alloc_coherent(u32::from(elements) * ASQ_ENTRY_BYTES)?;

        let mut aqa = self.regs.read32(REG_AQA);
        aqa &= !AQA_ASQS_MASK;
        aqa |= u32::from(elements) & AQA_ASQS_MASK;
        self.regs.write32(REG_AQA, aqa);
        self.regs.write64(REG_ASQ, backing.addr);

        let stride = cap_doorbell_stride(self.regs.read64(REG_CAP));
        // The admin SQ always pairs with CQ 0, whether or not it exists yet.
        let mut sq = SqMeta::new(0, 0, elements, true);
        sq.private.backing = Some(backing);
        sq.private.dbs_offset = sq_doorbell(0, stride);
        self.sqs.push(sq);
        debug!(elements, base = backing.addr, "admin sq created");
        Ok(())
    }

    fn create_admin_cq(&mut self, elements: u16) -> Result<()> {
        if self.find_cq(0).is_some() {
            return Err(DriverError::Duplicate(0));
        }
        let backing = self.dma.alloc_coherent(u32::from(elements) * ACQ_ENTRY_BYTES)?;

        let mut aqa = self.regs.read32(REG_AQA);
        aqa &= !AQA_ACQS_MASK;
        aqa |= (u32::from(elements) << AQA_ACQS_SHIFT) & AQA_ACQS_MASK;
        self.regs.write32(REG_AQA, aqa);
        self.regs.write64(REG_ACQ, backing.addr);

        let stride = cap_doorbell_stride(self.regs.read64(REG_CAP));
        let mut cq = CqMeta::new(0, elements, true);
        cq.private.backing = Some(backing);
        cq.private.dbs_offset = cq_doorbell(0, stride);
        self.cqs.push(cq);
        debug!(elements, base = backing.addr, "admin cq created");
        Ok(())
    }

    /// Allocate an I/O submission queue sized by the controller's configured
    /// CC.IOSQES. The admin pair must exist first.
    pub fn prepare_io_sq(&mut self, prep: PrepSq) -> Result<()> {
        self.check_io_queue_prereqs(prep.sq_id, prep.elements, QueueKind::Sq)?;

        let iosqes = (self.regs.read32(REG_CC) >> CC_IOSQES_SHIFT) & CC_QES_MASK;
        let bytes = u32::from(prep.elements) << iosqes;

        let mut sq = SqMeta::new(prep.sq_id, prep.cq_id, prep.elements, prep.contig);
        if prep.contig {
            sq.private.backing = Some(self.dma.alloc_coherent(bytes)?);
        }
        let stride = cap_doorbell_stride(self.regs.read64(REG_CAP));
        sq.private.dbs_offset = sq_doorbell(prep.sq_id, stride);
        self.sqs.push(sq);
        debug!(
            sq_id = prep.sq_id,
            cq_id = prep.cq_id,
            elements = prep.elements,
            bytes,
            contig = prep.contig,
            "io sq prepared"
        );
        Ok(())
    }

    /// Allocate an I/O completion queue sized by CC.IOCQES.
    pub fn prepare_io_cq(&mut self, prep: PrepCq) -> Result<()> {
        self.check_io_queue_prereqs(prep.cq_id, prep.elements, QueueKind::Cq)?;

        let iocqes = (self.regs.read32(REG_CC) >> CC_IOCQES_SHIFT) & CC_QES_MASK;
        let bytes = u32::from(prep.elements) << iocqes;

        let mut cq = CqMeta::new(prep.cq_id, prep.elements, prep.contig);
        if prep.contig {
            cq.private.backing = Some(self.dma.alloc_coherent(bytes)?);
        }
        let stride = cap_doorbell_stride(self.regs.read64(REG_CAP));
        cq.private.dbs_offset = cq_doorbell(prep.cq_id, stride);
        self.cqs.push(cq);
        debug!(
            cq_id = prep.cq_id,
            elements = prep.elements,
            bytes,
            contig = prep.contig,
            "io cq prepared"
        );
        Ok(())
    }

    fn check_io_queue_prereqs(&self, q_id: u16, elements: u16, kind: QueueKind) -> Result<()> {
        if q_id == 0 {
            return Err(DriverError::InvalidArgument(
                "queue id 0 is reserved for the admin pair",
            ));
        }
        if elements == 0 {
            return Err(DriverError::InvalidArgument("queue elements must be nonzero"));
        }
        if self.find_sq(0).is_none() || self.find_cq(0).is_none() {
            return Err(DriverError::InvalidState(
                "admin queue pair must exist before io queues",
            ));
        }
        let exists = match kind {
            QueueKind::Sq => self.find_sq(q_id).is_some(),
            QueueKind::Cq => self.find_cq(q_id).is_some(),
        };
        if exists {
            return Err(DriverError::Duplicate(u32::from(q_id)));
        }
        Ok(())
    }

    /// Drive the controller through the requested state transition.
    pub fn set_ctrl_state(&mut self, target: NvmeState) -> Result<()> {
        match target {
            NvmeState::Enable => self.ctrl_enable(),
            NvmeState::Disable => self.ctrl_disable(false),
            NvmeState::DisableCompletely => self.ctrl_disable(true),
        }
    }

    fn ctrl_enable(&mut self) -> Result<()> {
        let cc = self.regs.read32(REG_CC);
        self.regs.write32(REG_CC, cc | Cc::EN.bits());
        self.state = CtrlState::Enabling;

        let cap = self.regs.read64(REG_CAP);
        let budget = CAP_TO_UNIT * cap_timeout_units(cap) as u32;
        let deadline = Instant::now() + budget;
        debug!(?budget, "waiting for CSTS.RDY");

        loop {
            let csts = Csts::from_bits_truncate(self.regs.read32(REG_CSTS));
            if csts.contains(Csts::RDY) {
                self.state = CtrlState::Ready;
                debug!("controller ready");
                return Ok(());
            }
            if Instant::now() >= deadline {
                self.state = CtrlState::Disabled;
                warn!(
                    ?budget,
                    "controller not ready; was the admin completion queue created first?"
                );
                return Err(DriverError::ControllerTimeout(budget));
            }
            thread::sleep(READY_POLL_INTERVAL);
        }
    }

    fn ctrl_disable(&mut self, completely: bool) -> Result<()> {
        if self.sqs.is_empty() && self.cqs.is_empty() {
            return Err(DriverError::InvalidState("no queue was ever created"));
        }

        let cc = self.regs.read32(REG_CC);
        self.regs.write32(REG_CC, cc & !Cc::EN.bits());
        self.regs.write32(REG_CC, 0);
        self.state = CtrlState::Disabled;

        if completely {
            for sq in std::mem::take(&mut self.sqs) {
                self.teardown_sq(sq);
            }
            for cq in std::mem::take(&mut self.cqs) {
                self.teardown_cq(cq);
            }
            self.meta_teardown();
            debug!("controller disabled completely");
        } else {
            if let Some(sq) = self.take_sq(0) {
                self.teardown_sq(sq);
            }
            if let Some(cq) = self.take_cq(0) {
                self.teardown_cq(cq);
            }
            debug!("controller disabled, admin queues released");
        }
        Ok(())
    }
}
