#![allow(dead_code)]

//! Shared harness: a register-level controller model plus device setup.
//!
//! `SimController` plays the controller's BAR0. Its only behavior is the
//! enable handshake: CSTS.RDY follows CC.EN, but only once both admin queue
//! attributes and both base addresses are programmed and page-aligned —
//! which is exactly why enabling with a lone admin SQ must run the driver's
//! ready-wait out of its CAP.TO budget.

use std::sync::{Arc, Mutex};

use rnvme_core::Device;
use rnvme_mem::{DmaPlatform, SimPlatform, PAGE_SIZE};
use rnvme_regs::{
    RegisterSpace, REG_ACQ, REG_AQA, REG_ASQ, REG_CAP, REG_CC, REG_CSTS, REG_SQ0TDBL,
};

/// CAP.TO advertised by the model: one 500 ms unit, so timeout tests stay
/// fast while still exercising several poll iterations.
pub const CAP_TO_UNITS: u64 = 1;
/// MQES=4095, DSTRD=0, TO as above.
pub const CAP_VALUE: u64 = (CAP_TO_UNITS << 24) | 4095;

#[derive(Default)]
struct ControllerRegs {
    cc: u32,
    csts: u32,
    aqa: u32,
    asq: u64,
    acq: u64,
    doorbells: Vec<(u64, u32)>,
}

impl ControllerRegs {
    fn refresh_ready(&mut self) {
        let enabled = self.cc & 0x1 != 0;
        let asqs = self.aqa & 0x0fff;
        let acqs = (self.aqa >> 16) & 0x0fff;
        let bases_ok = self.asq != 0
            && self.acq != 0
            && self.asq % PAGE_SIZE as u64 == 0
            && self.acq % PAGE_SIZE as u64 == 0;
        self.csts = if enabled && asqs != 0 && acqs != 0 && bases_ok {
            0x1
        } else {
            0x0
        };
    }
}

pub struct SimController {
    regs: Mutex<ControllerRegs>,
}

impl SimController {
    pub fn new() -> Self {
        SimController {
            regs: Mutex::new(ControllerRegs::default()),
        }
    }

    pub fn aqa(&self) -> u32 {
        self.regs.lock().unwrap().aqa
    }

    pub fn asq(&self) -> u64 {
        self.regs.lock().unwrap().asq
    }

    pub fn acq(&self) -> u64 {
        self.regs.lock().unwrap().acq
    }

    pub fn cc(&self) -> u32 {
        self.regs.lock().unwrap().cc
    }

    /// Doorbell writes observed, in order, as (offset, value).
    pub fn doorbell_writes(&self) -> Vec<(u64, u32)> {
        self.regs.lock().unwrap().doorbells.clone()
    }
}

impl RegisterSpace for SimController {
    fn read32(&self, offset: u64) -> u32 {
        let regs = self.regs.lock().unwrap();
        match offset {
            REG_CAP => CAP_VALUE as u32,
            o if o == REG_CAP + 4 => (CAP_VALUE >> 32) as u32,
            REG_CC => regs.cc,
            REG_CSTS => regs.csts,
            REG_AQA => regs.aqa,
            REG_ASQ => regs.asq as u32,
            o if o == REG_ASQ + 4 => (regs.asq >> 32) as u32,
            REG_ACQ => regs.acq as u32,
            o if o == REG_ACQ + 4 => (regs.acq >> 32) as u32,
            _ => 0,
        }
    }

    fn write32(&self, offset: u64, value: u32) {
        let mut regs = self.regs.lock().unwrap();
        match offset {
            REG_CC => {
                regs.cc = value;
                regs.refresh_ready();
            }
            REG_AQA => regs.aqa = value,
            REG_ASQ => regs.asq = (regs.asq & !0xffff_ffff) | u64::from(value),
            o if o == REG_ASQ + 4 => {
                regs.asq = (regs.asq & 0xffff_ffff) | (u64::from(value) << 32)
            }
            REG_ACQ => regs.acq = (regs.acq & !0xffff_ffff) | u64::from(value),
            o if o == REG_ACQ + 4 => {
                regs.acq = (regs.acq & 0xffff_ffff) | (u64::from(value) << 32)
            }
            o if o >= REG_SQ0TDBL => regs.doorbells.push((o, value)),
            _ => {}
        }
    }
}

/// A fresh device on a fresh platform and controller model.
pub fn new_device() -> (Arc<SimPlatform>, Arc<SimController>, Device) {
    let platform = Arc::new(SimPlatform::new(32 << 20));
    let ctrl = Arc::new(SimController::new());
    let device = Device::new(ctrl.clone(), platform.clone());
    (platform, ctrl, device)
}

/// Fabricate one completion entry in a CQ ring, playing the device role.
pub fn write_completion(
    platform: &SimPlatform,
    cq_base: u64,
    entry_size: usize,
    slot: u16,
    sq_id: u16,
    sq_head: u16,
    cmd_id: u16,
    phase: u8,
) {
    let mut bytes = vec![0u8; entry_size];
    let dw2 = u32::from(sq_head) | (u32::from(sq_id) << 16);
    let status = u16::from(phase & 0x1);
    let dw3 = u32::from(cmd_id) | (u32::from(status) << 16);
    bytes[8..12].copy_from_slice(&dw2.to_le_bytes());
    bytes[12..16].copy_from_slice(&dw3.to_le_bytes());
    platform
        .write_physical(cq_base + u64::from(slot) * entry_size as u64, &bytes)
        .unwrap();
}
