//! Queue and DMA-transfer lifecycle engine for an NVMe compliance/test
//! driver.
//!
//! This crate is the mechanism layer behind a thin ioctl-style dispatch
//! boundary: it tracks every submission/completion queue's hardware and
//! software state, builds PRP descriptors for scattered user buffers, pins
//! and maps memory for DMA, and reaps completion entries with phase-bit and
//! wrap-around semantics. The dispatch boundary hands it a locked
//! [`Device`] and validated parameters and gets back plain results and
//! fixed-layout structures.
//!
//! The only external inputs are a [`rnvme_regs::RegisterSpace`] (the
//! controller's BAR0) and a [`rnvme_mem::DmaPlatform`] (coherent memory,
//! the PRP page pool, user-page pinning). There are no internal threads and
//! no global state; every operation takes the device explicitly and the
//! per-device mutex lives in [`DeviceEntry`].

pub mod ctrl;
pub mod device;
pub mod dma;
pub mod error;
pub mod meta;
pub mod prp;
pub mod queue;
pub mod reap;
pub mod track;

pub use ctrl::{AdminQueueRole, CtrlState, NvmeState, MAX_AQ_ENTRIES};
pub use device::{
    Device, DeviceEntry, DeviceRegistry, MmapRegion, MmapTarget, PrepCq, PrepSq, SubmitCmd,
};
pub use error::{DriverError, Result};
pub use meta::MAX_META_BUF_SIZE;
pub use prp::{PrpDescriptor, PrpEntries, LIST_DATA_SLOTS, PRPS_PER_PAGE};
pub use queue::{CqPublic, QueueKind, SqPublic};
pub use reap::{CompletionEntry, ReapOutcome};
pub use track::CmdSet;
