//! Command submission, doorbell rings, persistent queue memory and mmap.

mod common;

use common::new_device;
use rnvme_core::{
    AdminQueueRole, CmdSet, Device, DriverError, MmapTarget, PrepCq, QueueKind, SqPublic,
    SubmitCmd,
};
use rnvme_mem::{Direction, PAGE_SIZE};

fn admin_pair(dev: &mut Device) {
    dev.create_admin_queue(AdminQueueRole::Cq, 16).unwrap();
    dev.create_admin_queue(AdminQueueRole::Sq, 16).unwrap();
}

fn sq_metrics(dev: &Device, sq_id: u16) -> SqPublic {
    let mut out = [0u8; SqPublic::WIRE_LEN];
    dev.get_queue_metrics(sq_id, QueueKind::Sq, &mut out).unwrap();
    SqPublic {
        sq_id: u16::from_le_bytes([out[0], out[1]]),
        cq_id: u16::from_le_bytes([out[2], out[3]]),
        tail_ptr: u16::from_le_bytes([out[4], out[5]]),
        tail_ptr_virt: u16::from_le_bytes([out[6], out[7]]),
        head_ptr: u16::from_le_bytes([out[8], out[9]]),
        elements: u16::from_le_bytes([out[10], out[11]]),
    }
}

#[test]
fn three_page_unaligned_write_pins_three_pages_and_one_list_page() {
    let (platform, _ctrl, mut dev) = new_device();
    admin_pair(&mut dev);

    // Offset 100 bytes into page 1, length 2.5 pages: spans 3 pages, needs
    // a PRP2 list with a single descriptor page.
    let len = 2 * PAGE_SIZE as u32 + PAGE_SIZE as u32 / 2;
    let addr = platform.install_user_buffer(len, 100);
    dev.submit_command(SubmitCmd {
        q_id: 0,
        opcode: 0x01,
        cmd_set: CmdSet::Nvme,
        data_buf_addr: addr,
        data_buf_len: len,
        dir: Direction::ToDevice,
        persist_q_id: None,
    })
    .unwrap();

    assert_eq!(platform.pin_balance(), 3);
    assert_eq!(platform.pool_outstanding(), 1);
    assert_eq!(platform.map_balance(), 1);
    assert_eq!(sq_metrics(&dev, 0).tail_ptr_virt, 1);
}

#[test]
fn doorbell_ring_writes_the_virtual_tail() {
    let (platform, ctrl, mut dev) = new_device();
    admin_pair(&mut dev);

    let addr = platform.install_user_buffer(512, 0);
    dev.submit_command(SubmitCmd {
        q_id: 0,
        opcode: 0x0c,
        cmd_set: CmdSet::Admin,
        data_buf_addr: addr,
        data_buf_len: 512,
        dir: Direction::FromDevice,
        persist_q_id: None,
    })
    .unwrap();

    let before = sq_metrics(&dev, 0);
    assert_eq!(before.tail_ptr, 0);
    assert_eq!(before.tail_ptr_virt, 1);

    dev.ring_doorbell(0).unwrap();
    let after = sq_metrics(&dev, 0);
    assert_eq!(after.tail_ptr, 1);
    // Admin SQ tail doorbell lives at 0x1000 with a 4-byte stride.
    assert_eq!(ctrl.doorbell_writes(), vec![(0x1000, 1)]);

    assert!(matches!(
        dev.ring_doorbell(9),
        Err(DriverError::NotFound { .. })
    ));
}

#[test]
fn unique_command_ids_are_monotonic_per_queue() {
    let (platform, _ctrl, mut dev) = new_device();
    admin_pair(&mut dev);

    for expected_tail in 1..=3u16 {
        let addr = platform.install_user_buffer(256, 0);
        dev.submit_command(SubmitCmd {
            q_id: 0,
            opcode: 0x02,
            cmd_set: CmdSet::Admin,
            data_buf_addr: addr,
            data_buf_len: 256,
            dir: Direction::FromDevice,
            persist_q_id: None,
        })
        .unwrap();
        assert_eq!(sq_metrics(&dev, 0).tail_ptr_virt, expected_tail);
    }
}

#[test]
fn submit_rejects_unknown_queues_and_bad_buffers_without_leaks() {
    let (platform, _ctrl, mut dev) = new_device();
    admin_pair(&mut dev);

    let addr = platform.install_user_buffer(512, 0);
    assert!(matches!(
        dev.submit_command(SubmitCmd {
            q_id: 7,
            opcode: 0x02,
            cmd_set: CmdSet::Nvme,
            data_buf_addr: addr,
            data_buf_len: 512,
            dir: Direction::ToDevice,
            persist_q_id: None,
        }),
        Err(DriverError::NotFound { .. })
    ));

    assert!(matches!(
        dev.submit_command(SubmitCmd {
            q_id: 0,
            opcode: 0x02,
            cmd_set: CmdSet::Nvme,
            data_buf_addr: 0,
            data_buf_len: 512,
            dir: Direction::ToDevice,
            persist_q_id: None,
        }),
        Err(DriverError::InvalidArgument(_))
    ));

    assert_eq!(platform.pin_balance(), 0);
    assert_eq!(platform.map_balance(), 0);
    assert_eq!(platform.pool_outstanding(), 0);
}

#[test]
fn non_contiguous_queue_memory_persists_on_the_queue() {
    let (platform, _ctrl, mut dev) = new_device();
    admin_pair(&mut dev);

    dev.prepare_io_cq(PrepCq {
        cq_id: 2,
        elements: 64,
        contig: false,
    })
    .unwrap();
    // Non-contiguous queues allocate nothing up front.
    assert_eq!(platform.coherent_outstanding(), 2);

    // The create-CQ admin command carries the queue's memory.
    let len = 2 * PAGE_SIZE as u32;
    let addr = platform.install_user_buffer(len, 0);
    dev.submit_command(SubmitCmd {
        q_id: 0,
        opcode: 0x05,
        cmd_set: CmdSet::Admin,
        data_buf_addr: addr,
        data_buf_len: len,
        dir: Direction::ToDevice,
        persist_q_id: Some(2),
    })
    .unwrap();
    assert_eq!(platform.pool_outstanding(), 1);
    assert_eq!(platform.pin_balance(), 2);

    // The queue owns the descriptor, so it cannot be mapped and survives
    // until the queue goes away.
    assert!(matches!(
        dev.mmap_region(MmapTarget::Cq(2).encode(), PAGE_SIZE as u32),
        Err(DriverError::Unsupported(_))
    ));
    dev.delete_queue(2, QueueKind::Cq).unwrap();
    assert_eq!(platform.pool_outstanding(), 0);
    assert_eq!(platform.pin_balance(), 0);
}

#[test]
fn persistent_prps_on_a_contiguous_queue_are_rejected_and_unwound() {
    let (platform, _ctrl, mut dev) = new_device();
    admin_pair(&mut dev);
    dev.prepare_io_cq(PrepCq {
        cq_id: 3,
        elements: 16,
        contig: true,
    })
    .unwrap();

    let len = PAGE_SIZE as u32;
    let addr = platform.install_user_buffer(len, 0);
    assert!(matches!(
        dev.submit_command(SubmitCmd {
            q_id: 0,
            opcode: 0x05,
            cmd_set: CmdSet::Admin,
            data_buf_addr: addr,
            data_buf_len: len,
            dir: Direction::ToDevice,
            persist_q_id: Some(3),
        }),
        Err(DriverError::InvalidArgument(_))
    ));
    assert_eq!(platform.pool_outstanding(), 0);
    assert_eq!(platform.pin_balance(), 0);
    assert_eq!(platform.map_balance(), 0);
}

#[test]
fn mmap_resolves_contiguous_regions_and_bounds_requests() {
    let (_platform, ctrl, mut dev) = new_device();
    admin_pair(&mut dev);

    // 16 admin SQ entries of 64 bytes.
    let region = dev
        .mmap_region(MmapTarget::Sq(0).encode(), 1024)
        .unwrap();
    assert_eq!(region.addr, ctrl.asq());
    assert_eq!(region.len, 16 * 64);

    // Requests round up to the region's page span, nothing beyond it.
    assert!(matches!(
        dev.mmap_region(MmapTarget::Sq(0).encode(), 2 * PAGE_SIZE as u32),
        Err(DriverError::InvalidArgument(_))
    ));
    assert!(matches!(
        dev.mmap_region(MmapTarget::Sq(9).encode(), 64),
        Err(DriverError::NotFound { .. })
    ));
}

#[test]
fn meta_buffers_allocate_by_id_and_mmap_by_type_two() {
    let (platform, _ctrl, mut dev) = new_device();

    assert!(matches!(
        dev.meta_alloc(1),
        Err(DriverError::InvalidState(_))
    ));
    dev.meta_pool_create(4096).unwrap();
    assert!(matches!(
        dev.meta_pool_create(4096),
        Err(DriverError::InvalidState(_))
    ));
    assert!(matches!(
        dev.meta_pool_create(0x4001),
        Err(DriverError::InvalidArgument(_))
    ));

    dev.meta_alloc(3).unwrap();
    assert!(matches!(dev.meta_alloc(3), Err(DriverError::Duplicate(3))));
    assert_eq!(platform.coherent_outstanding(), 1);

    let region = dev
        .mmap_region(MmapTarget::Meta(3).encode(), 4096)
        .unwrap();
    assert_eq!(region.len, 4096);

    dev.meta_delete(3).unwrap();
    assert_eq!(platform.coherent_outstanding(), 0);
    assert!(matches!(
        dev.meta_delete(3),
        Err(DriverError::NotFound { .. })
    ));
    assert!(matches!(
        dev.mmap_region(MmapTarget::Meta(3).encode(), 64),
        Err(DriverError::NotFound { .. })
    ));
}
