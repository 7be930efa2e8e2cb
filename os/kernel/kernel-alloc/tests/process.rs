mod common;

use common::{USER_SPACE_END, boot_directory, run};
use kernel_alloc::{AllocError, InvariantViolation, PoolKind};
use kernel_info::memory::{KERNEL_DIRECTORY_SLOT, PAGE_SIZE, RECURSIVE_SLOT, USER_VADDR_START};
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{Mmu, PageTableManager};

const USER: VirtualAddress = VirtualAddress::new(USER_VADDR_START);

#[test]
fn create_and_destroy_restores_both_pools() {
    run(32, |h| {
        let before = h.mm.stats();

        h.spawn();
        assert_eq!(h.mm.stats().kernel_free_frames, before.kernel_free_frames - 2);
        h.mm.allocate_user_pages(3).unwrap();
        h.mm.allocate(100).unwrap();
        h.mm.allocate(9000).unwrap();
        let stack = VirtualAddress::new(USER_SPACE_END.as_u32() - PAGE_SIZE);
        h.mm.allocate_fixed(PoolKind::User, stack).unwrap();
        h.mm.install_page(PoolKind::User, VirtualAddress::new(stack.as_u32() - PAGE_SIZE)).unwrap();
        assert!(h.mm.stats().user_free_frames < before.user_free_frames);

        h.exit();
        assert_eq!(h.mm.stats(), before);
        assert_eq!(h.machine.active_directory(), boot_directory());
    });
}

#[test]
fn new_directory_shares_the_kernel_half_only() {
    run(16, |h| {
        let shared = h.mm.allocate_kernel_pages(1).unwrap();
        h.machine.write_bytes(shared, b"kernel data");

        let process = h.mm.create_process_memory().unwrap();
        let entries: Vec<u32> = (0..1024)
            .map(|slot| {
                let bytes = h.machine.read_bytes(process.directory() + slot * 4, 4);
                u32::from_le_bytes(bytes.try_into().unwrap())
            })
            .collect();
        assert!(entries[..KERNEL_DIRECTORY_SLOT as usize].iter().all(|&e| e == 0));
        assert_ne!(entries[KERNEL_DIRECTORY_SLOT as usize], 0);
        assert_eq!(entries[RECURSIVE_SLOT as usize] & !0xfff, process.directory_frame().as_u32());

        h.scheduler.enter(h.machine, process);
        assert_eq!(h.machine.read_bytes(shared, 11), b"kernel data");
        assert!(h.mm.translate(shared).is_some());
        assert_eq!(h.mm.translate(VirtualAddress::new(0x1000)), None);
    });
}

#[test]
fn processes_are_isolated() {
    run(16, |h| {
        h.spawn();
        let first = h.mm.allocate_user_pages(1).unwrap();
        let first_frame = h.mm.translate(first).unwrap();
        h.machine.write_bytes(first, b"first");
        let one = h.scheduler.leave(h.machine).unwrap();

        h.spawn();
        let second = h.mm.allocate_user_pages(1).unwrap();
        assert_eq!(second, first);
        assert_ne!(h.mm.translate(second), Some(first_frame));
        assert_eq!(h.machine.read_bytes(second, 5), [0u8; 5]);
        let two = h.scheduler.leave(h.machine).unwrap();

        h.scheduler.enter(h.machine, one);
        assert_eq!(h.machine.read_bytes(first, 5), b"first");
        h.exit();
        h.scheduler.enter(h.machine, two);
        h.exit();
    });
}

#[test]
fn teardown_order_is_enforced() {
    run(16, |h| {
        h.spawn();
        h.mm.allocate_user_pages(1).unwrap();
        let mut process = h.scheduler.take().unwrap();
        let directory = process.directory_frame();

        // releasing needs the process' own directory active
        let other = h.mm.create_process_memory().unwrap();
        let other_directory = other.directory_frame();
        h.machine.activate(other_directory);
        assert_eq!(
            h.mm.try_release_user_space(&mut process),
            Err(AllocError::Invariant(InvariantViolation::ProcessInactive { directory }))
        );

        // destroying needs another directory active
        assert_eq!(
            h.mm.try_destroy_process_memory(other),
            Err(AllocError::Invariant(InvariantViolation::ProcessActive {
                directory: other_directory
            }))
        );

        // and no user mappings left
        h.machine.activate(boot_directory());
        assert_eq!(
            h.mm.try_destroy_process_memory(process),
            Err(AllocError::Invariant(InvariantViolation::UserMappingsRemain { directory }))
        );
    });
}

#[test]
fn released_space_can_be_reused() {
    run(16, |h| {
        h.spawn();
        let va = h.mm.allocate_user_pages(4).unwrap();
        h.mm.allocate(64).unwrap();

        let mut process = h.scheduler.take().unwrap();
        h.mm.release_user_space(&mut process);
        assert_eq!(process.space().reserved_pages(), 0);
        assert_eq!(process.ladder().descriptor(2).unwrap().free_blocks(), 0);
        assert!(!PageTableManager::new(h.machine).directory_entry(va).present());
        assert_eq!(h.mm.stats().user_free_frames, 16);

        h.scheduler.enter(h.machine, process);
        assert_eq!(h.mm.allocate_user_pages(2), Some(USER));
    });
}

#[test]
fn process_creation_is_all_or_nothing() {
    run(2, |h| {
        // room for the directory, but not for the bitmap as well
        let hog = h.mm.allocate_kernel_pages(1).unwrap();
        let before = h.mm.stats();
        assert_eq!(before.kernel_free_frames, 1);

        assert_eq!(h.mm.create_process_memory().map(|p| p.directory()), None);
        assert_eq!(h.mm.stats(), before);

        h.mm.free_pages(PoolKind::Kernel, hog, 1);
        assert!(h.mm.create_process_memory().is_some());
    });
}
