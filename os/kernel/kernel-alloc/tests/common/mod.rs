#![allow(dead_code)]

use std::cell::{Cell, RefCell};

use kernel_alloc::{MemoryManager, ProcessMemory, Scheduler};
use kernel_info::layout::{LayoutConfig, MemoryLayout};
use kernel_info::memory::{BOOT_RESERVED_BYTES, PAGE_DIRECTORY_PHYS, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_sync::OwnerId;
use kernel_vmem::sim::SimulatedMachine;

/// End of the user space in tests; keeps a process bitmap within one page.
pub const USER_SPACE_END: VirtualAddress = VirtualAddress::new(0x0884_8000);

pub type TestManager<'m> = MemoryManager<'m, SimulatedMachine, SimulatedMachine, TestScheduler<'m>>;

/// One task at a time, optionally running a process.
pub struct TestScheduler<'m> {
    task: Cell<usize>,
    process: RefCell<Option<ProcessMemory<'m>>>,
}

impl<'m> TestScheduler<'m> {
    pub fn new() -> Self {
        Self {
            task: Cell::new(1),
            process: RefCell::new(None),
        }
    }

    /// Makes `process` the running process and activates its directory.
    pub fn enter(&self, machine: &SimulatedMachine, process: ProcessMemory<'m>) {
        machine.activate(process.directory_frame());
        *self.process.borrow_mut() = Some(process);
    }

    /// Takes the running process back; its directory stays active.
    pub fn take(&self) -> Option<ProcessMemory<'m>> {
        self.process.borrow_mut().take()
    }

    /// Back to a kernel thread on the boot directory.
    pub fn leave(&self, machine: &SimulatedMachine) -> Option<ProcessMemory<'m>> {
        machine.activate(boot_directory());
        self.take()
    }

    pub fn with_process<R>(&self, f: impl FnOnce(&ProcessMemory<'m>) -> R) -> R {
        f(self.process.borrow().as_ref().expect("no process running"))
    }
}

impl<'m> Scheduler<'m> for TestScheduler<'m> {
    fn current_task(&self) -> OwnerId {
        OwnerId::new(self.task.get()).expect("task ids start at 1")
    }

    fn with_current_process<R>(&self, f: impl FnOnce(Option<&mut ProcessMemory<'m>>) -> R) -> R {
        f(self.process.borrow_mut().as_mut())
    }
}

pub struct Harness<'m> {
    pub machine: &'m SimulatedMachine,
    pub scheduler: &'m TestScheduler<'m>,
    pub mm: TestManager<'m>,
}

impl<'m> Harness<'m> {
    /// Creates a process and makes it the running one.
    pub fn spawn(&self) {
        let process = self.mm.create_process_memory().expect("process memory");
        self.scheduler.enter(self.machine, process);
    }

    /// Raw bytes of both frame bitmaps and the kernel space bitmap, followed
    /// by the running process' space bitmap if there is one.
    pub fn bitmaps(&self) -> Vec<Vec<u8>> {
        let layout = self.mm.layout();
        let mut maps: Vec<Vec<u8>> = [
            layout.kernel_frame_bitmap(),
            layout.user_frame_bitmap(),
            layout.kernel_space_bitmap(),
        ]
        .iter()
        .map(|bitmap| self.machine.read_bytes(bitmap.address(), bitmap.bytes() as usize))
        .collect();
        if let Some(process) = self.scheduler.process.borrow().as_ref() {
            maps.push(process.space().bitmap().as_bytes().to_vec());
        }
        maps
    }

    /// Tears the running process down completely.
    pub fn exit(&self) {
        let mut process = self.scheduler.take().expect("no process running");
        self.mm.release_user_space(&mut process);
        self.machine.activate(boot_directory());
        self.mm.destroy_process_memory(process);
    }
}

pub const fn boot_directory() -> PhysicalAddress {
    PhysicalAddress::new(PAGE_DIRECTORY_PHYS)
}

/// Layout with `frames_per_pool` frames in each pool.
pub fn layout(frames_per_pool: u32) -> MemoryLayout {
    LayoutConfig::new(BOOT_RESERVED_BYTES + 2 * frames_per_pool * PAGE_SIZE)
        .with_user_space_end(USER_SPACE_END)
        .build()
        .expect("valid layout")
}

/// Boots a simulated machine with `frames_per_pool` frames in each pool and
/// runs `test` against a fresh memory manager.
pub fn run(frames_per_pool: u32, test: impl for<'m> FnOnce(&Harness<'m>)) {
    let layout = layout(frames_per_pool);
    let machine = SimulatedMachine::boot(layout.total_memory());
    let scheduler = TestScheduler::new();
    let mm = unsafe { MemoryManager::new(layout, &machine, &machine, &scheduler) };
    test(&Harness {
        machine: &machine,
        scheduler: &scheduler,
        mm,
    });
}
