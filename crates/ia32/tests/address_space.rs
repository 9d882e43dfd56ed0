use core::alloc::{GlobalAlloc as _, Layout};

use allocator::{
    Allocator as _, PhysicalAllocator as _, Range,
    heap::Heap,
    split::{LowMemory, SplitAllocator},
};
use ia32::{Access, PAGE_SIZE, Paging, PagingError, PhysAddr, Region, SoftTlb, TlbFlush};

const LOW: usize = 0x0010_0000;
const LOW_PAGES: usize = 64;
const HIGH_PAGES: usize = 256;

#[repr(C, align(4096))]
struct Frame([u8; PAGE_SIZE]);

fn memory() -> Vec<Frame> {
    (0..LOW_PAGES).map(|_| Frame([0; PAGE_SIZE])).collect()
}

fn physical(memory: &mut [Frame]) -> spin::Mutex<SplitAllocator> {
    spin::Mutex::new(SplitAllocator::new(
        Range::new(LOW, LOW_PAGES * PAGE_SIZE, 0),
        Range::new(LOW + LOW_PAGES * PAGE_SIZE, HIGH_PAGES * PAGE_SIZE, 0),
        PAGE_SIZE,
        memory.as_mut_ptr().expose_provenance(),
    ))
}

fn high_frames(physical: &spin::Mutex<SplitAllocator>, count: usize) -> Vec<PhysAddr> {
    (0..count)
        .map(|_| {
            let frame = physical
                .lock()
                .allocate_high(Range::any(PAGE_SIZE, 0))
                .unwrap();
            PhysAddr::from_usize(frame.address).unwrap()
        })
        .collect()
}

const USER_RW: Access = Access::PRESENT.union(Access::URW);

#[test]
fn process_lifecycle() {
    let mut memory = memory();
    let physical = physical(&mut memory);
    let heap = Heap::new(LowMemory::new(&physical));
    let mut paging = Paging::bootstrap(&physical, SoftTlb::new()).unwrap();
    let initial = physical.lock().available();

    // Kernel objects and page tables come from the same low memory.
    let layout = Layout::from_size_align(96, 8).unwrap();
    let object = unsafe { heap.alloc(layout) };
    assert!(!object.is_null());

    let space = paging.create_address_space().unwrap();
    let stack = high_frames(&physical, 4);
    let data = high_frames(&physical, 2);
    let mut remote = paging.remote(space);
    for (index, frame) in stack.iter().enumerate() {
        let virt = Region::UserStack
            .base()
            .checked_add(index * PAGE_SIZE)
            .unwrap();
        remote.map(*frame, Some(virt), USER_RW).unwrap();
    }
    let argument = remote.map(data[0], None, USER_RW).unwrap();
    assert!(Region::UserPrivate.contains(argument));
    remote
        .map(
            data[1],
            Some(Region::UserData.base()),
            Access::PRESENT | Access::READABLE | Access::USER,
        )
        .unwrap();

    let stack_base = Region::UserStack.base();
    assert!(remote.access(stack_base, 4 * PAGE_SIZE, Access::WRITABLE | Access::USER));
    assert!(!remote.access(stack_base, 5 * PAGE_SIZE, Access::USER));
    assert!(!remote.access(Region::UserData.base(), 1, Access::WRITABLE));
    assert!(remote.access(Region::UserData.base(), 1, Access::USER));

    // The running address space never sees the process's pages.
    assert_eq!(paging.lookup(stack_base), None);

    assert_eq!(paging.destroy_address_space(space).unwrap(), 6);
    assert_eq!(paging.remote_target(), None);

    unsafe { heap.dealloc(object, layout) };
    assert_eq!(physical.lock().available(), initial);
}

#[test]
fn switching_targets_flushes_everything() {
    let mut memory = memory();
    let physical = physical(&mut memory);
    let mut paging = Paging::bootstrap(&physical, SoftTlb::new()).unwrap();
    let spaces: Vec<_> = (0..3)
        .map(|_| paging.create_address_space().unwrap())
        .collect();
    let frames = high_frames(&physical, 3);
    let virt = Region::UserHeap.base();

    for (space, frame) in spaces.iter().zip(&frames) {
        paging.remote(*space).map(*frame, Some(virt), USER_RW).unwrap();
    }
    paging.tlb_mut().clear();

    for _ in 0..2 {
        for (space, frame) in spaces.iter().zip(&frames) {
            assert_eq!(paging.remote(*space).lookup(virt), Some(*frame));
        }
    }
    assert_eq!(paging.tlb().flushes(), [TlbFlush::All; 6]);

    for space in spaces {
        paging.destroy_address_space(space).unwrap();
    }
}

#[test]
fn out_of_memory_is_reported_not_fatal() {
    let mut memory = memory();
    let physical = physical(&mut memory);
    let mut paging = Paging::bootstrap(&physical, SoftTlb::new()).unwrap();
    let frame = high_frames(&physical, 1)[0];

    let mut reserved = Vec::new();
    while let Ok(granted) = (&physical).allocate_low(Range::any(PAGE_SIZE, 0)) {
        reserved.push(granted.address);
    }

    let err = paging.create_address_space().unwrap_err();
    assert!(err.is_out_of_memory());
    assert!(matches!(err, PagingError::AllocDirectory { .. }));

    let virt = Region::KernelPrivate.base();
    let err = paging.map(frame, Some(virt), Access::PRESENT).unwrap_err();
    assert!(err.is_out_of_memory());
    assert_eq!(paging.lookup(virt), None);

    // Once memory is back the same request succeeds.
    physical.lock().release(reserved[0]).unwrap();
    assert_eq!(
        paging.map(frame, Some(virt), Access::PRESENT).unwrap(),
        virt
    );
    assert_eq!(paging.lookup(virt), Some(frame));
}
