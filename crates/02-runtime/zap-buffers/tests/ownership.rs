use std::sync::Arc;

use proptest::collection;
use proptest::prelude::*;
use zap_buffers::{
    BufferError, BufferRegistry, Executor, NativeExecutor, OwnershipKind,
};
use zerde::{BufferDescriptor, ElementType, Ownership};

fn setup() -> (Arc<NativeExecutor>, BufferRegistry) {
    let exec = Arc::new(NativeExecutor::new(1 << 16).expect("executor"));
    let registry = BufferRegistry::new(exec.clone());
    (exec, registry)
}

#[test]
fn explicit_bounds_outside_region_fail() {
    let (_exec, registry) = setup();
    let mut buffer = registry
        .wrap_exclusive(BufferDescriptor {
            base_pointer: 10,
            byte_length: 4,
            element_type: ElementType::U8,
            ownership: Ownership::Exclusive { capacity: 4 },
        })
        .expect("wrap");

    assert_eq!(buffer.view::<u8>(None, None).expect("whole").len(), 4);
    let exact = buffer.view::<u8>(Some(10), Some(4)).expect("exact span");
    assert_eq!(exact.byte_offset(), 10);
    assert_eq!(exact.byte_length(), 4);
    assert_eq!(exact.len(), 4);
    drop(exact);
    assert_eq!(buffer.view::<u8>(Some(12), Some(2)).expect("tail").len(), 2);

    let before = buffer.view::<u8>(Some(9), Some(1)).unwrap_err();
    assert_eq!(
        before,
        BufferError::OutOfBounds {
            byte_offset: 9,
            byte_length: 1,
            base: 10,
            len: 4
        }
    );
    let message = before.to_string();
    assert!(message.contains("offset 9"), "{message}");
    assert!(message.contains("length 1"), "{message}");

    assert!(matches!(
        buffer.view::<u8>(Some(10), Some(5)),
        Err(BufferError::OutOfBounds {
            byte_offset: 10,
            byte_length: 5,
            ..
        })
    ));
    assert!(buffer.view::<u8>(Some(14), Some(1)).is_err());

    // Never allocated by the executor; keep it from being freed.
    buffer.unregister().expect("unregister");
}

#[test]
fn shared_region_is_freed_exactly_once() {
    let (exec, registry) = setup();
    let shared = registry.alloc_shared(&[1.0f32, 2.0, 3.0]).expect("alloc");
    let ref_id = shared.ref_id();
    assert_eq!(exec.shared_count(ref_id), Some(1));

    // Two round trips across the boundary hand back two extra references,
    // which re-wrapping returns to the owner.
    let first = shared.transfer().expect("transfer");
    let second = shared.transfer().expect("transfer");
    assert_eq!(exec.shared_count(ref_id), Some(3));
    let again = registry.wrap_shared(first).expect("rewrap");
    let third = registry.wrap(second).expect("rewrap").into_shared().expect("shared");
    assert!(shared.same_handle(&again));
    assert!(again.same_handle(&third));
    assert_eq!(exec.shared_count(ref_id), Some(1));

    let copy = shared.clone();
    drop(shared);
    drop(again);
    drop(third);
    assert_eq!(exec.shared_count(ref_id), Some(1));
    assert_eq!(copy.view::<f32>(None, None).expect("view").to_vec(), vec![1.0, 2.0, 3.0]);
    drop(copy);

    assert_eq!(exec.shared_count(ref_id), None);
    assert_eq!(exec.live_allocations(), 0);
    assert_eq!(registry.live_shared(), 0);
}

#[test]
fn shared_rewrap_after_last_drop_gets_fresh_handle() {
    let (exec, registry) = setup();
    let shared = registry.alloc_shared(&[7u32; 4]).expect("alloc");
    let descriptor = shared.transfer().expect("transfer");
    drop(shared);
    assert_eq!(exec.shared_count(descriptor_ref(&descriptor)), Some(1));

    let rewrapped = registry.wrap_shared(descriptor).expect("wrap");
    assert_eq!(rewrapped.view::<u32>(None, None).expect("view")[3], 7);
    drop(rewrapped);
    assert_eq!(exec.live_allocations(), 0);
}

fn descriptor_ref(descriptor: &BufferDescriptor) -> u32 {
    match descriptor.ownership {
        Ownership::Shared { ref_id } => ref_id,
        Ownership::Exclusive { .. } => panic!("not shared"),
    }
}

#[test]
fn exclusive_use_after_transfer_is_a_violation() {
    let (exec, registry) = setup();
    let mut buffer = registry.alloc_exclusive(&[1u8, 2, 3, 4]).expect("alloc");
    buffer.view_mut::<u8>(None, None).expect("view")[0] = 9;

    let descriptor = buffer.transfer().expect("transfer");
    let err = buffer.view::<u8>(None, None).unwrap_err();
    assert!(err.is_ownership_violation());
    assert_eq!(
        err,
        BufferError::UseAfterTransfer {
            base_pointer: descriptor.base_pointer
        }
    );
    assert!(buffer.transfer().is_err());
    drop(buffer);
    assert_eq!(exec.live_allocations(), 1);

    let received = registry.wrap(descriptor).expect("wrap");
    assert_eq!(received.kind(), OwnershipKind::Exclusive);
    assert_eq!(&*received.view::<u8>(None, None).expect("view"), &[9, 2, 3, 4]);
    drop(received);
    assert_eq!(exec.live_allocations(), 0);
}

#[test]
fn check_type_requires_full_typed_extent() {
    let (_exec, registry) = setup();
    let buffer = registry.alloc_exclusive(&[0u8; 8]).expect("alloc");
    let view = buffer.view::<u8>(None, None).expect("view");
    view.check_type(OwnershipKind::Exclusive).expect("full view");
    assert!(matches!(
        view.check_type(OwnershipKind::Shared),
        Err(BufferError::OwnershipMismatch { .. })
    ));

    let words = view.reinterpret::<u32>().expect("reinterpret");
    assert_eq!(words.len(), 2);
    assert!(matches!(
        words.check_type(OwnershipKind::Exclusive),
        Err(BufferError::TypeMismatch { .. })
    ));

    let base = buffer.descriptor().base_pointer;
    let partial = buffer.view::<u8>(Some(base + 2), None).expect("partial");
    assert!(matches!(
        partial.check_type(OwnershipKind::Exclusive),
        Err(BufferError::ExtentMismatch { .. })
    ));
}

#[test]
fn descriptors_outside_memory_are_rejected() {
    let (exec, registry) = setup();
    let size = exec.memory().size() as u32;
    let result = registry.wrap_exclusive(BufferDescriptor {
        base_pointer: size - 4,
        byte_length: 8,
        element_type: ElementType::U8,
        ownership: Ownership::Exclusive { capacity: 8 },
    });
    assert!(matches!(result, Err(BufferError::Transport(_))));
}

proptest! {
    /// Live allocations never overlap and all of them come back on free.
    #[test]
    fn allocations_never_overlap(sizes in collection::vec(1u32..512, 1..64), free_mask in any::<u64>()) {
        let exec = NativeExecutor::new(1 << 16).expect("executor");
        let mut live: Vec<(u32, u32)> = Vec::new();
        for (idx, size) in sizes.iter().enumerate() {
            let ptr = exec.alloc(*size).expect("alloc");
            prop_assert!(ptr != 0);
            for (other, other_size) in &live {
                prop_assert!(ptr + size <= *other || other + other_size <= ptr);
            }
            live.push((ptr, *size));
            if free_mask & (1 << (idx % 64)) != 0 {
                let (freed, _) = live.remove(live.len() / 2);
                exec.dealloc(freed).expect("free");
            }
        }
        for (ptr, _) in live {
            exec.dealloc(ptr).expect("free");
        }
        prop_assert_eq!(exec.live_allocations(), 0);
    }
}
