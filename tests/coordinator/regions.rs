use std::sync::Arc;

use futures::future::join_all;
use meshreduce::{DeviceRuntime, HostRuntime, LoopbackGroup, ProcessGroup, SharedRegion};

/// A value written into rank r's local slot is readable by every rank
/// through its own copy of `ptrs[r]` once the creation exchange completes.
#[tokio::test]
async fn test_symmetric_region_roundtrip() {
    let runtime = Arc::new(HostRuntime::new());
    let groups = LoopbackGroup::bootstrap(4);

    join_all(groups.iter().map(|group| {
        let runtime: Arc<dyn DeviceRuntime> = runtime.clone();
        async move {
            let rank = group.rank();
            let region = SharedRegion::create(runtime, group, 64).await.unwrap();

            // Stamp this rank's slot with a rank-derived marker.
            unsafe {
                std::ptr::write(region.local_ptr() as *mut u8, 0xA0 + rank as u8);
            }
            group.barrier().await.unwrap();

            for (peer, &ptr) in region.ptrs().iter().enumerate() {
                let marker = unsafe { std::ptr::read(ptr as *const u8) };
                assert_eq!(marker, 0xA0 + peer as u8, "rank {rank} reading slot {peer}");
            }

            // Nobody tears down while a peer is still reading.
            group.barrier().await.unwrap();
        }
    }))
    .await;

    assert_eq!(runtime.live_allocations(), 0);
}

#[tokio::test]
async fn test_freed_region_pointers_are_tracked_as_dead() {
    let runtime = Arc::new(HostRuntime::new());
    let groups = LoopbackGroup::bootstrap(2);

    let local_ptrs = join_all(groups.iter().map(|group| {
        let runtime: Arc<dyn DeviceRuntime> = runtime.clone();
        async move {
            let mut region = SharedRegion::create(runtime, group, 128).await.unwrap();
            group.barrier().await.unwrap();
            let ptr = region.local_ptr();
            region.free().unwrap();
            ptr
        }
    }))
    .await;

    // Poison-on-free tracking: any later dereference of these addresses
    // is a caught bug, not undefined behavior on real hardware.
    for ptr in local_ptrs {
        assert!(runtime.was_freed(ptr));
    }
    assert_eq!(runtime.live_allocations(), 0);
}

#[tokio::test]
async fn test_exchange_must_run_in_identical_order() {
    // Two regions created back-to-back pair up by call order: the first
    // call's table never contains the second call's pointers.
    let runtime = Arc::new(HostRuntime::new());
    let groups = LoopbackGroup::bootstrap(2);

    join_all(groups.iter().map(|group| {
        let runtime: Arc<dyn DeviceRuntime> = runtime.clone();
        async move {
            let first = SharedRegion::create(runtime.clone(), group, 64).await.unwrap();
            let second = SharedRegion::create(runtime, group, 64).await.unwrap();
            for ptr in second.ptrs() {
                assert!(!first.ptrs().contains(ptr));
            }
            group.barrier().await.unwrap();
        }
    }))
    .await;
}
