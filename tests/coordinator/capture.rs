use std::sync::Arc;

use meshreduce::{
    DataType, DeviceRuntime, DeviceTensor, GraphBufferMeta, MeshReduceConfig, ProcessGroup,
};

use super::helpers::MeshHarness;

#[tokio::test]
async fn test_capture_session_records_real_and_warmup_calls() {
    let harness = MeshHarness::new(2);
    for (rank, engine) in harness.engines.iter().enumerate() {
        engine.set_meta(GraphBufferMeta {
            handle: vec![rank as u8; 4],
            offsets: vec![0, 128],
        });
    }
    harness
        .run(|ctx| async move {
            let engine = ctx.engine.clone();
            let host = ctx.runtime.clone();
            let runtime: Arc<dyn DeviceRuntime> = ctx.runtime.clone();
            let coordinator = ctx.build(MeshReduceConfig::default()).await;
            let input = DeviceTensor::alloc(&runtime, 256, DataType::F32).unwrap();

            let guard = coordinator.begin_capture();
            assert!(coordinator.is_capturing());

            // The backend is actively recording: the real path runs so the
            // graph sees true addresses.
            host.set_stream_capturing(true);
            coordinator.group().barrier().await.unwrap();
            let recorded = coordinator.all_reduce(&input.view(), None).unwrap();
            assert!(recorded.is_some());
            assert_eq!(engine.reduce_count(), 1);
            coordinator.group().barrier().await.unwrap();

            // Warm-up: same allocation footprint, engine untouched.
            host.set_stream_capturing(false);
            let placeholder = coordinator
                .all_reduce(&input.view(), None)
                .unwrap()
                .expect("warm-up must still be handled");
            assert_eq!(placeholder.numel(), input.numel());
            assert_eq!(placeholder.dtype(), input.dtype());
            assert_eq!(engine.reduce_count(), 1);

            guard.finish().await.unwrap();
            assert!(!coordinator.is_capturing());

            coordinator.group().barrier().await.unwrap();
        })
        .await;

    // Exactly one registration pass per rank, with one row per rank in
    // ascending rank order.
    for engine in &harness.engines {
        let register_calls = engine.register_calls();
        assert_eq!(register_calls.len(), 1);
        let (handles, offsets) = &register_calls[0];
        assert_eq!(handles.len(), 2);
        assert_eq!(handles[0], vec![0u8; 4]);
        assert_eq!(handles[1], vec![1u8; 4]);
        assert_eq!(offsets[0], vec![0, 128]);
        assert_eq!(offsets[1], vec![0, 128]);
    }
}

#[tokio::test]
async fn test_dropped_guard_skips_registration() {
    let harness = MeshHarness::new(2);
    harness
        .run(|ctx| async move {
            let engine = ctx.engine.clone();
            let runtime: Arc<dyn DeviceRuntime> = ctx.runtime.clone();
            let coordinator = ctx.build(MeshReduceConfig::default()).await;

            {
                let _guard = coordinator.begin_capture();
                assert!(coordinator.is_capturing());
            }
            // Error-exit path: the flag is cleared, nothing was registered.
            assert!(!coordinator.is_capturing());
            assert!(engine.register_calls().is_empty());

            // Steady-state dispatch still works afterward.
            let input = DeviceTensor::alloc(&runtime, 64, DataType::F32).unwrap();
            assert!(coordinator.all_reduce(&input.view(), None).unwrap().is_some());
            assert_eq!(engine.reduce_count(), 1);

            coordinator.group().barrier().await.unwrap();
        })
        .await;
}

#[tokio::test]
async fn test_disabled_coordinator_skips_registration_pass() {
    let harness = MeshHarness::new(3);
    harness
        .run(|ctx| async move {
            let engine = ctx.engine.clone();
            let coordinator = ctx.build(MeshReduceConfig::default()).await;
            assert!(coordinator.is_disabled());

            let guard = coordinator.begin_capture();
            guard.finish().await.unwrap();
            assert!(engine.register_calls().is_empty());
        })
        .await;
}

#[tokio::test]
async fn test_each_session_registers_from_scratch() {
    let harness = MeshHarness::new(2);
    harness
        .run(|ctx| async move {
            let engine = ctx.engine.clone();
            let coordinator = ctx.build(MeshReduceConfig::default()).await;

            coordinator.begin_capture().finish().await.unwrap();
            coordinator.begin_capture().finish().await.unwrap();

            assert_eq!(engine.register_calls().len(), 2);
            coordinator.group().barrier().await.unwrap();
        })
        .await;
}
