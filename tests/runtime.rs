use std::{sync::Arc, thread, time::Duration};

use scoria::{
    hal::{Driver, soft::{LiveObjects, SoftDriver}},
    prelude::*,
};

fn runtime() -> (Arc<SoftDriver>, Runtime) {
    let driver = Arc::new(SoftDriver::new());
    let runtime = Runtime::init_shared(driver.clone(), RuntimeConfig::default()).unwrap();
    (driver, runtime)
}

#[test]
fn contexts_on_many_threads() {
    let (driver, runtime) = runtime();
    let dst = driver.create_buffer(MemoryKind::Scratch, 8 * 64).unwrap().handle;

    let fences: Vec<FenceValue> = thread::scope(|s| {
        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let runtime = &runtime;
                s.spawn(move || {
                    let mut fences = Vec::new();
                    for round in 0..4u8 {
                        let kind = QueueKind::ALL[(i as usize + round as usize) % 3];
                        let mut ctx = runtime.begin_named(kind, "worker").unwrap();
                        ctx.write_buffer(dst, i as u64 * 64, &[i; 64]).unwrap();
                        if kind == QueueKind::Compute {
                            ctx.dispatch(1, 1, 1).unwrap();
                        }
                        fences.push(ctx.finish(false).unwrap());
                    }
                    fences
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect()
    });

    for fence in &fences {
        runtime.wait_for_fence(*fence).unwrap();
    }
    for i in 0..8u8 {
        assert_eq!(driver.read_buffer(dst, i as u64 * 64, 64), vec![i; 64]);
    }
    assert!(runtime.stats().contexts <= 8 * 3);

    driver.destroy_buffer(dst);
    runtime.shutdown().unwrap();
    assert_eq!(driver.live_objects(), LiveObjects::default());
}

#[test]
fn fences_of_one_queue_increase() {
    let (_driver, runtime) = runtime();
    let mut previous = None;
    for _ in 0..5 {
        let ctx = runtime.begin(QueueKind::Graphics).unwrap();
        let fence = ctx.finish(false).unwrap();
        assert_eq!(fence.kind(), QueueKind::Graphics);
        if let Some(previous) = previous {
            assert!(fence > previous);
        }
        previous = Some(fence);
    }
    runtime.idle_gpu().unwrap();
    assert!(runtime.is_fence_complete(previous.unwrap()));
}

#[test]
fn compute_waits_for_copy_on_the_gpu() {
    let (driver, runtime) = runtime();
    driver.pause(QueueKind::Copy);

    let mut upload = runtime.begin(QueueKind::Copy).unwrap();
    let dst = driver.create_buffer(MemoryKind::Scratch, 16).unwrap().handle;
    upload.write_buffer_pod(dst, 0, &[7u32; 4]).unwrap();
    let uploaded = upload.finish(false).unwrap();

    let queues = runtime.queues();
    queues
        .get(QueueKind::Compute)
        .stall_on(queues.get(QueueKind::Copy), uploaded)
        .unwrap();
    let mut consume = runtime.begin(QueueKind::Compute).unwrap();
    consume.dispatch(4, 1, 1).unwrap();
    let consumed = consume.finish(false).unwrap();

    thread::sleep(Duration::from_millis(20));
    assert!(!runtime.is_fence_complete(consumed));
    assert_eq!(driver.stats().dispatches, 0);

    driver.resume(QueueKind::Copy);
    runtime.wait_for_fence(consumed).unwrap();
    assert!(runtime.is_fence_complete(uploaded));
    assert_eq!(driver.read_buffer(dst, 0, 4), 7u32.to_ne_bytes().to_vec());
}

#[test]
fn transient_memory_is_not_reused_early() {
    let driver = Arc::new(SoftDriver::new());
    let runtime = Runtime::init_shared(
        driver.clone(),
        RuntimeConfig {
            upload_page_size: 4096,
            ..Default::default()
        },
    )
    .unwrap();
    driver.pause(QueueKind::Graphics);

    let mut first = runtime.begin(QueueKind::Graphics).unwrap();
    let first_buffer = first.allocate_upload(4096, 256).unwrap().buffer();
    first.finish(false).unwrap();

    let mut second = runtime.begin(QueueKind::Graphics).unwrap();
    let second_buffer = second.allocate_upload(4096, 256).unwrap().buffer();
    assert_ne!(first_buffer, second_buffer);
    assert_eq!(runtime.stats().upload_pages.created, 2);
    assert_eq!(runtime.stats().recording_buffers[QueueKind::Graphics.index()], 2);
    let fence = second.finish(false).unwrap();

    driver.resume(QueueKind::Graphics);
    runtime.wait_for_fence(fence).unwrap();

    let mut third = runtime.begin(QueueKind::Graphics).unwrap();
    let third_buffer = third.allocate_upload(4096, 256).unwrap().buffer();
    assert!(third_buffer == first_buffer || third_buffer == second_buffer);
    third.finish(true).unwrap();
    assert_eq!(runtime.stats().upload_pages.created, 2);
}

#[test]
fn views_survive_a_mid_frame_flush() {
    let (driver, runtime) = runtime();
    let texture = ViewDesc::SampledTexture {
        view: scoria::hal::RawResource(42),
    };
    let view = runtime.alloc_views(ViewTableKind::Resource, 1).unwrap();
    runtime.write_view(view, &texture);

    let layout = BindingLayout::new([SlotDesc::Table {
        kind: ViewTableKind::Resource,
        size: 1,
    }]);
    let mut ctx = runtime.begin(QueueKind::Graphics).unwrap();
    ctx.set_pipeline(BindPoint::Graphics, scoria::hal::RawResource(7), &layout);
    ctx.set_dynamic_views(BindPoint::Graphics, 0, 0, &[view]);
    ctx.draw(3, 1, 0, 0).unwrap();
    ctx.flush(false).unwrap();
    ctx.draw(3, 1, 0, 0).unwrap();

    let bound = ctx
        .bound_views(ViewTableKind::Resource, BindPoint::Graphics, 0)
        .unwrap();
    assert_eq!(driver.read_view(bound.table, bound.offset), texture);
    ctx.finish(true).unwrap();

    let stats = driver.stats();
    assert_eq!(stats.draws, 2);
    assert_eq!(stats.pipeline_binds, 2);
    assert_eq!(stats.table_binds, 2);
}

#[test]
fn kept_upload_does_not_grow_the_pool() {
    let config = RuntimeConfig {
        upload_page_size: 256,
        ..Default::default()
    };
    let runtime = Runtime::init(SoftDriver::new(), config).unwrap();

    let mut ctx = runtime.begin(QueueKind::Graphics).unwrap();
    let kept = ctx.allocate_upload(16, 16).unwrap();
    ctx.finish(true).unwrap();

    for _ in 0..20 {
        let mut ctx = runtime.begin(QueueKind::Graphics).unwrap();
        ctx.allocate_upload(256, 16).unwrap();
        ctx.finish(true).unwrap();
    }
    let stats = runtime.stats().upload_pages;
    assert!(stats.created <= 3, "{stats:?}");
    drop(kept);
}
