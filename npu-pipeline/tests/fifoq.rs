// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

use std::cell::RefCell;
use std::rc::Rc;

use npu_engine::run_simulation;
use npu_engine::test_helpers::start_test;
use npu_engine::time::timeout::Timeout;
use npu_pipeline::error::QueueError;
use npu_pipeline::fifoq::{ConfigureOutcome, FifoQueueManager, FifoqConfig};

fn config(image_count: usize) -> FifoqConfig {
    FifoqConfig {
        image_count,
        image_size: 64,
        result_count: 2,
        result_size: 64,
    }
}

/// Buffers of one job arrive out of order and come out as one job in index
/// order.
#[test]
fn buffers_are_aggregated_in_index_order() {
    let mut engine = start_test(file!());
    let clock = engine.default_clock();
    let fifoq = FifoQueueManager::new_and_register(&engine, &clock, engine.top());
    assert_eq!(fifoq.configure(config(4)), ConfigureOutcome::Allocated);

    let seen = Rc::new(RefCell::new(Vec::new()));
    {
        let fifoq = fifoq.clone();
        let seen = seen.clone();
        engine.spawn(async move {
            for index in [2usize, 0, 1] {
                let mut buffer = fifoq.image_get_free_buffer(Timeout::Immediate, false).await?;
                buffer.fill_from(&[index as u8]);
                fifoq
                    .image_enqueue(3, index, buffer, Timeout::Immediate, false)
                    .await
                    .map_err(|r| r.error)?;
            }
            let job = fifoq.image_dequeue(Timeout::Forever).await?;
            seen.borrow_mut().extend(job.iter().map(|b| b.bytes()[0]));
            fifoq.image_release(job).await;
            Ok(())
        });
    }

    run_simulation!(engine);

    assert_eq!(*seen.borrow(), vec![0, 1, 2]);
    let status = fifoq.status().unwrap();
    assert_eq!(status.image_free, 4);
    assert_eq!(status.image_data, 0);
}

/// A second buffer for the same index replaces the first, which is returned
/// to the free queue rather than lost.
#[test]
fn repeated_index_replaces_the_buffer() {
    let mut engine = start_test(file!());
    let clock = engine.default_clock();
    let fifoq = FifoQueueManager::new_and_register(&engine, &clock, engine.top());
    fifoq.configure(config(3));

    let seen = Rc::new(RefCell::new(Vec::new()));
    {
        let fifoq = fifoq.clone();
        let seen = seen.clone();
        let clock = clock.clone();
        engine.spawn(async move {
            for (index, tag) in [(0usize, 1u8), (0, 2), (1, 3)] {
                let mut buffer = fifoq.image_get_free_buffer(Timeout::Forever, false).await?;
                buffer.fill_from(&[tag]);
                fifoq
                    .image_enqueue(2, index, buffer, Timeout::Forever, false)
                    .await
                    .map_err(|r| r.error)?;
                clock.wait_ticks(1).await;
            }
            let job = fifoq.image_dequeue(Timeout::Forever).await?;
            seen.borrow_mut().extend(job.iter().map(|b| b.bytes()[0]));
            fifoq.image_release(job).await;
            Ok(())
        });
    }

    run_simulation!(engine);

    assert_eq!(*seen.borrow(), vec![2, 3]);
    assert_eq!(fifoq.status().unwrap().image_free, 3);
}

/// With no free buffer, a forced grab sacrifices the oldest complete job
/// and leaves the newer one queued.
#[test]
fn force_grab_drops_the_oldest_job() {
    let mut engine = start_test(file!());
    let clock = engine.default_clock();
    let fifoq = FifoQueueManager::new_and_register(&engine, &clock, engine.top());
    fifoq.configure(config(2));

    let seen = Rc::new(RefCell::new(Vec::new()));
    {
        let fifoq = fifoq.clone();
        let seen = seen.clone();
        let clock = clock.clone();
        engine.spawn(async move {
            for tag in [b'A', b'B'] {
                let mut buffer = fifoq.image_get_free_buffer(Timeout::Immediate, false).await?;
                buffer.fill_from(&[tag]);
                fifoq
                    .image_enqueue(1, 0, buffer, Timeout::Immediate, false)
                    .await
                    .map_err(|r| r.error)?;
            }
            clock.wait_ticks(1).await;

            let missing = fifoq.image_get_free_buffer(Timeout::Immediate, false).await;
            assert_eq!(missing.err(), Some(QueueError::ResourceExhausted));

            let grabbed = fifoq.image_get_free_buffer(Timeout::Forever, true).await?;
            seen.borrow_mut().push(grabbed.bytes()[0]);
            assert_eq!(fifoq.status().unwrap().image_data, 1);

            let job = fifoq.image_dequeue(Timeout::Immediate).await?;
            seen.borrow_mut().push(job.get(0).unwrap().bytes()[0]);
            fifoq.image_release(job).await;
            fifoq
                .image_put_free_buffer(grabbed, Timeout::Immediate)
                .await
                .map_err(|r| r.error)?;
            Ok(())
        });
    }

    run_simulation!(engine);

    assert_eq!(*seen.borrow(), vec![b'A', b'B']);
    assert_eq!(fifoq.status().unwrap().image_free, 2);
}

/// Cleaning abandons a partly collected job; a job sent afterwards is
/// collected from scratch.
#[test]
fn clean_abandons_partial_jobs() {
    let mut engine = start_test(file!());
    let clock = engine.default_clock();
    let fifoq = FifoQueueManager::new_and_register(&engine, &clock, engine.top());
    fifoq.configure(config(3));

    let seen = Rc::new(RefCell::new(Vec::new()));
    {
        let fifoq = fifoq.clone();
        let seen = seen.clone();
        let clock = clock.clone();
        engine.spawn(async move {
            let mut stale = fifoq.image_get_free_buffer(Timeout::Immediate, false).await?;
            stale.fill_from(&[0xEE]);
            fifoq
                .image_enqueue(2, 0, stale, Timeout::Immediate, false)
                .await
                .map_err(|r| r.error)?;
            clock.wait_ticks(1).await;
            fifoq.clean_queues();

            for (index, tag) in [(0usize, 10u8), (1, 11)] {
                let mut buffer = fifoq.image_get_free_buffer(Timeout::Forever, false).await?;
                buffer.fill_from(&[tag]);
                fifoq
                    .image_enqueue(2, index, buffer, Timeout::Forever, false)
                    .await
                    .map_err(|r| r.error)?;
                clock.wait_ticks(1).await;
            }
            let job = fifoq.image_dequeue(Timeout::Forever).await?;
            seen.borrow_mut().extend(job.iter().map(|b| b.bytes()[0]));
            fifoq.image_release(job).await;
            Ok(())
        });
    }

    run_simulation!(engine);

    assert_eq!(*seen.borrow(), vec![10, 11]);
    assert_eq!(fifoq.status().unwrap().image_free, 3);
}

/// Indices outside the job, and jobs larger than the pool, are refused and
/// the buffer handed back.
#[test]
fn invalid_indices_are_refused() {
    let mut engine = start_test(file!());
    let clock = engine.default_clock();
    let fifoq = FifoQueueManager::new_and_register(&engine, &clock, engine.top());

    {
        let fifoq = fifoq.clone();
        engine.spawn(async move {
            let unconfigured = fifoq.image_get_free_buffer(Timeout::Immediate, false).await;
            assert_eq!(unconfigured.err(), Some(QueueError::InvalidParameter));

            fifoq.configure(config(2));
            let buffer = fifoq.image_get_free_buffer(Timeout::Immediate, false).await?;
            let rejected = fifoq
                .image_enqueue(2, 2, buffer, Timeout::Immediate, false)
                .await
                .unwrap_err();
            assert_eq!(rejected.error, QueueError::InvalidParameter);

            let rejected = fifoq
                .image_enqueue(3, 0, rejected.item, Timeout::Immediate, false)
                .await
                .unwrap_err();
            assert_eq!(rejected.error, QueueError::InvalidParameter);

            fifoq
                .image_put_free_buffer(rejected.item, Timeout::Immediate)
                .await
                .map_err(|r| r.error)?;
            Ok(())
        });
    }

    run_simulation!(engine);

    assert_eq!(fifoq.configure(config(2)), ConfigureOutcome::AlreadyConfigured);
    assert_eq!(fifoq.status().unwrap().image_free, 2);
}
