// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

use std::cell::Cell;
use std::rc::Rc;

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use npu_engine::engine::Engine;
use npu_engine::time::timeout::Timeout;
use npu_pipeline::buffer::{BufferObject, PoolEntry};
use npu_pipeline::buffer_pool::BufferPool;
use npu_pipeline::config::PipelineConfig;
use npu_pipeline::fifoq::FifoqConfig;
use npu_pipeline::framing::command::ModelInfo;
use npu_pipeline::pipeline::SimulatedSystem;
use npu_track::tracker::dev_null_tracker;

const NUM_JOBS: usize = 200;
const MODEL_ID: u32 = 3;

fn create_engine() -> Engine {
    // Create an engine without the tracker system opening files for logging
    let tracker = dev_null_tracker();
    Engine::new(&tracker)
}

fn run_engine(args: (Engine, Rc<Cell<usize>>)) {
    let (mut engine, done) = args;
    engine.run().unwrap();
    assert_eq!(done.get(), NUM_JOBS);
}

fn setup_pool_churn() -> (Engine, Rc<Cell<usize>>) {
    let engine = create_engine();
    let clock = engine.default_clock();
    let pool: Rc<BufferPool<BufferObject>> =
        Rc::new(BufferPool::new(&clock, engine.top(), "pool", 4, 1024));
    let done = Rc::new(Cell::new(0));

    {
        let pool = pool.clone();
        engine.spawn(async move {
            for _ in 0..NUM_JOBS {
                let buffer = pool.get_free(Timeout::Forever, false).await?;
                pool.enqueue_data(BufferObject::new(vec![buffer]), Timeout::Forever, false)
                    .await
                    .map_err(|r| r.error)?;
            }
            Ok(())
        });
    }
    {
        let done = done.clone();
        engine.spawn(async move {
            for _ in 0..NUM_JOBS {
                let job = pool.dequeue_data(Timeout::Forever).await?;
                for buffer in job.into_buffers() {
                    pool.put_free(buffer, Timeout::Forever)
                        .await
                        .map_err(|r| r.error)?;
                }
                done.set(done.get() + 1);
            }
            Ok(())
        });
    }

    (engine, done)
}

fn setup_bypass_jobs(parallel: bool) -> (Engine, Rc<Cell<usize>>) {
    let engine = create_engine();
    let config = PipelineConfig {
        parallel,
        ..PipelineConfig::default()
    };
    let system = SimulatedSystem::new_and_register(&engine, config).unwrap();
    system.device.install_models(vec![ModelInfo {
        model_id: MODEL_ID,
        input_count: 1,
        width: 8,
        height: 8,
        channels: 4,
        output_size: 64,
    }]);
    system.pipeline.ctx.fifoq.configure(FifoqConfig {
        image_count: 4,
        image_size: 10240,
        result_count: 4,
        result_size: 10240,
    });

    let done = Rc::new(Cell::new(0));
    {
        let host = system.host;
        let done = done.clone();
        engine.spawn(async move {
            host.connect();
            let image = [0x11; 256];
            for i in 0..NUM_JOBS {
                host.send_bypass(i as u32, MODEL_ID, &[&image[..]])?;
                host.next_result(Timeout::Forever).await?;
                done.set(done.get() + 1);
            }
            host.disconnect();
            Ok(())
        });
    }

    (engine, done)
}

fn bench_queues(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue");

    group.bench_function("pool_churn", |b| {
        b.iter_batched(setup_pool_churn, run_engine, BatchSize::SmallInput);
    });

    group.bench_function("bypass_blocking", |b| {
        b.iter_batched(|| setup_bypass_jobs(false), run_engine, BatchSize::SmallInput);
    });

    group.bench_function("bypass_parallel", |b| {
        b.iter_batched(|| setup_bypass_jobs(true), run_engine, BatchSize::SmallInput);
    });

    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default();
    targets = bench_queues
}
criterion_main!(benches);
