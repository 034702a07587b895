// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

use std::cell::RefCell;
use std::rc::Rc;

use npu_engine::run_simulation;
use npu_engine::test_helpers::start_test;
use npu_engine::time::timeout::Timeout;
use npu_pipeline::config::PipelineConfig;
use npu_pipeline::error::{ErrorCode, TransportError};
use npu_pipeline::fifoq::FifoqConfig;
use npu_pipeline::framing::command::{
    Command, ModelInfo, decode_model_table, decode_response, encode_model_table,
};
use npu_pipeline::framing::control::{ControlOpcode, ControlRequest};
use npu_pipeline::framing::header::{HeaderStamp, MagicType};
use npu_pipeline::framing::legacy::{LegacyCommandId, LegacyRequest, decode_reply};
use npu_pipeline::pipeline::SimulatedSystem;

const QUEUES: FifoqConfig = FifoqConfig {
    image_count: 2,
    image_size: 10240,
    result_count: 2,
    result_size: 10240,
};

fn reset() -> ControlRequest {
    ControlRequest::new(ControlOpcode::QueueReset, 0, 0)
}

/// The queues can be configured once; the configuration is reported back
/// by command.
#[test]
fn configure_queues_once() {
    let mut engine = start_test(file!());
    let system = SimulatedSystem::new_and_register(&engine, PipelineConfig::default()).unwrap();
    let fifoq = system.pipeline.ctx.fifoq.clone();

    let answers = Rc::new(RefCell::new(Vec::new()));
    let words = Rc::new(RefCell::new(Vec::new()));
    {
        let host = system.host;
        let answers = answers.clone();
        let words = words.clone();
        engine.spawn(async move {
            host.connect();
            let (code, before) = host.command(&Command::GetFifoqConfig, Timeout::Forever).await?;
            assert_eq!(code, ErrorCode::Success);
            assert_eq!(before, vec![0; 4]);

            answers.borrow_mut().push(host.configure_queues(&QUEUES).await?);
            let bigger = FifoqConfig {
                image_count: 4,
                ..QUEUES
            };
            answers.borrow_mut().push(host.configure_queues(&bigger).await?);

            let (_, after) = host.command(&Command::GetFifoqConfig, Timeout::Forever).await?;
            *words.borrow_mut() = after;
            Ok(())
        });
    }

    run_simulation!(engine);

    assert_eq!(*answers.borrow(), vec![true, false]);
    assert_eq!(*words.borrow(), vec![2, 10240, 2, 10240]);
    assert_eq!(fifoq.config(), Some(QUEUES));
}

/// Commands are served before the queues exist, in both framings.
#[test]
fn system_information() {
    let mut engine = start_test(file!());
    let config = PipelineConfig::default();
    let identity = config.firmware;
    let system = SimulatedSystem::new_and_register(&engine, config).unwrap();

    let replies = Rc::new(RefCell::new(None));
    {
        let host = system.host;
        let replies = replies.clone();
        engine.spawn(async move {
            host.connect();
            let info = host.command(&Command::GetSystemInfo, Timeout::Forever).await?;

            host.send_message(&LegacyRequest::GetKnNumber.encode())?;
            let legacy = host.receive(Timeout::Forever).await?;
            let legacy = decode_reply(&legacy).map_err(ErrorCode::from)?;

            *replies.borrow_mut() = Some((info, legacy));
            Ok(())
        });
    }

    run_simulation!(engine);

    let ((code, words), (cmd, kn_number, _)) = replies.borrow_mut().take().unwrap();
    assert_eq!(code, ErrorCode::Success);
    assert_eq!(words[0], identity.kn_number);
    assert_eq!(words[1..], identity.version().to_words());
    assert_eq!(cmd, LegacyCommandId::GetKnNumber.response());
    assert_eq!(kn_number, identity.kn_number);
}

/// A model table and its data follow a load command; the table is then
/// reported back.
#[test]
fn load_model_then_query() {
    let mut engine = start_test(file!());
    let system = SimulatedSystem::new_and_register(&engine, PipelineConfig::default()).unwrap();
    let device = system.device.clone();

    let model = ModelInfo {
        model_id: 19,
        input_count: 1,
        width: 64,
        height: 64,
        channels: 3,
        output_size: 128,
    };
    let table = Rc::new(RefCell::new(Vec::new()));
    {
        let host = system.host;
        let table = table.clone();
        engine.spawn(async move {
            host.connect();
            let load = Command::LoadModel {
                model_size: 4096,
                fw_info: encode_model_table(&[model]),
            };
            let (code, _) = host.command(&load, Timeout::Forever).await?;
            assert_eq!(code, ErrorCode::Success);
            host.send_message(&[0xA5; 4096])?;

            let query = Command::GetModelInfo { from_ddr: true };
            let (code, words) = host.command(&query, Timeout::Forever).await?;
            assert_eq!(code, ErrorCode::Success);
            let bytes = host.receive(Timeout::Forever).await?;
            assert_eq!(bytes.len(), words[0] as usize);
            *table.borrow_mut() = decode_model_table(&bytes).map_err(ErrorCode::from)?;
            Ok(())
        });
    }

    run_simulation!(engine);

    assert_eq!(*table.borrow(), vec![model]);
    assert_eq!(device.model_data_len(), 4096);
}

/// Data written to device memory reads back unchanged; addresses outside
/// DDR are refused.
#[test]
fn memory_write_then_read() {
    let mut engine = start_test(file!());
    let system = SimulatedSystem::new_and_register(&engine, PipelineConfig::default()).unwrap();

    let read_back = Rc::new(RefCell::new(Vec::new()));
    {
        let host = system.host;
        let read_back = read_back.clone();
        engine.spawn(async move {
            host.connect();
            let data: Vec<u8> = (0..32).collect();
            host.send_message(
                &Command::MemoryWrite {
                    start_address: 0x6100_0000,
                    length: 32,
                }
                .encode(),
            )?;
            host.send_message(&data)?;
            let reply = host.receive(Timeout::Forever).await?;
            let (code, _) = decode_response(&reply).map_err(ErrorCode::from)?;
            assert_eq!(code, ErrorCode::Success);

            let read = Command::MemoryRead {
                start_address: 0x6100_0000,
                length: 32,
            };
            let (code, _) = host.command(&read, Timeout::Forever).await?;
            assert_eq!(code, ErrorCode::Success);
            *read_back.borrow_mut() = host.receive(Timeout::Forever).await?;

            let outside = Command::MemoryRead {
                start_address: 0x1000,
                length: 4,
            };
            let (code, _) = host.command(&outside, Timeout::Forever).await?;
            assert_eq!(code, ErrorCode::InvalidParam);
            Ok(())
        });
    }

    run_simulation!(engine);

    assert_eq!(*read_back.borrow(), (0..32).collect::<Vec<u8>>());
}

/// Writes whose declared range falls outside DDR or flash are refused
/// without reading the data into memory, and the data that follows is
/// skipped so the next command is understood.
#[test]
fn oversized_writes_are_refused() {
    let mut engine = start_test(file!());
    let system = SimulatedSystem::new_and_register(&engine, PipelineConfig::default()).unwrap();

    let codes = Rc::new(RefCell::new(Vec::new()));
    {
        let host = system.host;
        let codes = codes.clone();
        engine.spawn(async move {
            host.connect();
            let writes = [
                Command::MemoryWrite {
                    start_address: 0x6100_0000,
                    length: u32::MAX,
                },
                Command::WriteFlash {
                    offset: 0x100,
                    length: u32::MAX,
                },
            ];
            for write in writes {
                host.send_message(&write.encode())?;
                host.send_message(&[0xA5; 32])?;
                let reply = host.receive(Timeout::Forever).await?;
                let (code, _) = decode_response(&reply).map_err(ErrorCode::from)?;
                codes.borrow_mut().push(code);
            }

            let (code, _) = host
                .command(&Command::GetSystemInfo, Timeout::Forever)
                .await?;
            codes.borrow_mut().push(code);
            Ok(())
        });
    }

    run_simulation!(engine);

    assert_eq!(
        *codes.borrow(),
        vec![
            ErrorCode::InvalidParam,
            ErrorCode::InvalidParam,
            ErrorCode::Success
        ]
    );
}

/// A queue reset aborts a half-received job; the link carries on with the
/// next message.
#[test]
fn queue_reset_resynchronises() {
    let mut engine = start_test(file!());
    let system = SimulatedSystem::new_and_register(&engine, PipelineConfig::default()).unwrap();
    let fifoq = system.pipeline.ctx.fifoq.clone();
    let clock = engine.default_clock();

    let statuses = Rc::new(RefCell::new(Vec::new()));
    {
        let host = system.host;
        let statuses = statuses.clone();
        engine.spawn(async move {
            host.connect();
            assert!(!host.control(reset()).await?);
            assert!(host.configure_queues(&QUEUES).await?);

            let partial = HeaderStamp::new(MagicType::Inference, 5000, 1234);
            let mut bytes = partial.to_bytes();
            bytes.resize(100, 0);
            host.send_message(&bytes)?;
            clock.wait_ticks(5).await;

            assert!(host.control(reset()).await?);
            host.send_custom(1234, &[0; 16])?;
            statuses
                .borrow_mut()
                .push(host.next_result(Timeout::Forever).await?.status());
            Ok(())
        });
    }

    run_simulation!(engine);

    assert_eq!(*statuses.borrow(), vec![ErrorCode::UnknownApp]);
    let status = fifoq.status().unwrap();
    assert_eq!(status.image_free, 2);
    assert_eq!(status.result_free, 2);
}

/// Inference input that arrives before the queues exist is skipped.
#[test]
fn inference_before_configuration_is_dropped() {
    let mut engine = start_test(file!());
    let system = SimulatedSystem::new_and_register(&engine, PipelineConfig::default()).unwrap();
    let clock = engine.default_clock();

    let statuses = Rc::new(RefCell::new(Vec::new()));
    let trailing = Rc::new(RefCell::new(None));
    {
        let host = system.host;
        let statuses = statuses.clone();
        let trailing = trailing.clone();
        engine.spawn(async move {
            host.connect();
            host.send_custom(1111, &[0; 200])?;
            clock.wait_ticks(5).await;
            assert!(host.configure_queues(&QUEUES).await?);
            host.send_custom(2222, &[0; 16])?;

            let result = host.next_result(Timeout::Forever).await?;
            statuses.borrow_mut().push((result.stamp.job_id, result.status()));
            *trailing.borrow_mut() = host.receive(Timeout::Ticks(100)).await.err();
            Ok(())
        });
    }

    run_simulation!(engine);

    assert_eq!(*statuses.borrow(), vec![(2222, ErrorCode::UnknownApp)]);
    assert_eq!(*trailing.borrow(), Some(TransportError::Timeout));
}

/// A message that declares more bytes than an image buffer holds brings
/// the link down; nothing is queued.
#[test]
fn oversized_message_tears_down_the_link() {
    let mut engine = start_test(file!());
    let system = SimulatedSystem::new_and_register(&engine, PipelineConfig::default()).unwrap();
    let fifoq = system.pipeline.ctx.fifoq.clone();
    let port = system.host.port().clone();

    {
        let host = system.host;
        engine.spawn(async move {
            host.connect();
            assert!(host.configure_queues(&QUEUES).await?);
            let stamp = HeaderStamp::new(MagicType::Inference, 20_000, 1000);
            let mut bytes = stamp.to_bytes();
            bytes.resize(1024, 0);
            host.send_message(&bytes)?;
            Ok(())
        });
    }

    run_simulation!(engine);

    assert!(!port.is_connected());
    let status = fifoq.status().unwrap();
    assert_eq!(status.image_free, 2);
    assert_eq!(status.image_data, 0);
}

/// Losing the link turns droppable mode off again.
#[test]
fn disconnect_clears_droppable_mode() {
    let mut engine = start_test(file!());
    let system = SimulatedSystem::new_and_register(&engine, PipelineConfig::default()).unwrap();
    let ctx = system.pipeline.ctx.clone();
    let clock = engine.default_clock();

    let seen = Rc::new(RefCell::new(Vec::new()));
    {
        let host = system.host;
        let ctx = ctx.clone();
        let seen = seen.clone();
        engine.spawn(async move {
            host.connect();
            assert!(host.configure_queues(&QUEUES).await?);
            assert!(host.control(ControlRequest::droppable(true)).await?);
            seen.borrow_mut().push(ctx.droppable());
            host.disconnect();
            clock.wait_ticks(1).await;
            seen.borrow_mut().push(ctx.droppable());
            Ok(())
        });
    }

    run_simulation!(engine);

    assert_eq!(*seen.borrow(), vec![true, false]);
}
