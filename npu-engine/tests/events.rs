// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

use std::cell::RefCell;
use std::rc::Rc;

use npu_engine::events::flags::EventFlags;
use npu_engine::events::once::Once;
use npu_engine::events::repeated::Repeated;
use npu_engine::run_simulation;
use npu_engine::test_helpers::start_test;
use npu_engine::traits::Event;

#[test]
fn once_notify_one_listener() {
    let mut engine = start_test(file!());
    let clock = engine.default_clock();

    let once = Once::new();

    {
        let once = once.clone();
        let clock = clock.clone();
        engine.spawn(async move {
            let res = once.listen().await;
            assert_eq!(res, 123);

            // Ensure this hasn't completed early
            assert_eq!(clock.tick_now(), 10);
            Ok(())
        });
    }

    {
        let clock = clock.clone();
        engine.spawn(async move {
            clock.wait_ticks(10).await;
            once.notify(123)
        });
    }

    run_simulation!(engine);
    assert_eq!(clock.tick_now(), 10);
}

#[test]
fn once_notify_twice_is_an_error() {
    let mut engine = start_test(file!());
    let once = Once::default();

    {
        let once = once.clone();
        engine.spawn(async move {
            once.notify(1)?;
            once.notify(2)
        });
    }

    run_simulation!(engine, "Error: once event already notified");
    assert_eq!(once.value(), Some(1));
}

#[test]
fn repeated_wakes_each_time() {
    let mut engine = start_test(file!());
    let clock = engine.default_clock();

    let event = Repeated::new(0);
    let seen = Rc::new(RefCell::new(Vec::new()));

    {
        let event = event.clone();
        let seen = seen.clone();
        engine.spawn(async move {
            for _ in 0..3 {
                let value = event.listen().await;
                seen.borrow_mut().push(value);
            }
            Ok(())
        });
    }

    engine.spawn(async move {
        for i in 1..=3 {
            clock.wait_ticks(5).await;
            event.notify_result(i * 10);
        }
        Ok(())
    });

    run_simulation!(engine);
    assert_eq!(*seen.borrow(), vec![10, 20, 30]);
}

#[test]
fn repeated_listener_ignores_earlier_notifications() {
    let mut engine = start_test(file!());
    let clock = engine.default_clock();
    let event = Repeated::new(0);
    event.notify_result(1);

    let woken_at = Rc::new(RefCell::new(None));
    {
        let event = event.clone();
        let clock = clock.clone();
        let woken_at = woken_at.clone();
        engine.spawn(async move {
            let value = event.listen().await;
            *woken_at.borrow_mut() = Some((value, clock.tick_now()));
            Ok(())
        });
    }

    engine.spawn(async move {
        clock.wait_ticks(4).await;
        event.notify_result(2);
        Ok(())
    });

    run_simulation!(engine);
    assert_eq!(*woken_at.borrow(), Some((2, 4)));
}

#[test]
fn flags_wait_any() {
    let mut engine = start_test(file!());
    let clock = engine.default_clock();
    let flags = EventFlags::new();
    let seen = Rc::new(RefCell::new(Vec::new()));

    {
        let flags = flags.clone();
        let seen = seen.clone();
        let clock = clock.clone();
        engine.spawn(async move {
            let bits = flags.wait_any(1 << 3).await;
            seen.borrow_mut().push((bits, clock.tick_now()));
            Ok(())
        });
    }

    engine.spawn(async move {
        clock.wait_ticks(1).await;
        flags.set(1 << 1);
        clock.wait_ticks(1).await;
        flags.set(1 << 3);
        Ok(())
    });

    run_simulation!(engine);
    assert_eq!(*seen.borrow(), vec![(1 << 3, 2)]);
}
