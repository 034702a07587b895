// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Single-threaded executor.
//!
//! Tasks are polled in the order they were woken. When no task is ready the
//! executor asks [`SimTime`] for the next scheduled clock tick, and when there
//! is neither a ready task nor a scheduled tick the simulation has reached
//! quiescence and [`Executor::run`] returns.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::mem::ManuallyDrop;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use npu_track::entity::Entity;

use crate::time::clock::Clock;
use crate::time::simtime::SimTime;
use crate::types::SimResult;

static VTABLE: RawWakerVTable =
    RawWakerVTable::new(clone_raw_waker, wake_task, wake_task_by_ref, drop_raw_waker);

fn waker_for_task(task: Rc<Task>) -> Waker {
    let ptr = Rc::into_raw(task) as *const ();
    // SAFETY: the vtable functions treat `ptr` as an `Rc<Task>` created above.
    unsafe { Waker::from_raw(RawWaker::new(ptr, &VTABLE)) }
}

unsafe fn clone_raw_waker(data: *const ()) -> RawWaker {
    // SAFETY: `data` always comes from `Rc::into_raw` on an `Rc<Task>`.
    unsafe { Rc::increment_strong_count(data as *const Task) };
    RawWaker::new(data, &VTABLE)
}

unsafe fn wake_task(data: *const ()) {
    // SAFETY: consumes the reference owned by this waker.
    let task = unsafe { Rc::from_raw(data as *const Task) };
    task.schedule();
}

unsafe fn wake_task_by_ref(data: *const ()) {
    // SAFETY: borrows the reference owned by this waker without consuming it.
    let task = ManuallyDrop::new(unsafe { Rc::from_raw(data as *const Task) });
    Rc::clone(&task).schedule();
}

unsafe fn drop_raw_waker(data: *const ()) {
    // SAFETY: releases the reference owned by this waker.
    unsafe { drop(Rc::from_raw(data as *const Task)) };
}

type TaskFuture = Pin<Box<dyn Future<Output = SimResult>>>;

struct Task {
    /// `None` once the future has completed.
    future: RefCell<Option<TaskFuture>>,

    /// Set while the task sits in the ready queue so repeated wakes only
    /// queue it once.
    queued: Cell<bool>,

    executor_state: Rc<ExecutorState>,
}

impl Task {
    fn new(
        future: impl Future<Output = SimResult> + 'static,
        executor_state: Rc<ExecutorState>,
    ) -> Task {
        Task {
            future: RefCell::new(Some(Box::pin(future))),
            queued: Cell::new(false),
            executor_state,
        }
    }

    fn schedule(self: Rc<Self>) {
        if !self.queued.replace(true) {
            let state = self.executor_state.clone();
            state.new_tasks.borrow_mut().push(self);
        }
    }

    fn poll(&self, context: &mut Context) -> Poll<SimResult> {
        let mut guard = self.future.borrow_mut();
        let Some(future) = guard.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let result = future.as_mut().poll(context);
        if result.is_ready() {
            *guard = None;
        }
        result
    }
}

struct ExecutorState {
    task_queue: RefCell<Vec<Rc<Task>>>,
    new_tasks: RefCell<Vec<Rc<Task>>>,
    time: RefCell<SimTime>,
}

impl ExecutorState {
    fn new(top: &Rc<Entity>) -> Self {
        Self {
            task_queue: RefCell::new(Vec::new()),
            new_tasks: RefCell::new(Vec::new()),
            time: RefCell::new(SimTime::new(top)),
        }
    }
}

/// Single-threaded executor
///
/// This is a thin-wrapper (using [`Rc`]) around the real executor state, so
/// that this struct can be cloned and passed around.
#[derive(Clone)]
pub struct Executor {
    pub entity: Rc<Entity>,
    state: Rc<ExecutorState>,
}

impl Executor {
    /// Poll ready tasks, advancing time whenever none is ready, until the
    /// simulation is quiescent or a task fails.
    pub fn run(&self) -> SimResult {
        loop {
            self.step()?;
            if !self.state.new_tasks.borrow().is_empty() {
                continue;
            }
            let Some(wakers) = self.state.time.borrow_mut().advance_time() else {
                return Ok(());
            };
            for waker in wakers {
                waker.wake();
            }
        }
    }

    fn step(&self) -> SimResult {
        let mut task_queue = self.state.task_queue.borrow_mut();
        task_queue.append(&mut self.state.new_tasks.borrow_mut());

        for task in task_queue.drain(..) {
            task.queued.set(false);

            let waker = waker_for_task(task.clone());
            let mut context = Context::from_waker(&waker);

            match task.poll(&mut context) {
                Poll::Ready(Err(e)) => return Err(e),
                Poll::Ready(Ok(())) | Poll::Pending => {}
            }
        }
        Ok(())
    }

    pub fn get_clock(&self, freq_mhz: f64) -> Clock {
        self.state.time.borrow_mut().get_clock(freq_mhz)
    }

    pub fn time_now_ns(&self) -> f64 {
        self.state.time.borrow().time_now_ns()
    }
}

/// `Spawner` spawns new futures into the executor.
#[derive(Clone)]
pub struct Spawner {
    state: Rc<ExecutorState>,
}

impl Spawner {
    pub fn spawn(&self, future: impl Future<Output = SimResult> + 'static) {
        let task = Rc::new(Task::new(future, self.state.clone()));
        task.schedule();
    }
}

pub fn new_executor_and_spawner(top: &Rc<Entity>) -> (Executor, Spawner) {
    let state = Rc::new(ExecutorState::new(top));
    let entity = Rc::new(Entity::new(top, "executor"));
    (
        Executor {
            entity,
            state: state.clone(),
        },
        Spawner { state },
    )
}
