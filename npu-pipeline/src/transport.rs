// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The link between host and device.
//!
//! The device side of the pipeline only sees the [`Transport`] trait: two
//! bulk endpoints (data-out carries host to device, data-in device to host)
//! and a control channel. [`UsbLink`] is an in-memory implementation whose
//! host end is a [`HostPort`].
//!
//! A host bulk transfer is consumed by device reads in order; a read into a
//! buffer smaller than the transfer takes what fits and leaves the rest for
//! the next read.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use async_trait::async_trait;
use futures::channel::oneshot;
use npu_engine::events::repeated::Repeated;
use npu_engine::time::clock::Clock;
use npu_engine::time::timeout::{Timeout, with_timeout};
use npu_engine::traits::Event;
use npu_track::entity::Entity;
use npu_track::{debug, info, trace, warn};

use crate::error::TransportError;
use crate::framing::control::ControlRequest;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    /// Host to device.
    DataOut,

    /// Device to host.
    DataIn,
}

/// A control request waiting for the device's answer.
pub struct ControlTransfer {
    pub request: ControlRequest,
    reply: oneshot::Sender<bool>,
}

impl ControlTransfer {
    #[must_use]
    pub fn new(request: ControlRequest) -> (Self, oneshot::Receiver<bool>) {
        let (reply, receiver) = oneshot::channel();
        (Self { request, reply }, receiver)
    }

    /// Complete the transfer. A request that is not handled stalls.
    pub fn respond(self, handled: bool) {
        // The host may have gone away, in which case nobody is listening.
        let _ = self.reply.send(handled);
    }
}

#[async_trait(?Send)]
pub trait Transport {
    /// Wait until a host is connected.
    async fn wait_connected(&self);

    fn is_connected(&self) -> bool;

    /// Read from the data-out endpoint into `buf`, returning the number of
    /// bytes received.
    async fn read(&self, buf: &mut [u8], timeout: Timeout) -> Result<usize, TransportError>;

    /// Send one message on the data-in endpoint.
    async fn write(&self, bytes: &[u8], timeout: Timeout) -> Result<(), TransportError>;

    /// Wait for the next control request.
    async fn next_control(&self) -> ControlTransfer;

    /// Abort traffic on an endpoint: a pending data-out read fails with
    /// [`TransportError::Terminated`]; undelivered data-in messages are
    /// discarded.
    fn terminate(&self, endpoint: Endpoint);

    /// Drop the connection because the device cannot continue safely.
    fn teardown(&self);
}

struct LinkState {
    connected: Cell<bool>,
    read_aborted: Cell<bool>,
    to_device: RefCell<VecDeque<Vec<u8>>>,
    to_host: RefCell<VecDeque<Vec<u8>>>,
    controls: RefCell<VecDeque<ControlTransfer>>,
    changed: Repeated<()>,
}

impl LinkState {
    fn drop_connection(&self) {
        self.connected.set(false);
        self.to_device.borrow_mut().clear();
        self.to_host.borrow_mut().clear();
        // Dropping the transfers tells waiting hosts the request failed.
        self.controls.borrow_mut().clear();
        self.changed.notify();
    }
}

/// An in-memory USB link. The pipeline uses it as its [`Transport`]; the
/// host drives it through a [`HostPort`].
pub struct UsbLink {
    pub entity: Rc<Entity>,
    clock: Clock,
    state: Rc<LinkState>,
}

impl UsbLink {
    #[must_use]
    pub fn new(clock: &Clock, parent: &Rc<Entity>) -> Rc<Self> {
        Rc::new(Self {
            entity: Rc::new(Entity::new(parent, "usb")),
            clock: clock.clone(),
            state: Rc::new(LinkState {
                connected: Cell::new(false),
                read_aborted: Cell::new(false),
                to_device: RefCell::new(VecDeque::new()),
                to_host: RefCell::new(VecDeque::new()),
                controls: RefCell::new(VecDeque::new()),
                changed: Repeated::default(),
            }),
        })
    }

    #[must_use]
    pub fn host_port(&self) -> HostPort {
        HostPort {
            entity: self.entity.clone(),
            clock: self.clock.clone(),
            state: self.state.clone(),
        }
    }

    fn take_from_host(&self, buf: &mut [u8]) -> Option<usize> {
        let mut queue = self.state.to_device.borrow_mut();
        let transfer = queue.front_mut()?;
        let n = transfer.len().min(buf.len());
        buf[..n].copy_from_slice(&transfer[..n]);
        if n == transfer.len() {
            queue.pop_front();
        } else {
            transfer.drain(..n);
        }
        Some(n)
    }
}

#[async_trait(?Send)]
impl Transport for UsbLink {
    async fn wait_connected(&self) {
        while !self.state.connected.get() {
            self.state.changed.listen().await;
        }
    }

    fn is_connected(&self) -> bool {
        self.state.connected.get()
    }

    async fn read(&self, buf: &mut [u8], timeout: Timeout) -> Result<usize, TransportError> {
        let next = async {
            loop {
                if !self.state.connected.get() {
                    return Err(TransportError::Disconnected);
                }
                if self.state.read_aborted.replace(false) {
                    return Err(TransportError::Terminated);
                }
                if let Some(n) = self.take_from_host(buf) {
                    return Ok(n);
                }
                self.state.changed.listen().await;
            }
        };
        let result = with_timeout(&self.clock, timeout, next)
            .await
            .unwrap_or(Err(TransportError::Timeout));
        if let Ok(n) = result {
            trace!(self.entity ; "device read {n} bytes");
        }
        result
    }

    async fn write(&self, bytes: &[u8], _timeout: Timeout) -> Result<(), TransportError> {
        if !self.state.connected.get() {
            return Err(TransportError::Disconnected);
        }
        trace!(self.entity ; "device wrote {} bytes", bytes.len());
        self.state.to_host.borrow_mut().push_back(bytes.to_vec());
        self.state.changed.notify();
        Ok(())
    }

    async fn next_control(&self) -> ControlTransfer {
        loop {
            if let Some(transfer) = self.state.controls.borrow_mut().pop_front() {
                return transfer;
            }
            self.state.changed.listen().await;
        }
    }

    fn terminate(&self, endpoint: Endpoint) {
        debug!(self.entity ; "terminate {endpoint:?}");
        match endpoint {
            Endpoint::DataOut => self.state.read_aborted.set(true),
            Endpoint::DataIn => self.state.to_host.borrow_mut().clear(),
        }
        self.state.changed.notify();
    }

    fn teardown(&self) {
        warn!(self.entity ; "device tears the connection down");
        self.state.drop_connection();
    }
}

/// The host's end of a [`UsbLink`].
#[derive(Clone)]
pub struct HostPort {
    entity: Rc<Entity>,
    clock: Clock,
    state: Rc<LinkState>,
}

impl HostPort {
    pub fn connect(&self) {
        info!(self.entity ; "host connected");
        self.state.read_aborted.set(false);
        self.state.connected.set(true);
        self.state.changed.notify();
    }

    pub fn disconnect(&self) {
        info!(self.entity ; "host disconnected");
        self.state.drop_connection();
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.connected.get()
    }

    /// Queue one bulk transfer to the device.
    pub fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.state.connected.get() {
            return Err(TransportError::Disconnected);
        }
        trace!(self.entity ; "host sent {} bytes", bytes.len());
        self.state.to_device.borrow_mut().push_back(bytes.to_vec());
        self.state.changed.notify();
        Ok(())
    }

    /// Number of host transfers the device has not consumed yet.
    #[must_use]
    pub fn pending_transfers(&self) -> usize {
        self.state.to_device.borrow().len()
    }

    /// Receive the next message from the device.
    pub async fn receive(&self, timeout: Timeout) -> Result<Vec<u8>, TransportError> {
        let next = async {
            loop {
                if let Some(message) = self.state.to_host.borrow_mut().pop_front() {
                    return Ok(message);
                }
                if !self.state.connected.get() {
                    return Err(TransportError::Disconnected);
                }
                self.state.changed.listen().await;
            }
        };
        with_timeout(&self.clock, timeout, next)
            .await
            .unwrap_or(Err(TransportError::Timeout))
    }

    /// Issue a control request. Returns whether the device handled it.
    pub async fn control(&self, request: ControlRequest) -> Result<bool, TransportError> {
        if !self.state.connected.get() {
            return Err(TransportError::Disconnected);
        }
        debug!(self.entity ; "control {request}");
        let (transfer, reply) = ControlTransfer::new(request);
        self.state.controls.borrow_mut().push_back(transfer);
        self.state.changed.notify();

        match reply.await {
            Ok(handled) => Ok(handled),
            Err(oneshot::Canceled) if !self.state.connected.get() => {
                Err(TransportError::Disconnected)
            }
            Err(oneshot::Canceled) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use npu_engine::engine::Engine;
    use npu_engine::run_simulation;
    use npu_track::tracker::dev_null_tracker;

    use super::*;

    #[test]
    fn reads_split_large_transfers() {
        let mut engine = Engine::new(&dev_null_tracker());
        let link = UsbLink::new(&engine.default_clock(), engine.top());
        let host = link.host_port();
        host.connect();
        host.send(&[1, 2, 3, 4, 5, 6]).unwrap();
        host.send(&[7]).unwrap();

        engine.spawn(async move {
            let mut buf = [0; 4];
            assert_eq!(link.read(&mut buf, Timeout::Immediate).await, Ok(4));
            assert_eq!(buf, [1, 2, 3, 4]);
            assert_eq!(link.read(&mut buf, Timeout::Immediate).await, Ok(2));
            assert_eq!(&buf[..2], &[5, 6]);
            assert_eq!(link.read(&mut buf, Timeout::Immediate).await, Ok(1));
            assert_eq!(
                link.read(&mut buf, Timeout::Ticks(5)).await,
                Err(TransportError::Timeout)
            );
            Ok(())
        });
        run_simulation!(engine);
    }

    #[test]
    fn terminate_aborts_one_read() {
        let mut engine = Engine::new(&dev_null_tracker());
        let link = UsbLink::new(&engine.default_clock(), engine.top());
        link.host_port().connect();
        link.terminate(Endpoint::DataOut);

        engine.spawn(async move {
            let mut buf = [0; 4];
            assert_eq!(
                link.read(&mut buf, Timeout::Forever).await,
                Err(TransportError::Terminated)
            );
            assert_eq!(
                link.read(&mut buf, Timeout::Immediate).await,
                Err(TransportError::Timeout)
            );
            Ok(())
        });
        run_simulation!(engine);
    }

    #[test]
    fn unanswered_control_stalls() {
        let mut engine = Engine::new(&dev_null_tracker());
        let link = UsbLink::new(&engine.default_clock(), engine.top());
        let host = link.host_port();
        host.connect();

        {
            let link = link.clone();
            engine.spawn(async move {
                let transfer = link.next_control().await;
                assert_eq!(transfer.request, ControlRequest::droppable(true));
                drop(transfer);
                link.next_control().await.respond(true);
                Ok(())
            });
        }
        engine.spawn(async move {
            assert_eq!(host.control(ControlRequest::droppable(true)).await, Ok(false));
            assert_eq!(host.control(ControlRequest::droppable(false)).await, Ok(true));
            host.disconnect();
            assert_eq!(
                host.control(ControlRequest::droppable(false)).await,
                Err(TransportError::Disconnected)
            );
            Ok(())
        });
        run_simulation!(engine);
    }
}
