// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::rc::Rc;

use crate::{
    Below, ChannelDriver, Direction, Interest, OsHandle, SeekDriver, ThreadAction,
    TruncateDriver,
};

#[derive(Debug)]
enum FakeInput {
    Data(Vec<u8>),
    WouldBlock,
    Eof,
    Error(io::ErrorKind, Option<String>),
}

#[derive(Debug)]
enum FakeOutput {
    Accept(usize),
    WouldBlock,
    Error(io::ErrorKind, Option<String>),
}

#[derive(Debug)]
struct FakeDevice {
    input: VecDeque<FakeInput>,
    eof_when_drained: bool,
    input_requests: Vec<usize>,
    output: VecDeque<FakeOutput>,
    written: Vec<u8>,
    output_calls: Vec<usize>,
    watch_masks: Vec<Interest>,
    blocking_modes: Vec<bool>,
    close_count: usize,
    close_error: Option<io::ErrorKind>,
    half_closes: Vec<Direction>,
    thread_actions: Vec<ThreadAction>,
    payload: Option<String>,
    options: HashMap<&'static str, String>,
}

impl FakeDevice {
    fn fail(&mut self, kind: io::ErrorKind, payload: Option<String>, what: &str) -> io::Error {
        self.payload = payload;
        io::Error::new(kind, format!("fake {what} failure"))
    }
}

/// A [`ChannelDriver`] over a scripted in-memory device.
/// For test and example purposes only, not for real I/O.
///
/// Input is served from a script of data chunks and conditions. Each read returns at most one
/// chunk. Output is recorded. The [`FakeDeviceHandle`] returned alongside the driver scripts
/// the device and inspects everything the channel did to it.
#[derive(derive_more::Debug)]
pub struct FakeDriver {
    type_name: &'static str,
    device: Rc<RefCell<FakeDevice>>,
    #[debug(skip)]
    seek: Option<Box<dyn SeekDriver>>,
    #[debug(skip)]
    truncate: Option<Box<dyn TruncateDriver>>,
    half_close: bool,
    option_names: Vec<&'static str>,
    os_handle: Option<OsHandle>,
}

/// Scripts and inspects the device behind a [`FakeDriver`].
#[derive(Debug, Clone)]
pub struct FakeDeviceHandle {
    device: Rc<RefCell<FakeDevice>>,
}

impl FakeDriver {
    /// Creates a driver named `fake` whose device reports end of stream once its input
    /// script is exhausted.
    // Trivial code for testing and examples, do not spend mutation time on this.
    #[cfg_attr(test, mutants::skip)]
    #[must_use]
    pub fn new() -> (Self, FakeDeviceHandle) {
        let device = Rc::new(RefCell::new(FakeDevice {
            input: VecDeque::new(),
            eof_when_drained: true,
            input_requests: Vec::new(),
            output: VecDeque::new(),
            written: Vec::new(),
            output_calls: Vec::new(),
            watch_masks: Vec::new(),
            blocking_modes: Vec::new(),
            close_count: 0,
            close_error: None,
            half_closes: Vec::new(),
            thread_actions: Vec::new(),
            payload: None,
            options: HashMap::new(),
        }));

        let driver = Self {
            type_name: "fake",
            device: Rc::clone(&device),
            seek: None,
            truncate: None,
            half_close: false,
            option_names: Vec::new(),
            os_handle: None,
        };

        (driver, FakeDeviceHandle { device })
    }

    /// Reports a different driver type name.
    #[cfg_attr(test, mutants::skip)]
    #[must_use]
    pub fn with_type_name(mut self, type_name: &'static str) -> Self {
        self.type_name = type_name;
        self
    }

    /// Gives the driver a positioning capability.
    #[cfg_attr(test, mutants::skip)]
    #[must_use]
    pub fn with_seek(mut self, seek: Box<dyn SeekDriver>) -> Self {
        self.seek = Some(seek);
        self
    }

    /// Gives the driver a truncation capability.
    #[cfg_attr(test, mutants::skip)]
    #[must_use]
    pub fn with_truncate(mut self, truncate: Box<dyn TruncateDriver>) -> Self {
        self.truncate = Some(truncate);
        self
    }

    /// Lets the driver shut down a single direction.
    #[cfg_attr(test, mutants::skip)]
    #[must_use]
    pub const fn with_half_close(mut self) -> Self {
        self.half_close = true;
        self
    }

    /// Adds a driver-specific option with an initial value.
    #[cfg_attr(test, mutants::skip)]
    #[must_use]
    pub fn with_option(self, name: &'static str, value: &str) -> Self {
        let mut driver = self;
        driver.option_names.push(name);
        driver
            .device
            .borrow_mut()
            .options
            .insert(name, value.to_string());
        driver
    }

    /// Reports a native handle for both directions.
    #[cfg_attr(test, mutants::skip)]
    #[must_use]
    pub const fn with_os_handle(mut self, handle: i64) -> Self {
        self.os_handle = Some(OsHandle(handle));
        self
    }
}

impl ChannelDriver for FakeDriver {
    fn type_name(&self) -> &'static str {
        self.type_name
    }

    fn input(&mut self, _below: &mut Below<'_>, buf: &mut [u8]) -> io::Result<usize> {
        let mut device = self.device.borrow_mut();
        device.input_requests.push(buf.len());

        match device.input.pop_front() {
            Some(FakeInput::Data(mut bytes)) => {
                let count = bytes.len().min(buf.len());
                buf[..count].copy_from_slice(&bytes[..count]);
                if count < bytes.len() {
                    let rest = bytes.split_off(count);
                    device.input.push_front(FakeInput::Data(rest));
                }
                Ok(count)
            }
            Some(FakeInput::WouldBlock) => Err(io::ErrorKind::WouldBlock.into()),
            Some(FakeInput::Eof) => Ok(0),
            Some(FakeInput::Error(kind, payload)) => Err(device.fail(kind, payload, "input")),
            None if device.eof_when_drained => Ok(0),
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn output(&mut self, _below: &mut Below<'_>, data: &[u8]) -> io::Result<usize> {
        let mut device = self.device.borrow_mut();
        device.output_calls.push(data.len());

        match device.output.pop_front() {
            None => {
                device.written.extend_from_slice(data);
                Ok(data.len())
            }
            Some(FakeOutput::Accept(max)) => {
                let count = max.min(data.len());
                device.written.extend_from_slice(&data[..count]);
                Ok(count)
            }
            Some(FakeOutput::WouldBlock) => Err(io::ErrorKind::WouldBlock.into()),
            Some(FakeOutput::Error(kind, payload)) => Err(device.fail(kind, payload, "output")),
        }
    }

    fn close(&mut self, _below: &mut Below<'_>) -> io::Result<()> {
        let mut device = self.device.borrow_mut();
        device.close_count += 1;
        match device.close_error.take() {
            Some(kind) => Err(io::Error::new(kind, "fake close failure")),
            None => Ok(()),
        }
    }

    fn supports_half_close(&self) -> bool {
        self.half_close
    }

    fn close_half(&mut self, _below: &mut Below<'_>, direction: Direction) -> io::Result<()> {
        self.device.borrow_mut().half_closes.push(direction);
        Ok(())
    }

    fn watch(&mut self, interest: Interest) {
        self.device.borrow_mut().watch_masks.push(interest);
    }

    fn set_blocking(&mut self, blocking: bool) -> io::Result<()> {
        self.device.borrow_mut().blocking_modes.push(blocking);
        Ok(())
    }

    fn os_handle(&self, _direction: Direction) -> Option<OsHandle> {
        self.os_handle
    }

    fn option_names(&self) -> &[&'static str] {
        &self.option_names
    }

    fn option(&self, name: &str) -> Option<io::Result<String>> {
        self.device.borrow().options.get(name).cloned().map(Ok)
    }

    fn set_option(&mut self, name: &str, value: &str) -> Option<io::Result<()>> {
        let mut device = self.device.borrow_mut();
        let slot = device.options.get_mut(name)?;
        *slot = value.to_string();
        Some(Ok(()))
    }

    fn as_seekable(&mut self) -> Option<&mut dyn SeekDriver> {
        self.seek.as_mut().map(|seek| &mut **seek as &mut dyn SeekDriver)
    }

    fn as_truncatable(&mut self) -> Option<&mut dyn TruncateDriver> {
        self.truncate
            .as_mut()
            .map(|truncate| &mut **truncate as &mut dyn TruncateDriver)
    }

    fn thread_action(&mut self, action: ThreadAction) {
        self.device.borrow_mut().thread_actions.push(action);
    }

    fn take_error_payload(&mut self) -> Option<String> {
        self.device.borrow_mut().payload.take()
    }
}

// Trivial code for testing and examples, do not spend mutation time on this.
#[cfg_attr(test, mutants::skip)]
impl FakeDeviceHandle {
    /// Queues bytes to be read. Each call is delivered by a separate read at the earliest.
    pub fn push_input(&self, data: &[u8]) {
        self.device
            .borrow_mut()
            .input
            .push_back(FakeInput::Data(data.to_vec()));
    }

    /// Queues a read that reports it would block.
    pub fn push_would_block(&self) {
        self.device.borrow_mut().input.push_back(FakeInput::WouldBlock);
    }

    /// Queues a read that reports end of stream.
    pub fn push_eof(&self) {
        self.device.borrow_mut().input.push_back(FakeInput::Eof);
    }

    /// Queues a failing read, optionally with a descriptive payload.
    pub fn push_read_error(&self, kind: io::ErrorKind, payload: Option<&str>) {
        self.device
            .borrow_mut()
            .input
            .push_back(FakeInput::Error(kind, payload.map(str::to_string)));
    }

    /// Chooses what reads report once the input script is exhausted: end of stream if
    /// `true`, would-block otherwise.
    pub fn set_eof_when_drained(&self, eof: bool) {
        self.device.borrow_mut().eof_when_drained = eof;
    }

    /// Makes the next unscripted write accept at most `max` bytes.
    pub fn push_output_limit(&self, max: usize) {
        self.device
            .borrow_mut()
            .output
            .push_back(FakeOutput::Accept(max));
    }

    /// Queues a write that reports it would block.
    pub fn push_output_would_block(&self) {
        self.device.borrow_mut().output.push_back(FakeOutput::WouldBlock);
    }

    /// Queues a failing write, optionally with a descriptive payload.
    pub fn push_output_error(&self, kind: io::ErrorKind, payload: Option<&str>) {
        self.device
            .borrow_mut()
            .output
            .push_back(FakeOutput::Error(kind, payload.map(str::to_string)));
    }

    /// Makes the next close of the driver fail.
    pub fn fail_close(&self, kind: io::ErrorKind) {
        self.device.borrow_mut().close_error = Some(kind);
    }

    /// Everything written to the device so far.
    #[must_use]
    pub fn written(&self) -> Vec<u8> {
        self.device.borrow().written.clone()
    }

    /// Sizes of all write requests, including those that did not succeed.
    #[must_use]
    pub fn output_calls(&self) -> Vec<usize> {
        self.device.borrow().output_calls.clone()
    }

    /// Sizes of all read requests.
    #[must_use]
    pub fn input_requests(&self) -> Vec<usize> {
        self.device.borrow().input_requests.clone()
    }

    /// The most recent interest mask passed to the driver.
    #[must_use]
    pub fn watch_mask(&self) -> Option<Interest> {
        self.device.borrow().watch_masks.last().copied()
    }

    /// The most recent blocking mode passed to the driver.
    #[must_use]
    pub fn is_blocking(&self) -> Option<bool> {
        self.device.borrow().blocking_modes.last().copied()
    }

    /// How often the driver was closed.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.device.borrow().close_count
    }

    /// Directions shut down individually, in order.
    #[must_use]
    pub fn half_closes(&self) -> Vec<Direction> {
        self.device.borrow().half_closes.clone()
    }

    /// Context moves reported to the driver, in order.
    #[must_use]
    pub fn thread_actions(&self) -> Vec<ThreadAction> {
        self.device.borrow().thread_actions.clone()
    }

    /// Current value of a driver-specific option.
    #[must_use]
    pub fn option(&self, name: &str) -> Option<String> {
        self.device.borrow().options.get(name).cloned()
    }
}
