// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io::{self, Read, Write};

use tracing::{Level, event};

use crate::driver::Below;
use crate::flags::ChannelFlags;
use crate::{ChannelDriver, ChannelId, ChannelSystem, Direction, Interest, Mode, OsHandle, Result};

/// One of the three standard streams of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StdStream {
    /// Standard input.
    Stdin,
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl StdStream {
    /// All standard streams, in the order they are closed by
    /// [`ChannelSystem::finalize`].
    pub const ALL: [Self; 3] = [Self::Stdin, Self::Stdout, Self::Stderr];

    /// The channel name of the stream.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Stdin => "stdin",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }

    /// The stream with the given channel name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|stream| stream.name() == name)
    }

    /// The direction the stream is open for.
    #[must_use]
    pub const fn mode(self) -> Mode {
        match self {
            Self::Stdin => Mode::READ,
            Self::Stdout | Self::Stderr => Mode::WRITE,
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Stdin => 0,
            Self::Stdout => 1,
            Self::Stderr => 2,
        }
    }
}

/// Creates the driver of a standard channel on first use. Returning `None` leaves the
/// stream without a channel.
pub type StdChannelFactory = Box<dyn FnMut(StdStream) -> Option<Box<dyn ChannelDriver>>>;

/// The standard channels of a [`ChannelSystem`]. The system holds one reference on each of
/// them.
#[derive(derive_more::Debug)]
pub(crate) struct StdChannels {
    enabled: bool,
    channels: [Option<ChannelId>; 3],
    // A stream is set up at most once. A closed standard channel stays closed.
    initialized: [bool; 3],
    #[debug(skip)]
    factory: Option<StdChannelFactory>,
}

impl StdChannels {
    pub(crate) const fn new(enabled: bool) -> Self {
        Self {
            enabled,
            channels: [None; 3],
            initialized: [false; 3],
            factory: None,
        }
    }

    pub(crate) fn holds(&self, id: ChannelId) -> bool {
        self.channels.contains(&Some(id))
    }

    pub(crate) fn forget(&mut self, id: ChannelId) {
        for slot in &mut self.channels {
            if *slot == Some(id) {
                *slot = None;
            }
        }
    }

    /// The standard channels in the order they are closed at exit.
    pub(crate) fn ids(&self) -> Vec<ChannelId> {
        self.channels.iter().flatten().copied().collect()
    }

    pub(crate) fn clear(&mut self) {
        self.channels = [None; 3];
    }
}

impl ChannelSystem {
    /// The channel of a standard stream, created on first request.
    ///
    /// The channel is named after the stream. Standard output is line buffered and standard
    /// error unbuffered. Returns `None` if the stream has no channel, because standard
    /// channels are disabled, the factory declined to create it, or it was closed.
    pub fn std_channel(&mut self, stream: StdStream) -> Option<ChannelId> {
        let index = stream.index();
        if let Some(id) = self.std.channels[index] {
            return Some(id);
        }
        if self.std.initialized[index] || !self.std.enabled || self.finalized {
            return None;
        }
        self.std.initialized[index] = true;

        let driver: Box<dyn ChannelDriver> = match self.std.factory.as_mut() {
            Some(factory) => factory(stream)?,
            None => Box::new(StdioDriver { stream }),
        };

        let id = self.create_named_channel(stream.name(), driver, stream.mode());
        if let Ok(state) = self.state_mut(id) {
            state.ref_count += 1;
            match stream {
                StdStream::Stdin => {}
                StdStream::Stdout => state.flags.insert(ChannelFlags::LINE_BUFFERED),
                StdStream::Stderr => state.flags.insert(ChannelFlags::UNBUFFERED),
            }
        }
        self.std.channels[index] = Some(id);

        event!(Level::TRACE, message = "standard channel created", stream = stream.name());
        Some(id)
    }

    /// Makes `id` the channel of a standard stream, or leaves the stream without a channel if
    /// `id` is `None`. The system takes a reference on the new channel and releases the one
    /// on the previous channel, closing it if nothing else references it.
    ///
    /// # Errors
    ///
    /// Fails if the handle is no longer valid. Errors of closing the previous channel are
    /// returned as well.
    pub fn set_std_channel(&mut self, stream: StdStream, id: Option<ChannelId>) -> Result<()> {
        let index = stream.index();
        if let Some(id) = id {
            self.state_mut(id)?.ref_count += 1;
        }

        let previous = std::mem::replace(&mut self.std.channels[index], id);
        self.std.initialized[index] = true;

        let Some(previous) = previous.filter(|previous| Some(*previous) != id) else {
            return Ok(());
        };
        if self.std.holds(previous) {
            return Ok(());
        }

        let state = self.state_mut(previous)?;
        state.ref_count = state.ref_count.saturating_sub(1);
        if state.ref_count == 0 && !state.flags.contains(ChannelFlags::IN_CLOSE) {
            return self.close_channel(previous);
        }
        Ok(())
    }

    /// Whether the channel is currently one of the standard channels.
    #[must_use]
    pub fn is_standard(&self, id: ChannelId) -> bool {
        self.std.holds(id)
    }

    /// Replaces how the drivers of standard channels that were not created yet are made.
    /// By default they use the process's standard streams.
    pub fn set_std_channel_factory(&mut self, factory: StdChannelFactory) {
        self.std.factory = Some(factory);
    }
}

/// Driver over the standard streams of the process.
#[derive(Debug)]
struct StdioDriver {
    stream: StdStream,
}

impl ChannelDriver for StdioDriver {
    fn type_name(&self) -> &'static str {
        "file"
    }

    fn input(&mut self, _below: &mut Below<'_>, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream {
            StdStream::Stdin => io::stdin().lock().read(buf),
            StdStream::Stdout | StdStream::Stderr => Err(io::ErrorKind::Unsupported.into()),
        }
    }

    fn output(&mut self, _below: &mut Below<'_>, data: &[u8]) -> io::Result<usize> {
        match self.stream {
            StdStream::Stdin => Err(io::ErrorKind::Unsupported.into()),
            StdStream::Stdout => {
                // The channel buffers already; push every write through std's line buffer.
                let mut stdout = io::stdout().lock();
                let count = stdout.write(data)?;
                stdout.flush()?;
                Ok(count)
            }
            StdStream::Stderr => io::stderr().lock().write(data),
        }
    }

    fn close(&mut self, _below: &mut Below<'_>) -> io::Result<()> {
        // The process's streams stay open; only std's own buffer is drained.
        match self.stream {
            StdStream::Stdout => io::stdout().lock().flush(),
            StdStream::Stdin | StdStream::Stderr => Ok(()),
        }
    }

    fn watch(&mut self, _interest: Interest) {}

    #[cfg(unix)]
    fn os_handle(&self, _direction: Direction) -> Option<OsHandle> {
        use std::os::fd::AsRawFd;

        let fd = match self.stream {
            StdStream::Stdin => io::stdin().as_raw_fd(),
            StdStream::Stdout => io::stdout().as_raw_fd(),
            StdStream::Stderr => io::stderr().as_raw_fd(),
        };
        Some(OsHandle(i64::from(fd)))
    }

    #[cfg(not(unix))]
    fn os_handle(&self, _direction: Direction) -> Option<OsHandle> {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    use super::*;
    use crate::fake::{FakeDeviceHandle, FakeDriver};
    use crate::{Buffering, Error, SystemConfig};

    type Devices = Rc<RefCell<HashMap<&'static str, FakeDeviceHandle>>>;

    fn system_with_fake_streams() -> (ChannelSystem, Devices) {
        let devices: Devices = Rc::new(RefCell::new(HashMap::new()));
        let sink = Rc::clone(&devices);

        let mut system = ChannelSystem::default();
        system.set_std_channel_factory(Box::new(move |stream| {
            let (driver, device) = FakeDriver::new();
            sink.borrow_mut().insert(stream.name(), device);
            Some(Box::new(driver) as Box<dyn ChannelDriver>)
        }));
        (system, devices)
    }

    #[test]
    fn stream_names_round_trip() {
        for stream in StdStream::ALL {
            assert_eq!(StdStream::from_name(stream.name()), Some(stream));
        }
        assert_eq!(StdStream::from_name("stdio"), None);
    }

    #[test]
    fn created_on_first_lookup() {
        let (mut system, devices) = system_with_fake_streams();
        let context = system.create_context();

        assert!(devices.borrow().is_empty());
        let stdout = system.lookup(context, "stdout").unwrap();

        assert_eq!(system.name(stdout).unwrap(), "stdout");
        assert_eq!(system.mode(stdout).unwrap(), Mode::WRITE);
        assert_eq!(system.buffering(stdout).unwrap(), Buffering::Line);
        assert!(system.is_standard(stdout));
        assert!(system.is_registered(context, stdout));
        assert_eq!(system.lookup(context, "stdout").unwrap(), stdout);

        let stderr = system.std_channel(StdStream::Stderr).unwrap();
        assert_eq!(system.buffering(stderr).unwrap(), Buffering::Unbuffered);
        assert_eq!(devices.borrow().len(), 2);
    }

    #[test]
    fn giving_up_last_registration_closes_for_good() {
        let (mut system, devices) = system_with_fake_streams();
        let context = system.create_context();
        let stdin = system.lookup(context, "stdin").unwrap();

        system.unregister(context, stdin).unwrap();
        assert!(!system.is_open(stdin));
        assert_eq!(devices.borrow()["stdin"].close_count(), 1);

        assert!(system.std_channel(StdStream::Stdin).is_none());
        assert!(matches!(
            system.lookup(context, "stdin"),
            Err(Error::UnknownChannel(_))
        ));
    }

    #[test]
    fn replaced_channel_is_released() {
        let (mut system, _devices) = system_with_fake_streams();
        let original = system.std_channel(StdStream::Stdout).unwrap();

        let (driver, device) = FakeDriver::new();
        let replacement = system.create_channel(Box::new(driver), Mode::WRITE);
        system.set_std_channel(StdStream::Stdout, Some(replacement)).unwrap();

        assert!(!system.is_open(original));
        assert_eq!(system.std_channel(StdStream::Stdout), Some(replacement));

        system.write_chars(replacement, "bye").unwrap();
        system.finalize();
        assert_eq!(device.written(), b"bye");
        assert_eq!(device.close_count(), 1);
    }

    #[test]
    fn standard_channels_close_last_in_order() {
        let (mut system, _devices) = system_with_fake_streams();
        let order = Rc::new(RefCell::new(Vec::new()));

        let (driver, _device) = FakeDriver::new();
        let plain = system.create_channel(Box::new(driver), Mode::all());
        let mut ids = vec![plain];
        for stream in [StdStream::Stderr, StdStream::Stdin, StdStream::Stdout] {
            ids.push(system.std_channel(stream).unwrap());
        }

        for id in ids {
            let order = Rc::clone(&order);
            system
                .add_close_callback(
                    id,
                    Box::new(move |system, id| {
                        order.borrow_mut().push(system.name(id).unwrap().to_string());
                    }),
                )
                .unwrap();
        }

        system.finalize();
        assert_eq!(*order.borrow(), ["fake0", "stdin", "stdout", "stderr"]);
    }

    #[test]
    fn disabled_standard_channels_are_not_created() {
        let mut system = ChannelSystem::new(SystemConfig::default().without_std_channels());
        assert!(system.std_channel(StdStream::Stdout).is_none());
    }
}
