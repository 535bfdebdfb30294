// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::Debug;
use std::io;

use crate::state::Layer;
use crate::{Direction, Interest};

/// The device side of a channel: moves raw bytes to and from some underlying resource.
///
/// A channel owns a stack of drivers. The bottom driver talks to the actual device. Drivers
/// stacked on top of it are transformations that reach the layers underneath through the
/// [`Below`] handle they receive in every data-moving call.
///
/// Errors are reported as [`io::Error`]. [`io::ErrorKind::WouldBlock`] means no progress is
/// possible right now and is only expected while the driver is in non-blocking mode.
/// [`io::ErrorKind::Interrupted`] is retried by the caller.
pub trait ChannelDriver: Debug {
    /// Short name of the driver type, used to generate channel names such as `file3`.
    fn type_name(&self) -> &'static str;

    /// Reads up to `buf.len()` bytes. Returning `Ok(0)` signals end of stream.
    fn input(&mut self, below: &mut Below<'_>, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes a prefix of `data` and returns its length.
    fn output(&mut self, below: &mut Below<'_>, data: &[u8]) -> io::Result<usize>;

    /// Releases the device. Called exactly once, after all buffered output was handed over.
    fn close(&mut self, below: &mut Below<'_>) -> io::Result<()>;

    /// Whether [`close_half`][Self::close_half] is implemented.
    fn supports_half_close(&self) -> bool {
        false
    }

    /// Shuts down one direction of the device while the other one stays usable.
    fn close_half(&mut self, below: &mut Below<'_>, direction: Direction) -> io::Result<()> {
        below.close_half(direction)
    }

    /// Declares the readiness conditions the channel currently wants to be notified about.
    ///
    /// The driver (or whatever event loop it cooperates with) reports matching readiness via
    /// [`ChannelSystem::notify`][crate::ChannelSystem::notify].
    fn watch(&mut self, interest: Interest);

    /// Switches the device between blocking and non-blocking mode.
    fn set_blocking(&mut self, blocking: bool) -> io::Result<()> {
        let _ = blocking;
        Ok(())
    }

    /// The native handle used for `direction`, if the device has one.
    fn os_handle(&self, direction: Direction) -> Option<OsHandle> {
        let _ = direction;
        None
    }

    /// Names of the driver-specific options, each including its leading `-`.
    fn option_names(&self) -> &[&'static str] {
        &[]
    }

    /// Value of a driver-specific option, or `None` if the option is not recognized.
    fn option(&self, name: &str) -> Option<io::Result<String>> {
        let _ = name;
        None
    }

    /// Changes a driver-specific option, or returns `None` if the option is not recognized.
    fn set_option(&mut self, name: &str, value: &str) -> Option<io::Result<()>> {
        let _ = (name, value);
        None
    }

    /// The positioning capability of the device, if it has one.
    fn as_seekable(&mut self) -> Option<&mut dyn SeekDriver> {
        None
    }

    /// The truncation capability of the device, if it has one.
    fn as_truncatable(&mut self) -> Option<&mut dyn TruncateDriver> {
        None
    }

    /// Informs the driver that the channel moved into or out of an owning context.
    fn thread_action(&mut self, action: ThreadAction) {
        let _ = action;
    }

    /// A descriptive message for the most recent failure, replacing the generic error text.
    ///
    /// Called right after an operation of this driver failed. The payload is consumed.
    fn take_error_payload(&mut self) -> Option<String> {
        None
    }
}

/// Positioning capability of a driver.
pub trait SeekDriver {
    /// Moves the device position and returns the new absolute position.
    fn seek(&mut self, offset: i64, whence: Whence) -> io::Result<u64>;
}

/// Truncation capability of a driver.
pub trait TruncateDriver {
    /// Sets the device length.
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

/// Reference point of a seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Whence {
    /// From the start of the device.
    Start,
    /// From the current position.
    Current,
    /// From the end of the device.
    End,
}

/// Whether a channel is entering or leaving an owning context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadAction {
    /// The channel was attached to a context.
    Insert,
    /// The channel was detached from its context.
    Remove,
}

/// Opaque native handle of a device, such as a file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OsHandle(pub i64);

/// Access to the layers underneath a driver in a channel's stack.
///
/// Reads see bytes that were buffered in the layer below when the driver was stacked before
/// any new bytes from the device.
#[derive(Debug)]
pub struct Below<'a> {
    layers: &'a mut [Layer],
}

impl<'a> Below<'a> {
    pub(crate) fn new(layers: &'a mut [Layer]) -> Self {
        Self { layers }
    }

    /// Whether there is a layer underneath. The bottom driver sees an empty `Below`.
    #[must_use]
    pub fn is_present(&self) -> bool {
        !self.layers.is_empty()
    }

    /// Type name of the driver directly underneath.
    #[must_use]
    pub fn type_name(&self) -> Option<&'static str> {
        self.layers.last().map(|layer| layer.driver.type_name())
    }

    /// Reads raw bytes from the layer underneath.
    ///
    /// # Errors
    ///
    /// Returns the error of the lower driver, or [`io::ErrorKind::Unsupported`] if there is no
    /// layer underneath.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (layer, rest) = self.layers.split_last_mut().ok_or_else(missing_layer)?;

        if buf.is_empty() {
            return Ok(0);
        }

        if let Some(front) = layer.pushback.front_mut() {
            let count = front.len().min(buf.len());
            buf[..count].copy_from_slice(&front.bytes()[..count]);
            front.consume(count);
            if front.is_empty() {
                layer.pushback.pop_front();
            }
            return Ok(count);
        }

        loop {
            match layer.driver.input(&mut Below::new(rest), buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                result => return result,
            }
        }
    }

    /// Writes raw bytes to the layer underneath and returns how many were accepted.
    ///
    /// # Errors
    ///
    /// Returns the error of the lower driver, or [`io::ErrorKind::Unsupported`] if there is no
    /// layer underneath.
    pub fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let (layer, rest) = self.layers.split_last_mut().ok_or_else(missing_layer)?;

        loop {
            match layer.driver.output(&mut Below::new(rest), data) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                result => return result,
            }
        }
    }

    /// Switches the layer underneath between blocking and non-blocking mode.
    ///
    /// # Errors
    ///
    /// Returns the error of the lower driver. Without a layer underneath this does nothing.
    pub fn set_blocking(&mut self, blocking: bool) -> io::Result<()> {
        match self.layers.last_mut() {
            Some(layer) => layer.driver.set_blocking(blocking),
            None => Ok(()),
        }
    }

    /// Shuts down one direction of the layer underneath.
    ///
    /// # Errors
    ///
    /// Returns the error of the lower driver, or [`io::ErrorKind::Unsupported`] if there is no
    /// layer underneath or it cannot close a single direction.
    pub fn close_half(&mut self, direction: Direction) -> io::Result<()> {
        let (layer, rest) = self.layers.split_last_mut().ok_or_else(missing_layer)?;

        if !layer.driver.supports_half_close() {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "half-close is not supported by the layer below",
            ));
        }
        layer.driver.close_half(&mut Below::new(rest), direction)
    }
}

fn missing_layer() -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, "there is no layer below")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeDriver, Rot13Transform};
    use crate::state::Layer;
    use crate::Mode;

    #[test]
    fn bottom_layer_sees_nothing_below() {
        let mut below = Below::new(&mut []);

        assert!(!below.is_present());
        assert_eq!(below.type_name(), None);
        assert_eq!(
            below.read(&mut [0; 4]).unwrap_err().kind(),
            io::ErrorKind::Unsupported
        );
        assert_eq!(
            below.write(b"x").unwrap_err().kind(),
            io::ErrorKind::Unsupported
        );
        below.set_blocking(false).unwrap();
    }

    #[test]
    fn pushback_is_read_before_device() {
        let (driver, device) = FakeDriver::new();
        device.push_input(b"device");

        let mut layer = Layer::new(Box::new(driver), Mode::all());
        let mut pending = crate::buffer::ChannelBuffer::allocate(8);
        pending.put(b"kept");
        layer.pushback.push_back(pending);

        let mut layers = vec![layer];
        let mut below = Below::new(&mut layers);

        let mut buf = [0; 16];
        assert_eq!(below.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"kept");
        assert_eq!(below.read(&mut buf).unwrap(), 6);
        assert_eq!(&buf[..6], b"device");
        assert_eq!(device.input_requests(), vec![16]);
    }

    #[test]
    fn transform_reaches_device_through_below() {
        let (driver, device) = FakeDriver::new();
        device.push_input(b"uryyb");

        let mut layers = vec![
            Layer::new(Box::new(driver), Mode::all()),
            Layer::new(Box::new(Rot13Transform::default()), Mode::all()),
        ];
        let (top, rest) = layers.split_last_mut().unwrap();

        let mut buf = [0; 8];
        let count = top.driver.input(&mut Below::new(rest), &mut buf).unwrap();
        assert_eq!(&buf[..count], b"hello");

        top.driver.output(&mut Below::new(rest), b"world").unwrap();
        assert_eq!(device.written(), b"jbeyq");
    }
}
