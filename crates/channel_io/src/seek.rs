// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io;

use crate::flags::ChannelFlags;
use crate::state::ChannelState;
use crate::{Error, Result, Whence};

impl ChannelState {
    pub(crate) fn unsupported(&self, operation: &'static str) -> Error {
        Error::Unsupported {
            channel: self.name.clone(),
            operation,
        }
    }

    // Writes out all queued output, temporarily in blocking mode if necessary.
    pub(crate) fn flush_blocking(&mut self) -> Result<()> {
        let was_nonblocking = self.is_nonblocking();
        if was_nonblocking {
            self.set_blocking(true)?;
        }

        self.flags.insert(ChannelFlags::BUFFER_READY);
        let flushed = self.flush(false);

        if was_nonblocking {
            self.set_blocking(false)?;
        }
        flushed
    }

    /// Moves the device position, discarding buffered input and writing out buffered output
    /// first. Relative seeks account for input the caller has not consumed yet.
    pub(crate) fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64> {
        self.check_usable()?;

        if self.top_mut().driver.as_seekable().is_none() {
            return Err(self.unsupported("seek"));
        }

        let input = self.input_buffered();
        if input > 0 && self.output_buffered() > 0 {
            return Err(Error::StdIo(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "cannot seek channel \"{}\" while both input and output are buffered",
                    self.name
                ),
            )));
        }

        let offset = match whence {
            Whence::Current => offset.saturating_sub(i64::try_from(input).unwrap_or(i64::MAX)),
            Whence::Start | Whence::End => offset,
        };

        self.discard_input();
        self.top_mut().pushback.clear();
        self.flush_blocking()?;

        let level = self.top_level();
        let result = match self.top_mut().driver.as_seekable() {
            Some(seeker) => seeker.seek(offset, whence),
            None => return Err(self.unsupported("seek")),
        };
        result.map_err(|e| self.driver_error(level, e))
    }

    /// The position of the next byte the caller will read or write, or `None` if the device
    /// cannot report positions.
    pub(crate) fn tell(&mut self) -> Result<Option<u64>> {
        self.check_usable()?;

        let input = u64::try_from(self.input_buffered()).unwrap_or(u64::MAX);
        let output = u64::try_from(self.output_buffered()).unwrap_or(u64::MAX);

        let level = self.top_level();
        let result = match self.top_mut().driver.as_seekable() {
            Some(seeker) => seeker.seek(0, Whence::Current),
            None => return Ok(None),
        };
        let position = result.map_err(|e| self.driver_error(level, e))?;

        Ok(Some(position.saturating_add(output).saturating_sub(input)))
    }

    /// Sets the device length after writing out buffered output and discarding buffered input.
    pub(crate) fn truncate(&mut self, len: u64) -> Result<()> {
        self.check_writable()?;

        if self.top_mut().driver.as_truncatable().is_none() {
            return Err(self.unsupported("truncate"));
        }

        self.discard_input();
        self.flush_blocking()?;

        let level = self.top_level();
        let result = match self.top_mut().driver.as_truncatable() {
            Some(truncater) => truncater.truncate(len),
            None => return Err(self.unsupported("truncate")),
        };
        result.map_err(|e| self.driver_error(level, e))
    }
}

#[cfg(test)]
mod tests {
    use mockall::predicate::eq;

    use super::*;
    use crate::fake::{FakeDeviceHandle, FakeDriver};
    use crate::mocks::{MockSeekDriver, MockTruncateDriver};
    use crate::{Mode, SystemConfig};

    fn channel(driver: FakeDriver) -> ChannelState {
        ChannelState::new(
            "file0".to_string(),
            Box::new(driver),
            Mode::all(),
            &SystemConfig::default(),
        )
    }

    fn seekable(seeker: MockSeekDriver) -> (ChannelState, FakeDeviceHandle) {
        let (driver, device) = FakeDriver::new();
        (channel(driver.with_seek(Box::new(seeker))), device)
    }

    #[test]
    fn seek_without_capability_is_rejected() {
        let (driver, _device) = FakeDriver::new();
        let mut state = channel(driver);

        assert!(matches!(
            state.seek(0, Whence::Start),
            Err(Error::Unsupported { operation: "seek", .. })
        ));
        assert_eq!(state.tell().unwrap(), None);
    }

    #[test]
    fn relative_seek_accounts_for_buffered_input() {
        let mut seeker = MockSeekDriver::new();
        seeker
            .expect_seek()
            .with(eq(-6), eq(Whence::Current))
            .times(1)
            .returning(|_, _| Ok(4));

        let (mut state, device) = seekable(seeker);
        device.push_input(b"0123456789");

        let mut head = String::new();
        state.read_chars(Some(2), &mut head).unwrap();
        assert_eq!(state.input_buffered(), 8);

        // Two bytes forward from what the caller has seen.
        assert_eq!(state.seek(2, Whence::Current).unwrap(), 4);
        assert_eq!(state.input_buffered(), 0);
    }

    #[test]
    fn seek_flushes_pending_output() {
        let mut seeker = MockSeekDriver::new();
        seeker.expect_seek().returning(|_, _| Ok(0));

        let (mut state, device) = seekable(seeker);
        state.write_chars("pending").unwrap();
        assert!(device.written().is_empty());

        state.seek(0, Whence::Start).unwrap();
        assert_eq!(device.written(), b"pending");
    }

    #[test]
    fn seek_with_input_and_output_buffered_fails() {
        let mut seeker = MockSeekDriver::new();
        seeker.expect_seek().never();

        let (mut state, device) = seekable(seeker);
        device.push_input(b"abc");
        let mut one = String::new();
        state.read_chars(Some(1), &mut one).unwrap();
        state.write_chars("x").unwrap();

        let error = state.seek(0, Whence::End).unwrap_err();
        assert_eq!(error.io_kind(), Some(io::ErrorKind::InvalidInput));
    }

    #[test]
    fn tell_reports_logical_position() {
        let mut seeker = MockSeekDriver::new();
        seeker
            .expect_seek()
            .with(eq(0), eq(Whence::Current))
            .returning(|_, _| Ok(100));

        let (mut state, _device) = seekable(seeker);
        state.write_chars("12345").unwrap();

        assert_eq!(state.tell().unwrap(), Some(105));
    }

    #[test]
    fn truncate_uses_capability() {
        let mut truncater = MockTruncateDriver::new();
        truncater
            .expect_truncate()
            .with(eq(3))
            .times(1)
            .returning(|_| Ok(()));

        let (driver, device) = FakeDriver::new();
        let mut state = channel(driver.with_truncate(Box::new(truncater)));
        state.write_chars("abc").unwrap();

        state.truncate(3).unwrap();
        assert_eq!(device.written(), b"abc");
    }
}
