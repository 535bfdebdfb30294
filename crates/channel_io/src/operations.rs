// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io;

use crate::flags::ChannelFlags;
use crate::state::ChannelState;
use crate::{ChannelId, ChannelSystem, Error, Result, Whence};

impl ChannelState {
    fn check_not_copy_source(&self) -> Result<()> {
        if self.copy_read.is_some() {
            return Err(Error::Busy(self.name.clone()));
        }
        Ok(())
    }

    fn check_not_copy_destination(&self) -> Result<()> {
        if self.copy_write.is_some() {
            return Err(Error::Busy(self.name.clone()));
        }
        Ok(())
    }
}

impl ChannelSystem {
    fn reader(&mut self, id: ChannelId) -> Result<&mut ChannelState> {
        let state = self.state_mut(id)?;
        state.check_not_copy_source()?;
        Ok(state)
    }

    fn writer(&mut self, id: ChannelId) -> Result<&mut ChannelState> {
        let state = self.state_mut(id)?;
        state.check_not_copy_destination()?;
        Ok(state)
    }

    /// Writes text, encoded with the channel encoding and with `\n` translated to the output
    /// line terminator.
    ///
    /// # Errors
    ///
    /// Fails if the channel is not open for writing, is the destination of a copy, or the
    /// device fails. Output queued during a failed write is discarded.
    pub fn write_chars(&mut self, id: ChannelId, text: &str) -> Result<()> {
        let result = self.writer(id)?.write_chars(text);
        self.refresh_interest(id);
        result
    }

    /// Writes raw bytes. End-of-line translation applies, encoding does not.
    ///
    /// # Errors
    ///
    /// Fails if the channel is not open for writing, is the destination of a copy, or the
    /// device fails.
    pub fn write_bytes(&mut self, id: ChannelId, data: &[u8]) -> Result<()> {
        let result = self.writer(id)?.write_bytes(data);
        self.refresh_interest(id);
        result
    }

    /// Hands all buffered output to the device. In non-blocking mode output the device does
    /// not accept right away is written in the background once the device is writable.
    ///
    /// # Errors
    ///
    /// Fails if the channel is not open for writing, is the destination of a copy, or the
    /// device fails.
    pub fn flush(&mut self, id: ChannelId) -> Result<()> {
        let state = self.writer(id)?;
        let result = state.check_writable().and_then(|()| {
            state.flags.insert(ChannelFlags::BUFFER_READY);
            state.flush(false)
        });
        self.refresh_interest(id);
        result
    }

    /// Reads one line, without its terminator, into `line`.
    ///
    /// Returns the number of characters appended, or `None` if no line is available because
    /// the stream ended or, in non-blocking mode, the line is not complete yet. In the latter
    /// case [`is_blocked`][Self::is_blocked] reports `true` and nothing is consumed.
    ///
    /// # Errors
    ///
    /// Fails if the channel is not open for reading, is the source of a copy, the input is
    /// not valid in the channel encoding, or the device fails.
    pub fn read_line(&mut self, id: ChannelId, line: &mut String) -> Result<Option<usize>> {
        let result = self.reader(id)?.read_line(line);
        self.refresh_interest(id);
        result
    }

    /// Reads up to `max` characters, or everything until the end of the stream if `max` is
    /// `None`, appending them to `target`. Returns how many characters were read.
    ///
    /// In non-blocking mode this returns what is available without waiting.
    ///
    /// # Errors
    ///
    /// Fails if the channel is not open for reading, is the source of a copy, the input is
    /// not valid in the channel encoding, or the device fails.
    pub fn read_chars(
        &mut self,
        id: ChannelId,
        max: Option<usize>,
        target: &mut String,
    ) -> Result<usize> {
        let result = self.reader(id)?.read_chars(max, target);
        self.refresh_interest(id);
        result
    }

    /// Reads up to `count` raw bytes, appending them to `target`. Encoding and end-of-line
    /// translation do not apply; the input end-of-file character does.
    ///
    /// # Errors
    ///
    /// Fails if the channel is not open for reading, is the source of a copy, or the device
    /// fails.
    pub fn read_bytes(&mut self, id: ChannelId, count: usize, target: &mut Vec<u8>) -> Result<usize> {
        let result = self.reader(id)?.read_bytes(count, target);
        self.refresh_interest(id);
        result
    }

    /// Puts text back into the input, to be read next or, with `at_tail`, after everything
    /// buffered so far.
    ///
    /// # Errors
    ///
    /// Fails if the channel is not open for reading or is the source of a copy.
    pub fn unread(&mut self, id: ChannelId, text: &str, at_tail: bool) -> Result<()> {
        let result = self.reader(id)?.unread(text, at_tail);
        self.refresh_interest(id);
        result
    }

    /// Whether the last read hit the end of the stream.
    ///
    /// # Errors
    ///
    /// Fails if the handle is no longer valid.
    pub fn eof(&self, id: ChannelId) -> Result<bool> {
        Ok(self.state(id)?.flags.contains(ChannelFlags::EOF))
    }

    /// Whether the last read in non-blocking mode stopped because no input was available.
    ///
    /// # Errors
    ///
    /// Fails if the handle is no longer valid.
    pub fn is_blocked(&self, id: ChannelId) -> Result<bool> {
        Ok(self.state(id)?.flags.contains(ChannelFlags::BLOCKED))
    }

    /// Bytes read from the device that were not consumed yet.
    ///
    /// # Errors
    ///
    /// Fails if the handle is no longer valid.
    pub fn input_buffered(&self, id: ChannelId) -> Result<usize> {
        Ok(self.state(id)?.input_buffered())
    }

    /// Bytes written that the device has not accepted yet.
    ///
    /// # Errors
    ///
    /// Fails if the handle is no longer valid.
    pub fn output_buffered(&self, id: ChannelId) -> Result<usize> {
        Ok(self.state(id)?.output_buffered())
    }

    /// Moves the device position. Buffered input is discarded and buffered output is written
    /// out first. Returns the new position.
    ///
    /// # Errors
    ///
    /// Fails if the channel takes part in a copy, the top driver cannot seek, both input and
    /// output are buffered, or the device fails.
    pub fn seek(&mut self, id: ChannelId, offset: i64, whence: Whence) -> Result<u64> {
        let state = self.reader(id)?;
        state.check_not_copy_destination()?;
        let result = state.seek(offset, whence);
        self.refresh_interest(id);
        result
    }

    /// The position of the next byte to be read or written, accounting for buffered data, or
    /// `None` if the top driver cannot seek.
    ///
    /// # Errors
    ///
    /// Fails if the handle is no longer valid or the device fails.
    pub fn tell(&mut self, id: ChannelId) -> Result<Option<u64>> {
        self.state_mut(id)?.tell()
    }

    /// Sets the length of the device after writing out buffered output.
    ///
    /// # Errors
    ///
    /// Fails if the channel is not open for writing, takes part in a copy, the top driver
    /// cannot truncate, or the device fails.
    pub fn truncate(&mut self, id: ChannelId, len: u64) -> Result<()> {
        let state = self.reader(id)?;
        state.check_not_copy_destination()?;
        let result = state.truncate(len);
        self.refresh_interest(id);
        result
    }

    /// Borrows the channel as a [`std::io`] reader and writer.
    ///
    /// Reads are raw and writes translate `\n` like [`write_bytes`][Self::write_bytes].
    pub fn stream(&mut self, id: ChannelId) -> ChannelStream<'_> {
        ChannelStream { system: self, id }
    }
}

/// A channel seen through [`io::Read`] and [`io::Write`].
///
/// A read that finds no input in non-blocking mode fails with [`io::ErrorKind::WouldBlock`].
#[derive(Debug)]
pub struct ChannelStream<'a> {
    system: &'a mut ChannelSystem,
    id: ChannelId,
}

impl io::Read for ChannelStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut target = Vec::with_capacity(buf.len());
        let count = self.system.read_bytes(self.id, buf.len(), &mut target)?;

        if count == 0 && !buf.is_empty() && self.system.is_blocked(self.id)? {
            return Err(io::ErrorKind::WouldBlock.into());
        }

        buf[..count].copy_from_slice(&target);
        Ok(count)
    }
}

impl io::Write for ChannelStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.system.write_bytes(self.id, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.system.flush(self.id)?)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;
    use crate::fake::{FakeDeviceHandle, FakeDriver};
    use crate::mocks::MockSeekDriver;
    use crate::{Encoding, Mode, SystemConfig, Translation};

    fn system() -> ChannelSystem {
        ChannelSystem::new(SystemConfig::default().without_std_channels())
    }

    fn channel(system: &mut ChannelSystem) -> (ChannelId, FakeDeviceHandle) {
        let (driver, device) = FakeDriver::new();
        let id = system.create_channel(Box::new(driver), Mode::all());
        system
            .set_translation(id, Some(Translation::Lf), Some(Translation::Lf))
            .unwrap();
        (id, device)
    }

    #[test]
    fn second_flush_writes_nothing() {
        let mut system = system();
        let (id, device) = channel(&mut system);

        system.write_chars(id, "data").unwrap();
        system.flush(id).unwrap();
        system.flush(id).unwrap();

        assert_eq!(device.output_calls(), [4]);
        assert_eq!(system.output_buffered(id).unwrap(), 0);
    }

    #[test]
    fn zero_length_read_leaves_flags_alone() {
        let mut system = system();
        let (id, device) = channel(&mut system);
        device.push_input(b"x");
        let mut rest = Vec::new();
        system.read_bytes(id, 10, &mut rest).unwrap();
        system.read_bytes(id, 10, &mut rest).unwrap();
        assert!(system.eof(id).unwrap());

        let calls = device.input_requests().len();
        assert_eq!(system.read_bytes(id, 0, &mut rest).unwrap(), 0);
        assert!(system.eof(id).unwrap());
        assert_eq!(device.input_requests().len(), calls);
    }

    #[test]
    fn unread_text_is_read_first() {
        let mut system = system();
        let (id, device) = channel(&mut system);
        device.push_input(b"world\n");

        system.unread(id, "hello ", false).unwrap();
        let mut line = String::new();
        assert_eq!(system.read_line(id, &mut line).unwrap(), Some(11));
        assert_eq!(line, "hello world");
    }

    #[test]
    fn unread_follows_detected_byte_order_without_mark() {
        let mut system = system();
        let (id, device) = channel(&mut system);
        system.set_encoding(id, Encoding::Utf16).unwrap();
        device.push_input(&[0xFE, 0xFF, 0x00, b'x', 0x00, b'\n']);

        let mut first = String::new();
        assert_eq!(system.read_chars(id, Some(1), &mut first).unwrap(), 1);
        assert_eq!(first, "x");

        system.unread(id, "ab", false).unwrap();
        let mut rest = String::new();
        system.read_chars(id, None, &mut rest).unwrap();
        assert_eq!(rest, "ab\n");
    }

    #[test]
    fn unread_text_is_translated_again() {
        let mut system = system();
        let (id, _device) = channel(&mut system);
        system.set_translation(id, Some(Translation::Cr), None).unwrap();

        system.unread(id, "a\rb", false).unwrap();
        let mut text = String::new();
        system.read_chars(id, None, &mut text).unwrap();
        assert_eq!(text, "a\nb");
    }

    #[test]
    fn unbounded_byte_read_uses_bounded_buffers() {
        let mut system = system();
        let (id, device) = channel(&mut system);
        device.push_input(b"hello");

        let mut data = Vec::new();
        assert_eq!(system.read_bytes(id, usize::MAX, &mut data).unwrap(), 5);
        assert_eq!(data, b"hello");
        assert!(system.eof(id).unwrap());
        assert!(
            device
                .input_requests()
                .iter()
                .all(|&request| request <= crate::MAX_BUFFER_SIZE)
        );
    }

    #[test]
    fn seek_accounts_for_buffered_input() {
        let mut system = system();
        let mut seeker = MockSeekDriver::new();
        seeker
            .expect_seek()
            .withf(|offset, whence| *offset == -3 && *whence == Whence::Current)
            .times(1)
            .returning(|_, _| Ok(7));

        let (driver, device) = FakeDriver::new();
        let driver = driver.with_seek(Box::new(seeker));
        let id = system.create_channel(Box::new(driver), Mode::all());
        device.push_input(b"abcdef");

        let mut head = Vec::new();
        system.read_bytes(id, 3, &mut head).unwrap();
        assert_eq!(system.input_buffered(id).unwrap(), 3);

        assert_eq!(system.seek(id, 0, Whence::Current).unwrap(), 7);
        assert_eq!(system.input_buffered(id).unwrap(), 0);
    }

    #[test]
    fn positions_are_unknown_without_seek() {
        let mut system = system();
        let (id, _device) = channel(&mut system);

        assert_eq!(system.tell(id).unwrap(), None);
        assert!(matches!(
            system.seek(id, 0, Whence::Start),
            Err(Error::Unsupported { operation: "seek", .. })
        ));
        assert!(matches!(
            system.truncate(id, 0),
            Err(Error::Unsupported { operation: "truncate", .. })
        ));
    }

    #[test]
    fn stream_adapter_reads_and_writes() {
        let mut system = system();
        let (id, device) = channel(&mut system);
        device.push_input(b"raw");

        let mut stream = system.stream(id);
        let mut buf = [0; 8];
        assert_eq!(stream.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"raw");

        stream.write_all(b"out").unwrap();
        stream.flush().unwrap();
        assert_eq!(device.written(), b"out");
    }

    #[test]
    fn stream_adapter_reports_would_block() {
        let mut system = system();
        let (id, device) = channel(&mut system);
        device.set_eof_when_drained(false);
        system.set_blocking(id, false).unwrap();

        let mut buf = [0; 4];
        let error = system.stream(id).read(&mut buf).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::WouldBlock);
    }
}
