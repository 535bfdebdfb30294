// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io;

use memchr::memchr;
use tracing::{Level, event};

use crate::driver::Below;
use crate::encoding::{MAX_ENCODED_LEN, encode_char};
use crate::flags::ChannelFlags;
use crate::state::{ChannelState, ERR_NO_LAYERS};
use crate::Result;

impl ChannelState {
    /// Encodes and translates `text` into the output queue, flushing whatever the buffering
    /// mode requires.
    pub(crate) fn write_chars(&mut self, text: &str) -> Result<()> {
        self.check_writable()?;

        let newline = self.output_translation.output_newline();
        let mut pending = Vec::with_capacity(text.len().min(self.buffer_size) + MAX_ENCODED_LEN);
        let mut scratch = [0; MAX_ENCODED_LEN];
        let mut saw_newline = false;

        for ch in text.chars() {
            if ch == '\n' {
                saw_newline = true;
                for translated in newline.chars() {
                    let len = encode_char(self.encoding, &mut self.encoder, translated, &mut scratch);
                    pending.extend_from_slice(&scratch[..len]);
                }
            } else {
                let len = encode_char(self.encoding, &mut self.encoder, ch, &mut scratch);
                pending.extend_from_slice(&scratch[..len]);
            }

            if pending.len() >= self.buffer_size {
                self.put_output(&pending)?;
                pending.clear();
            }
        }

        self.put_output(&pending)?;
        self.finish_write(saw_newline)
    }

    /// Writes raw bytes into the output queue. End-of-line translation applies, encoding
    /// does not.
    pub(crate) fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.check_writable()?;

        let newline = self.output_translation.output_newline().as_bytes();
        let saw_newline = memchr(b'\n', data).is_some();

        if newline == b"\n" || !saw_newline {
            self.put_output(data)?;
        } else {
            for (index, segment) in data.split(|&b| b == b'\n').enumerate() {
                if index > 0 {
                    self.put_output(newline)?;
                }
                self.put_output(segment)?;
            }
        }

        self.finish_write(saw_newline)
    }

    /// Appends bytes to the current output buffer. Every buffer that fills up is queued and
    /// flushed right away.
    pub(crate) fn put_output(&mut self, mut bytes: &[u8]) -> Result<()> {
        while !bytes.is_empty() {
            let buffer_size = self.buffer_size;
            let spares = &mut self.spares;
            let current = self
                .current_output
                .get_or_insert_with(|| spares.take_output(buffer_size));

            let count = current.put(bytes);
            bytes = &bytes[count..];

            if current.is_full() {
                if let Some(full) = self.current_output.take() {
                    self.out_queue.push_back(full);
                }
                self.flush(false)?;
            }
        }
        Ok(())
    }

    fn finish_write(&mut self, saw_newline: bool) -> Result<()> {
        let flush_now = self.flags.contains(ChannelFlags::UNBUFFERED)
            || (saw_newline && self.flags.contains(ChannelFlags::LINE_BUFFERED));

        if flush_now {
            self.flags.insert(ChannelFlags::BUFFER_READY);
            self.flush(false)?;
        }
        Ok(())
    }

    /// Hands queued output to the top driver.
    ///
    /// In non-blocking mode a device that would block leaves the rest of the queue for the
    /// background flush, which runs when the device reports it is writable. Output is only
    /// written from there while that flush is scheduled. A hard failure discards all queued
    /// output; when called from the background flush the error is kept for the next caller.
    pub(crate) fn flush(&mut self, from_background: bool) -> Result<()> {
        if self.flags.contains(ChannelFlags::BUFFER_READY) {
            self.flags.remove(ChannelFlags::BUFFER_READY);
            if let Some(current) = self.current_output.take() {
                if current.is_empty() {
                    self.current_output = Some(current);
                } else {
                    self.out_queue.push_back(current);
                }
            }
        }

        if self.flags.contains(ChannelFlags::BG_FLUSH_SCHEDULED) && !from_background {
            return Ok(());
        }

        let level = self.top_level();

        loop {
            let Some(front) = self.out_queue.front_mut() else {
                break;
            };

            let (top, rest) = self.layers.split_last_mut().expect(ERR_NO_LAYERS);
            let result = top.driver.output(&mut Below::new(rest), front.bytes());

            match result {
                Ok(count) if count > 0 => {
                    front.consume(count.min(front.len()));
                    if front.is_empty() {
                        if let Some(written) = self.out_queue.pop_front() {
                            self.recycle(written, false);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Ok(_) => {
                    if self.output_blocked(from_background) {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if self.output_blocked(from_background) {
                        break;
                    }
                }
                Err(e) => {
                    let error = self.driver_error(level, e);
                    event!(
                        Level::DEBUG,
                        message = "output failed, discarding queued output",
                        channel = %self.name,
                        error = %error
                    );
                    self.discard_output();
                    self.cancel_background_flush();

                    if from_background {
                        self.defer_error(error);
                        break;
                    }
                    return Err(error);
                }
            }
        }

        if self.out_queue.is_empty() {
            self.cancel_background_flush();
        }
        Ok(())
    }

    // Returns whether the flush loop should stop. Blocking channels keep retrying.
    fn output_blocked(&mut self, from_background: bool) -> bool {
        if !self.is_nonblocking() && !from_background {
            return false;
        }

        if !self.flags.contains(ChannelFlags::BG_FLUSH_SCHEDULED) {
            self.flags.insert(ChannelFlags::BG_FLUSH_SCHEDULED);
            self.interest_dirty = true;
            event!(
                Level::TRACE,
                message = "background flush scheduled",
                channel = %self.name
            );
        }
        true
    }

    fn cancel_background_flush(&mut self) {
        if self.flags.contains(ChannelFlags::BG_FLUSH_SCHEDULED) {
            self.flags.remove(ChannelFlags::BG_FLUSH_SCHEDULED);
            self.interest_dirty = true;
        }
    }
}
