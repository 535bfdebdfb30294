// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io;

use memchr::memchr;
use tracing::{Level, event};

use crate::buffer::ChannelBuffer;
use crate::constants::MAX_BUFFER_SIZE;
use crate::driver::Below;
use crate::encoding::{EncoderState, encode_str};
use crate::flags::ChannelFlags;
use crate::state::ChannelState;
use crate::Result;

/// Outcome of asking the device for more input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fill {
    /// This many bytes were appended to the input queue.
    Data(usize),
    Eof,
    Blocked,
}

impl ChannelState {
    /// Appends more input to the input queue.
    ///
    /// Bytes pushed back into the top layer are delivered before the driver is asked for
    /// anything. The driver is asked for at most `request` bytes if given, otherwise for as
    /// much as fits into one buffer.
    pub(crate) fn fill_input(&mut self, request: Option<usize>) -> Result<Fill> {
        if self.flags.contains(ChannelFlags::STICKY_EOF) {
            self.set_flags(ChannelFlags::EOF);
            return Ok(Fill::Eof);
        }

        let top = self.top_mut();
        if !top.pushback.is_empty() {
            let moved: Vec<_> = top.pushback.drain(..).collect();
            let count = moved.iter().map(ChannelBuffer::len).sum();
            self.in_queue.extend(moved);
            self.input_arrived();
            return Ok(Fill::Data(count));
        }

        // Large requests that cannot be served from the queue get a buffer of their own, up to
        // the largest buffer size, so the driver sees as much of the budget as possible at once.
        let oversized = request
            .filter(|&r| r > self.buffer_size && self.in_queue.is_empty())
            .map(|r| r.min(MAX_BUFFER_SIZE));
        let reusable_tail = self
            .in_queue
            .back()
            .is_some_and(|tail| !tail.is_full() && !tail.is_shared());

        let mut buffer = match (oversized, reusable_tail) {
            (Some(request), _) => ChannelBuffer::allocate(request),
            (None, true) => self
                .in_queue
                .pop_back()
                .unwrap_or_else(|| self.spares.take_input(self.buffer_size)),
            (None, false) => self.spares.take_input(self.buffer_size),
        };

        let budget = request.map_or(buffer.space(), |r| r.min(buffer.space())).max(1);
        let level = self.top_level();

        let result = loop {
            let (top, rest) = self.layers.split_last_mut().expect(crate::state::ERR_NO_LAYERS);
            match top
                .driver
                .input(&mut Below::new(rest), &mut buffer.space_mut()[..budget])
            {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                result => break result,
            }
        };

        match result {
            Ok(0) => {
                self.return_input_buffer(buffer);
                self.set_flags(ChannelFlags::EOF);
                event!(Level::TRACE, message = "end of stream", channel = %self.name);
                Ok(Fill::Eof)
            }
            Ok(count) => {
                buffer.commit(count);
                self.in_queue.push_back(buffer);
                self.input_arrived();
                Ok(Fill::Data(count))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.return_input_buffer(buffer);
                self.set_flags(ChannelFlags::BLOCKED);
                Ok(Fill::Blocked)
            }
            Err(e) => {
                self.return_input_buffer(buffer);
                Err(self.driver_error(level, e))
            }
        }
    }

    fn return_input_buffer(&mut self, buffer: ChannelBuffer) {
        if buffer.is_empty() {
            self.recycle(buffer, false);
        } else {
            self.in_queue.push_back(buffer);
        }
    }

    fn input_arrived(&mut self) {
        if self.flags.contains(ChannelFlags::NEED_MORE_DATA) {
            self.flags.remove(ChannelFlags::NEED_MORE_DATA);
            self.interest_dirty = true;
        }
    }

    /// Reads up to `count` raw bytes into `dst`, bypassing encoding and translation but
    /// honoring the input eofchar.
    ///
    /// In blocking mode this keeps reading until `count` bytes arrived or the stream ended.
    pub(crate) fn read_bytes(&mut self, count: usize, dst: &mut Vec<u8>) -> Result<usize> {
        if count == 0 {
            return Ok(0);
        }

        self.check_readable()?;
        self.begin_read();

        if self.flags.contains(ChannelFlags::STICKY_EOF) {
            return Ok(0);
        }

        let mut copied = 0;
        while copied < count {
            if let Some(front) = self.in_queue.front_mut() {
                let take = front.len().min(count - copied);
                let chunk = &front.bytes()[..take];

                if let Some(eof_at) = self.input_eof_char.and_then(|c| memchr(c, chunk)) {
                    dst.extend_from_slice(&chunk[..eof_at]);
                    front.consume(eof_at);
                    copied += eof_at;
                    self.set_flags(ChannelFlags::EOF | ChannelFlags::STICKY_EOF);
                    self.interest_dirty = true;
                    break;
                }

                dst.extend_from_slice(chunk);
                front.consume(take);
                copied += take;

                if front.is_empty() {
                    if let Some(drained) = self.in_queue.pop_front() {
                        self.recycle(drained, false);
                    }
                }
                continue;
            }

            match self.fill_input(Some(count - copied)) {
                Ok(Fill::Data(_)) => {}
                Ok(Fill::Eof | Fill::Blocked) => break,
                Err(e) if copied > 0 => {
                    self.defer_error(e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        self.assert_invariants();
        Ok(copied)
    }

    /// Puts text back into the input queue, at the head so it is read next or at the tail so
    /// it is read after everything already buffered.
    ///
    /// The text is encoded with the channel encoding, in the byte order the input side has
    /// settled on and without a byte order mark. It passes through input end-of-line
    /// translation again when it is read, so text containing `\n` only reads back unchanged
    /// under translations that map `\n` to itself.
    pub(crate) fn unread(&mut self, text: &str, at_tail: bool) -> Result<()> {
        self.check_readable()?;

        if text.is_empty() {
            return Ok(());
        }

        let mut bytes = Vec::with_capacity(text.len());
        let encoding = self.decoder.mid_stream_encoding(self.encoding);
        encode_str(encoding, &mut EncoderState::default(), text, &mut bytes);

        let mut buffer = ChannelBuffer::allocate(bytes.len().max(self.buffer_size));
        buffer.put(&bytes);

        if at_tail {
            self.in_queue.push_back(buffer);
        } else {
            self.in_queue.push_front(buffer);
        }

        self.flags
            .remove(ChannelFlags::EOF | ChannelFlags::STICKY_EOF | ChannelFlags::BLOCKED);
        self.input_arrived();
        self.interest_dirty = true;
        Ok(())
    }
}
