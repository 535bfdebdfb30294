// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::VecDeque;
use std::io;

use tracing::{Level, event};

use crate::buffer::{ChannelBuffer, SpareBuffers};
use crate::encoding::{DecoderState, EncoderState};
use crate::events::HandlerRecord;
use crate::flags::ChannelFlags;
use crate::lifecycle::CloseCallbackRecord;
use crate::system::{ContextId, CopyId};
use crate::{ChannelDriver, Encoding, Error, Interest, Mode, Result, SystemConfig, Translation};

pub(crate) const ERR_NO_LAYERS: &str = "an open channel always has at least one driver layer";

/// One driver in a channel's stack.
#[derive(Debug)]
pub(crate) struct Layer {
    pub(crate) driver: Box<dyn ChannelDriver>,
    pub(crate) mode: Mode,
    // Input that was buffered by the channel when the layer above was stacked. Served to the
    // layer above before any new bytes from this layer's driver.
    pub(crate) pushback: VecDeque<ChannelBuffer>,
}

impl Layer {
    pub(crate) fn new(driver: Box<dyn ChannelDriver>, mode: Mode) -> Self {
        Self {
            driver,
            mode,
            pushback: VecDeque::new(),
        }
    }
}

/// Everything the channel system knows about one open channel.
#[derive(Debug)]
pub(crate) struct ChannelState {
    pub(crate) name: String,
    pub(crate) layers: Vec<Layer>,
    pub(crate) mode: Mode,
    pub(crate) flags: ChannelFlags,

    pub(crate) encoding: Encoding,
    pub(crate) decoder: DecoderState,
    pub(crate) encoder: EncoderState,
    pub(crate) input_translation: Translation,
    pub(crate) output_translation: Translation,
    pub(crate) input_eof_char: Option<u8>,
    pub(crate) output_eof_char: Option<u8>,
    pub(crate) buffer_size: usize,

    pub(crate) in_queue: VecDeque<ChannelBuffer>,
    pub(crate) out_queue: VecDeque<ChannelBuffer>,
    pub(crate) current_output: Option<ChannelBuffer>,
    pub(crate) spares: SpareBuffers,

    // Mask most recently passed to the drivers' watch.
    pub(crate) interest: Interest,
    // Set when a flag that influences the interest mask changed.
    pub(crate) interest_dirty: bool,
    pub(crate) timer_armed: bool,
    pub(crate) handlers: Vec<HandlerRecord>,
    pub(crate) close_callbacks: Vec<CloseCallbackRecord>,

    pub(crate) ref_count: usize,
    pub(crate) epoch: u64,
    pub(crate) owner: Option<ContextId>,
    pub(crate) unreported_error: Option<Error>,
    pub(crate) copy_read: Option<CopyId>,
    pub(crate) copy_write: Option<CopyId>,

    // Bytes consumed per decoded character in the last character read, in thousandths.
    pub(crate) bytes_per_char_milli: usize,
}

impl ChannelState {
    pub(crate) fn new(
        name: String,
        driver: Box<dyn ChannelDriver>,
        mode: Mode,
        config: &SystemConfig,
    ) -> Self {
        let encoding = config.default_encoding();

        Self {
            name,
            layers: vec![Layer::new(driver, mode)],
            mode,
            flags: ChannelFlags::empty(),
            encoding,
            decoder: DecoderState::default(),
            encoder: EncoderState::default(),
            input_translation: Translation::Auto,
            output_translation: Translation::PLATFORM,
            input_eof_char: None,
            output_eof_char: None,
            buffer_size: config.buffer_size(),
            in_queue: VecDeque::new(),
            out_queue: VecDeque::new(),
            current_output: None,
            spares: SpareBuffers::default(),
            interest: Interest::empty(),
            interest_dirty: false,
            timer_armed: false,
            handlers: Vec::new(),
            close_callbacks: Vec::new(),
            ref_count: 0,
            epoch: 0,
            owner: None,
            unreported_error: None,
            copy_read: None,
            copy_write: None,
            bytes_per_char_milli: encoding.typical_char_len() * 1000,
        }
    }

    pub(crate) fn top_mut(&mut self) -> &mut Layer {
        self.layers.last_mut().expect(ERR_NO_LAYERS)
    }

    pub(crate) fn top(&self) -> &Layer {
        self.layers.last().expect(ERR_NO_LAYERS)
    }

    pub(crate) fn is_nonblocking(&self) -> bool {
        self.flags.contains(ChannelFlags::NONBLOCKING)
    }

    pub(crate) fn set_flags(&mut self, flags: ChannelFlags) {
        self.flags.insert(flags);
        self.flags.assert_consistent();
    }

    fn check_open(&self) -> Result<()> {
        if self
            .flags
            .intersects(ChannelFlags::CLOSED | ChannelFlags::DEAD)
        {
            return Err(Error::Closed(self.name.clone()));
        }
        Ok(())
    }

    /// Verifies the channel can take part in input and surfaces any deferred error.
    pub(crate) fn check_readable(&mut self) -> Result<()> {
        self.check_open()?;
        if !self.mode.contains(Mode::READ) {
            return Err(Error::NotReadable(self.name.clone()));
        }
        self.take_unreported_error()
    }

    /// Verifies the channel can take part in output and surfaces any deferred error.
    pub(crate) fn check_writable(&mut self) -> Result<()> {
        self.check_open()?;
        if !self.mode.contains(Mode::WRITE) || self.flags.contains(ChannelFlags::CLOSED_WRITE) {
            return Err(Error::NotWritable(self.name.clone()));
        }
        self.take_unreported_error()
    }

    pub(crate) fn check_usable(&mut self) -> Result<()> {
        self.check_open()?;
        self.take_unreported_error()
    }

    fn take_unreported_error(&mut self) -> Result<()> {
        match self.unreported_error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Keeps an error that could not be reported to a caller. The first one wins.
    pub(crate) fn defer_error(&mut self, error: Error) {
        event!(
            Level::DEBUG,
            message = "deferring channel error",
            channel = %self.name,
            error = %error
        );

        if self.unreported_error.is_none() {
            self.unreported_error = Some(error);
        }
    }

    /// Converts a failure of the driver at `level` into a channel error, preferring the
    /// driver's own description of it.
    pub(crate) fn driver_error(&mut self, level: usize, error: io::Error) -> Error {
        let payload = self
            .layers
            .get_mut(level)
            .and_then(|layer| layer.driver.take_error_payload());
        Error::from_driver(error, payload)
    }

    pub(crate) fn top_level(&self) -> usize {
        self.layers.len() - 1
    }

    /// Bytes read from the device but not yet consumed by the caller.
    pub(crate) fn input_buffered(&self) -> usize {
        let queued: usize = self.in_queue.iter().map(ChannelBuffer::len).sum();
        let pushed_back: usize = self.top().pushback.iter().map(ChannelBuffer::len).sum();
        queued + pushed_back
    }

    /// Bytes written by the caller but not yet accepted by the device.
    pub(crate) fn output_buffered(&self) -> usize {
        let queued: usize = self.out_queue.iter().map(ChannelBuffer::len).sum();
        queued + self.current_output.as_ref().map_or(0, ChannelBuffer::len)
    }

    pub(crate) fn has_pending_output(&self) -> bool {
        !self.out_queue.is_empty()
            || self
                .current_output
                .as_ref()
                .is_some_and(|buffer| !buffer.is_empty())
    }

    /// Whether buffered input could satisfy a reader without touching the device.
    pub(crate) fn has_ready_input(&self) -> bool {
        self.flags.contains(ChannelFlags::STICKY_EOF)
            || self.in_queue.iter().any(|buffer| !buffer.is_empty())
    }

    pub(crate) fn recycle(&mut self, buffer: ChannelBuffer, force_discard: bool) {
        self.spares
            .recycle(buffer, self.buffer_size, self.mode, force_discard);
    }

    pub(crate) fn discard_input(&mut self) {
        while let Some(buffer) = self.in_queue.pop_front() {
            self.recycle(buffer, false);
        }
        self.decoder = DecoderState::default();
        self.flags.remove(
            ChannelFlags::EOF
                | ChannelFlags::STICKY_EOF
                | ChannelFlags::BLOCKED
                | ChannelFlags::INPUT_SAW_CR
                | ChannelFlags::NEED_MORE_DATA,
        );
        self.interest_dirty = true;
    }

    pub(crate) fn discard_output(&mut self) {
        while let Some(buffer) = self.out_queue.pop_front() {
            self.recycle(buffer, false);
        }
        if let Some(buffer) = self.current_output.take() {
            self.recycle(buffer, false);
        }
        self.flags.remove(ChannelFlags::BUFFER_READY);
    }

    /// Passes the blocking mode to every driver in the stack.
    pub(crate) fn set_blocking(&mut self, blocking: bool) -> Result<()> {
        for level in 0..self.layers.len() {
            if let Err(e) = self.layers[level].driver.set_blocking(blocking) {
                return Err(self.driver_error(level, e));
            }
        }

        if blocking {
            self.flags.remove(ChannelFlags::NONBLOCKING);
            // Output parked for the background flush is written out by the next blocking flush.
            if self.flags.contains(ChannelFlags::BG_FLUSH_SCHEDULED) {
                self.flags.remove(ChannelFlags::BG_FLUSH_SCHEDULED);
                self.interest_dirty = true;
            }
        } else {
            self.flags.insert(ChannelFlags::NONBLOCKING);
        }
        Ok(())
    }

    /// Clears the per-operation input status before a read starts.
    pub(crate) fn begin_read(&mut self) {
        self.flags.remove(ChannelFlags::BLOCKED);
        if !self.flags.contains(ChannelFlags::STICKY_EOF) {
            self.flags.remove(ChannelFlags::EOF);
        }
    }

    /// Panics if the channel reached a state that no operation can legitimately produce.
    pub(crate) fn assert_invariants(&self) {
        self.flags.assert_consistent();
        debug_assert!(
            !self.flags.contains(ChannelFlags::EOF)
                || self.flags.contains(ChannelFlags::STICKY_EOF)
                || self.in_queue.iter().all(ChannelBuffer::is_empty),
            "channel at end of stream still holds buffered input"
        );
    }
}
