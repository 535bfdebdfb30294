// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use tracing::{Level, event};

use crate::events::{HandlerId, HandlerKind, Timer};
use crate::flags::ChannelFlags;
use crate::read::Fill;
use crate::state::ChannelState;
use crate::system::CopyId;
use crate::{ChannelId, ChannelSystem, Encoding, Error, Interest, Result, Translation};

/// Receives the outcome of an asynchronous copy: the amount transferred and the error that
/// ended it, if any.
///
/// The amount is counted in bytes when the copy moved raw bytes and in characters when it
/// had to decode and re-encode.
pub type CopyCallback = Box<dyn FnOnce(&mut ChannelSystem, u64, Option<Error>)>;

/// How data gets from the source to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CopyStrategy {
    /// Input buffers are relinked into the destination's output queue untouched.
    MoveBuffers,
    /// Raw bytes are copied; the destination applies its end-of-line translation.
    Bytes,
    /// Text is decoded from the source and encoded for the destination.
    Chars,
}

/// Picks the cheapest strategy that produces the same output as copying decoded text.
pub(crate) fn copy_strategy(src: &ChannelState, dst: &ChannelState) -> CopyStrategy {
    let raw_input = matches!(src.input_translation, Translation::Lf | Translation::Binary);
    let same_encoding = src.encoding == dst.encoding;

    if !raw_input || !(same_encoding || src.encoding == Encoding::Binary) {
        return CopyStrategy::Chars;
    }

    if same_encoding
        && dst.output_translation.is_transparent_output()
        && src.input_eof_char.is_none()
        && dst.output_eof_char.is_none()
    {
        CopyStrategy::MoveBuffers
    } else {
        CopyStrategy::Bytes
    }
}

#[derive(Debug, Clone, Copy)]
struct SavedModes {
    nonblocking: bool,
    buffering: ChannelFlags,
}

impl SavedModes {
    fn capture(state: &ChannelState) -> Self {
        Self {
            nonblocking: state.is_nonblocking(),
            buffering: state.flags & (ChannelFlags::LINE_BUFFERED | ChannelFlags::UNBUFFERED),
        }
    }
}

/// One copy between two channels that is in progress.
#[derive(derive_more::Debug)]
pub(crate) struct CopyState {
    src: ChannelId,
    dst: ChannelId,
    // `None` copies until end of stream.
    remaining: Option<u64>,
    total: u64,
    // The source reached end of stream. The copy ends once the destination drained.
    source_done: bool,
    strategy: CopyStrategy,
    saved_src: SavedModes,
    saved_dst: SavedModes,
    #[debug(skip)]
    callback: Option<CopyCallback>,
    // The handler the copy waits on, if it waits.
    waiting: Option<(ChannelId, HandlerId)>,
    outcome: Option<Error>,
    #[debug(skip)]
    scratch: Vec<u8>,
}

enum Transfer {
    Moved(u64),
    Eof,
    Blocked,
}

enum Step {
    Done,
    Wait(ChannelId, Interest),
    Failed(Error),
}

fn read_error(state: &ChannelState, error: Error) -> Error {
    Error::CopyRead {
        channel: state.name.clone(),
        source: Box::new(error),
    }
}

fn write_error(state: &ChannelState, error: Error) -> Error {
    Error::CopyWrite {
        channel: state.name.clone(),
        source: Box::new(error),
    }
}

impl ChannelSystem {
    /// Copies from `src` to `dst` until `size` units were transferred, or until the end of the
    /// source if `size` is `None`, and returns the amount transferred.
    ///
    /// Both channels are in blocking mode and the destination is unbuffered for the
    /// duration of the copy. Their previous modes are restored afterwards.
    ///
    /// # Errors
    ///
    /// Fails if a channel is not open for its role or already takes part in a copy in that
    /// role. Failures of the transfer name the channel they happened on.
    pub fn copy(&mut self, src: ChannelId, dst: ChannelId, size: Option<u64>) -> Result<u64> {
        let copy = self.start_copy(src, dst, size, None)?;

        let error = match self.copy_steps(copy) {
            Step::Done | Step::Wait(..) => None,
            Step::Failed(error) => Some(error),
        };

        let total = self
            .finish_copy(copy)
            .map_or(0, |(total, _, _)| total);
        self.refresh_interest(src);
        self.refresh_interest(dst);

        match error {
            Some(error) => Err(error),
            None => Ok(total),
        }
    }

    /// Starts copying from `src` to `dst` in the background and returns right away.
    ///
    /// Both channels are switched to non-blocking mode and the copy advances whenever the
    /// source is readable or the destination writable. `callback` is called from
    /// [`run_timers`][Self::run_timers] once the copy is complete, never from this call, even
    /// if there is nothing to copy.
    ///
    /// # Errors
    ///
    /// Fails if a channel is not open for its role or already takes part in a copy in that
    /// role.
    pub fn copy_async(
        &mut self,
        src: ChannelId,
        dst: ChannelId,
        size: Option<u64>,
        callback: CopyCallback,
    ) -> Result<CopyId> {
        let copy = self.start_copy(src, dst, size, Some(callback))?;
        self.copy_ready(copy);
        Ok(copy)
    }

    /// Stops a background copy without calling its callback. Returns `false` if the copy is
    /// no longer in progress.
    pub fn cancel_copy(&mut self, copy: CopyId) -> bool {
        self.finish_copy(copy).is_some()
    }

    /// Whether the copy has not finished yet.
    #[must_use]
    pub fn is_copy_active(&self, copy: CopyId) -> bool {
        self.copies.contains_key(&copy)
    }

    fn start_copy(
        &mut self,
        src: ChannelId,
        dst: ChannelId,
        size: Option<u64>,
        callback: Option<CopyCallback>,
    ) -> Result<CopyId> {
        let src_state = self.state_mut(src)?;
        src_state.check_readable()?;
        if src_state.copy_read.is_some() {
            return Err(Error::Busy(src_state.name.clone()));
        }

        let dst_state = self.state_mut(dst)?;
        dst_state.check_writable()?;
        if dst_state.copy_write.is_some() {
            return Err(Error::Busy(dst_state.name.clone()));
        }

        let strategy = copy_strategy(self.state(src)?, self.state(dst)?);
        let saved_src = SavedModes::capture(self.state(src)?);
        let saved_dst = SavedModes::capture(self.state(dst)?);
        let blocking = callback.is_none();

        let copy = CopyId(self.next_serial());

        let src_state = self.state_mut(src)?;
        src_state.set_blocking(blocking)?;
        src_state.copy_read = Some(copy);

        let dst_state = self.state_mut(dst)?;
        if let Err(error) = dst_state.set_blocking(blocking) {
            self.restore_modes(src, saved_src);
            if let Ok(state) = self.state_mut(src) {
                state.copy_read = None;
            }
            return Err(error);
        }
        dst_state.flags.remove(ChannelFlags::LINE_BUFFERED);
        dst_state.flags.insert(ChannelFlags::UNBUFFERED);
        dst_state.copy_write = Some(copy);

        event!(
            Level::DEBUG,
            message = "copy started",
            copy = %copy,
            src = %src,
            dst = %dst,
            strategy = ?strategy,
            size = ?size
        );

        self.copies.insert(
            copy,
            CopyState {
                src,
                dst,
                remaining: size,
                total: 0,
                source_done: false,
                strategy,
                saved_src,
                saved_dst,
                callback,
                waiting: None,
                outcome: None,
                scratch: Vec::new(),
            },
        );
        Ok(copy)
    }

    /// Advances a background copy as far as the devices allow.
    pub(crate) fn copy_ready(&mut self, copy: CopyId) {
        let Some(waiting) = self.copies.get_mut(&copy).and_then(|state| state.waiting.take()) else {
            return self.advance_copy(copy);
        };

        let (channel, handler) = waiting;
        let _ = self.delete_handler(channel, handler);
        self.advance_copy(copy);
    }

    fn advance_copy(&mut self, copy: CopyId) {
        let Some((src, dst)) = self.copies.get(&copy).map(|state| (state.src, state.dst)) else {
            return;
        };

        match self.copy_steps(copy) {
            Step::Wait(channel, interest) => {
                match self.add_handler(channel, interest, HandlerKind::Copy(copy)) {
                    Ok(handler) => {
                        if let Some(state) = self.copies.get_mut(&copy) {
                            state.waiting = Some((channel, handler));
                        }
                    }
                    Err(error) => self.schedule_copy_completion(copy, Some(error)),
                }
            }
            Step::Done => self.schedule_copy_completion(copy, None),
            Step::Failed(error) => self.schedule_copy_completion(copy, Some(error)),
        }

        self.refresh_interest(src);
        self.refresh_interest(dst);
    }

    fn schedule_copy_completion(&mut self, copy: CopyId, error: Option<Error>) {
        if let Some(state) = self.copies.get_mut(&copy) {
            state.outcome = error;
            self.timers.push_back(Timer::CopyFinished(copy));
        }
    }

    /// Ends a completed background copy and calls its callback.
    pub(crate) fn complete_copy(&mut self, copy: CopyId) {
        if let Some((total, error, Some(callback))) = self.finish_copy(copy) {
            callback(self, total, error);
        }
    }

    fn copy_steps(&mut self, copy: CopyId) -> Step {
        loop {
            let Some(state) = self.copies.get(&copy) else {
                return Step::Done;
            };
            let (src, dst, strategy, remaining, source_done) = (
                state.src,
                state.dst,
                state.strategy,
                state.remaining,
                state.source_done,
            );

            // Nothing more is read while the destination still has output parked.
            match self.state(dst) {
                Ok(state) if state.flags.contains(ChannelFlags::BG_FLUSH_SCHEDULED) => {
                    return Step::Wait(dst, Interest::WRITABLE);
                }
                Ok(_) => {}
                Err(error) => return Step::Failed(error),
            }

            if source_done || remaining == Some(0) {
                return Step::Done;
            }

            let chunk = match self.state(src) {
                Ok(state) => state.buffer_size,
                Err(error) => return Step::Failed(error),
            };
            let limit = remaining.map_or(chunk, |remaining| {
                usize::try_from(remaining).map_or(chunk, |remaining| remaining.min(chunk))
            });

            let transfer = match strategy {
                CopyStrategy::MoveBuffers => self.move_buffers(src, dst, limit),
                CopyStrategy::Bytes => self.copy_bytes(copy, src, dst, limit),
                CopyStrategy::Chars => self.copy_chars(src, dst, limit),
            };

            let at_eof = match transfer {
                Ok(Transfer::Moved(count)) => {
                    if let Some(state) = self.copies.get_mut(&copy) {
                        state.total += count;
                        state.remaining = state.remaining.map(|r| r.saturating_sub(count));
                    }
                    self.state(src).is_ok_and(|state| {
                        state.flags.contains(ChannelFlags::EOF) && !state.has_ready_input()
                    })
                }
                Ok(Transfer::Eof) => true,
                Ok(Transfer::Blocked) => return Step::Wait(src, Interest::READABLE),
                Err(error) => return Step::Failed(error),
            };

            if at_eof {
                if let Some(state) = self.copies.get_mut(&copy) {
                    state.source_done = true;
                }
            }
        }
    }

    // Makes at least one byte available in the source's input queue, reading from the device
    // at most once so that slow devices do not hold up the copy.
    fn prime_source(state: &mut ChannelState, limit: usize) -> Result<Option<Transfer>> {
        if state.flags.contains(ChannelFlags::STICKY_EOF) {
            return Ok(Some(Transfer::Eof));
        }
        if state.in_queue.iter().any(|buffer| !buffer.is_empty())
            || state.top().pushback.iter().any(|buffer| !buffer.is_empty())
        {
            return Ok(None);
        }

        state.begin_read();
        match state.fill_input(Some(limit)) {
            Ok(Fill::Data(_)) => Ok(None),
            Ok(Fill::Eof) => Ok(Some(Transfer::Eof)),
            Ok(Fill::Blocked) => Ok(Some(Transfer::Blocked)),
            Err(error) => Err(read_error(state, error)),
        }
    }

    fn end_of_read(state: &ChannelState) -> Transfer {
        if state.flags.contains(ChannelFlags::EOF) {
            Transfer::Eof
        } else {
            Transfer::Blocked
        }
    }

    fn move_buffers(&mut self, src: ChannelId, dst: ChannelId, limit: usize) -> Result<Transfer> {
        let state = self.state_mut(src)?;
        if let Some(transfer) = Self::prime_source(state, limit)? {
            return Ok(transfer);
        }

        let pushed_back: Vec<_> = state.top_mut().pushback.drain(..).collect();
        for buffer in pushed_back.into_iter().rev() {
            state.in_queue.push_front(buffer);
        }

        let mut moved = Vec::new();
        let mut count = 0;
        while count < limit {
            let Some(mut front) = state.in_queue.pop_front() else {
                break;
            };
            if front.is_empty() {
                state.recycle(front, false);
                continue;
            }
            if count + front.len() > limit {
                let rest = front.split_off(limit - count);
                state.in_queue.push_front(rest);
            }
            count += front.len();
            moved.push(front);
        }
        state.interest_dirty = true;

        if count == 0 {
            return Ok(Self::end_of_read(state));
        }

        let state = self.state_mut(dst)?;
        state
            .check_writable()
            .map_err(|error| write_error(state, error))?;

        if let Some(current) = state.current_output.take() {
            if current.is_empty() {
                state.recycle(current, false);
            } else {
                state.out_queue.push_back(current);
            }
        }
        state.out_queue.extend(moved);
        state
            .flush(false)
            .map_err(|error| write_error(state, error))?;

        Ok(Transfer::Moved(count as u64))
    }

    fn copy_bytes(
        &mut self,
        copy: CopyId,
        src: ChannelId,
        dst: ChannelId,
        limit: usize,
    ) -> Result<Transfer> {
        let mut scratch = self
            .copies
            .get_mut(&copy)
            .map(|state| std::mem::take(&mut state.scratch))
            .unwrap_or_default();
        scratch.clear();

        let result = self.copy_bytes_with(&mut scratch, src, dst, limit);

        if let Some(state) = self.copies.get_mut(&copy) {
            state.scratch = scratch;
        }
        result
    }

    fn copy_bytes_with(
        &mut self,
        scratch: &mut Vec<u8>,
        src: ChannelId,
        dst: ChannelId,
        limit: usize,
    ) -> Result<Transfer> {
        let state = self.state_mut(src)?;
        if let Some(transfer) = Self::prime_source(state, limit)? {
            return Ok(transfer);
        }

        let available = state.input_buffered().min(limit);
        let count = state
            .read_bytes(available, scratch)
            .map_err(|error| read_error(state, error))?;
        if count == 0 {
            return Ok(Self::end_of_read(state));
        }

        let state = self.state_mut(dst)?;
        state
            .write_bytes(scratch)
            .map_err(|error| write_error(state, error))?;

        Ok(Transfer::Moved(count as u64))
    }

    fn copy_chars(&mut self, src: ChannelId, dst: ChannelId, limit: usize) -> Result<Transfer> {
        let state = self.state_mut(src)?;
        let mut text = String::new();
        let count = state
            .read_chars(Some(limit), &mut text)
            .map_err(|error| read_error(state, error))?;
        if count == 0 {
            return Ok(Self::end_of_read(state));
        }

        let state = self.state_mut(dst)?;
        state
            .write_chars(&text)
            .map_err(|error| write_error(state, error))?;

        Ok(Transfer::Moved(count as u64))
    }

    fn restore_modes(&mut self, id: ChannelId, saved: SavedModes) {
        let Ok(state) = self.state_mut(id) else {
            return;
        };

        if let Err(error) = state.set_blocking(!saved.nonblocking) {
            event!(
                Level::ERROR,
                message = "restoring blocking mode after copy failed",
                channel = %state.name,
                error = %error
            );
        }
    }

    // Removes the copy and puts both channels back the way they were. Returns the total, the
    // error that ended the copy and the callback if the copy was still in progress.
    fn finish_copy(&mut self, copy: CopyId) -> Option<(u64, Option<Error>, Option<CopyCallback>)> {
        let mut state = self.copies.remove(&copy)?;

        if let Some((channel, handler)) = state.waiting.take() {
            let _ = self.delete_handler(channel, handler);
        }

        self.restore_modes(state.src, state.saved_src);
        if let Ok(src) = self.state_mut(state.src) {
            src.copy_read = None;
        }

        self.restore_modes(state.dst, state.saved_dst);
        if let Ok(dst) = self.state_mut(state.dst) {
            dst.copy_write = None;
            dst.flags
                .remove(ChannelFlags::LINE_BUFFERED | ChannelFlags::UNBUFFERED);
            dst.flags.insert(state.saved_dst.buffering);
        }

        event!(
            Level::DEBUG,
            message = "copy finished",
            copy = %copy,
            total = state.total,
            error = ?state.outcome
        );

        Some((state.total, state.outcome.take(), state.callback.take()))
    }

    /// Stops every copy the channel takes part in, without calling their callbacks.
    pub(crate) fn stop_copies_of(&mut self, id: ChannelId) {
        let copies: Vec<CopyId> = self
            .copies
            .iter()
            .filter(|(_, state)| state.src == id || state.dst == id)
            .map(|(copy, _)| *copy)
            .collect();

        for copy in copies {
            event!(Level::DEBUG, message = "copy stopped", copy = %copy, channel = %id);
            self.finish_copy(copy);
        }
    }

    pub(crate) fn stop_all_copies(&mut self) {
        let copies: Vec<CopyId> = self.copies.keys().copied().collect();
        for copy in copies {
            self.finish_copy(copy);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::io::ErrorKind;
    use std::rc::Rc;

    use super::*;
    use crate::fake::{FakeDeviceHandle, FakeDriver};
    use crate::{Mode, SystemConfig};

    fn system() -> ChannelSystem {
        ChannelSystem::new(SystemConfig::default().without_std_channels().with_buffer_size(8))
    }

    fn channel(system: &mut ChannelSystem) -> (ChannelId, FakeDeviceHandle) {
        let (driver, device) = FakeDriver::new();
        (system.create_channel(Box::new(driver), Mode::all()), device)
    }

    type Outcome = Rc<RefCell<Option<(u64, Option<Error>)>>>;

    fn recorder() -> (Outcome, CopyCallback) {
        let outcome: Outcome = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&outcome);
        (
            outcome,
            Box::new(move |_, total, error| {
                *sink.borrow_mut() = Some((total, error));
            }),
        )
    }

    #[test]
    fn strategy_follows_encoding_and_translation() {
        let mut system = system();
        let (src, _a) = channel(&mut system);
        let (dst, _b) = channel(&mut system);

        system.set_translation(src, Some(Translation::Binary), None).unwrap();
        system.set_translation(dst, None, Some(Translation::Binary)).unwrap();
        system.set_encoding(dst, Encoding::Binary).unwrap();
        assert_eq!(
            copy_strategy(system.state(src).unwrap(), system.state(dst).unwrap()),
            CopyStrategy::MoveBuffers
        );

        system.set_translation(dst, None, Some(Translation::CrLf)).unwrap();
        assert_eq!(
            copy_strategy(system.state(src).unwrap(), system.state(dst).unwrap()),
            CopyStrategy::Bytes
        );

        system.set_translation(src, Some(Translation::Auto), None).unwrap();
        assert_eq!(
            copy_strategy(system.state(src).unwrap(), system.state(dst).unwrap()),
            CopyStrategy::Chars
        );
    }

    #[test]
    fn sync_copy_moves_everything_until_eof() {
        let mut system = system();
        let (src, input) = channel(&mut system);
        let (dst, output) = channel(&mut system);
        system.set_translation(src, Some(Translation::Binary), Some(Translation::Binary)).unwrap();
        system.set_translation(dst, Some(Translation::Binary), Some(Translation::Binary)).unwrap();
        input.push_input(b"twenty bytes of data");

        assert_eq!(system.copy(src, dst, None).unwrap(), 20);
        assert_eq!(output.written(), b"twenty bytes of data");
        assert!(system.eof(src).unwrap());
    }

    #[test]
    fn sized_copy_splits_last_buffer() {
        let mut system = system();
        let (src, input) = channel(&mut system);
        let (dst, output) = channel(&mut system);
        system.set_translation(src, Some(Translation::Binary), Some(Translation::Binary)).unwrap();
        system.set_translation(dst, Some(Translation::Binary), Some(Translation::Binary)).unwrap();
        input.push_input(b"0123456789abc");

        // Leaves seven bytes of the first device read buffered.
        let mut first = String::new();
        system.read_chars(src, Some(1), &mut first).unwrap();

        assert_eq!(system.copy(src, dst, Some(5)).unwrap(), 5);
        assert_eq!(output.written(), b"12345");

        let mut rest = Vec::new();
        system.read_bytes(src, 16, &mut rest).unwrap();
        assert_eq!(rest, b"6789abc");
    }

    #[test]
    fn char_copy_counts_characters() {
        let mut system = system();
        let (src, input) = channel(&mut system);
        let (dst, output) = channel(&mut system);
        system.set_translation(src, Some(Translation::Auto), None).unwrap();
        system.set_translation(dst, None, Some(Translation::CrLf)).unwrap();
        system.set_encoding(dst, Encoding::Iso8859_1).unwrap();
        input.push_input("é\r\nü\n".as_bytes());

        assert_eq!(system.copy(src, dst, None).unwrap(), 4);
        assert_eq!(output.written(), b"\xe9\r\n\xfc\r\n");
    }

    #[test]
    fn copy_restores_channel_modes() {
        let mut system = system();
        let (src, input) = channel(&mut system);
        let (dst, _output) = channel(&mut system);
        system.set_blocking(src, false).unwrap();
        system.set_buffering(dst, crate::Buffering::Line).unwrap();
        input.push_input(b"abc");

        system.copy(src, dst, None).unwrap();

        assert!(!system.is_blocking(src).unwrap());
        assert_eq!(system.buffering(dst).unwrap(), crate::Buffering::Line);
    }

    #[test]
    fn read_failure_names_source() {
        let mut system = system();
        let (src, input) = channel(&mut system);
        let (dst, _output) = channel(&mut system);
        input.push_read_error(ErrorKind::ConnectionReset, None);

        let error = system.copy(src, dst, None).unwrap_err();
        assert_eq!(error.to_string(), "error reading \"fake0\": fake input failure");
        assert_eq!(error.io_kind(), Some(ErrorKind::ConnectionReset));
    }

    #[test]
    fn write_failure_names_destination() {
        let mut system = system();
        let (src, input) = channel(&mut system);
        let (dst, output) = channel(&mut system);
        input.push_input(b"abc");
        output.push_output_error(ErrorKind::BrokenPipe, Some("pipe closed by reader"));

        let error = system.copy(src, dst, None).unwrap_err();
        assert_eq!(error.to_string(), "error writing \"fake1\": pipe closed by reader");
    }

    #[test]
    fn channel_in_copy_is_busy() {
        let mut system = system();
        let (src, input) = channel(&mut system);
        let (dst, _output) = channel(&mut system);
        let (other, _device) = channel(&mut system);
        input.set_eof_when_drained(false);

        let (_, callback) = recorder();
        system.copy_async(src, dst, None, callback).unwrap();

        assert!(matches!(system.copy(src, other, None), Err(Error::Busy(name)) if name == "fake0"));
        let mut data = Vec::new();
        assert!(matches!(system.read_bytes(src, 1, &mut data), Err(Error::Busy(_))));
        assert!(matches!(system.write_bytes(dst, b"x"), Err(Error::Busy(_))));
    }

    #[test]
    fn empty_async_copy_reports_through_timer() {
        let mut system = system();
        let (src, _input) = channel(&mut system);
        let (dst, _output) = channel(&mut system);

        let (outcome, callback) = recorder();
        let copy = system.copy_async(src, dst, None, callback).unwrap();
        assert!(outcome.borrow().is_none());
        assert!(system.is_copy_active(copy));

        assert_eq!(system.run_timers(), 1);
        assert!(matches!(*outcome.borrow(), Some((0, None))));
        assert!(!system.is_copy_active(copy));
    }

    #[test]
    fn async_copy_follows_readiness() {
        let mut system = system();
        let (src, input) = channel(&mut system);
        let (dst, output) = channel(&mut system);
        input.set_eof_when_drained(false);
        input.push_input(b"first ");

        let (outcome, callback) = recorder();
        system.copy_async(src, dst, None, callback).unwrap();
        assert_eq!(output.written(), b"first ");
        assert_eq!(input.watch_mask(), Some(Interest::READABLE));

        input.push_input(b"second");
        input.push_eof();
        system.notify(src, Interest::READABLE);
        assert_eq!(output.written(), b"first second");

        system.run_timers();
        assert!(matches!(*outcome.borrow(), Some((12, None))));
        assert_eq!(input.watch_mask(), Some(Interest::empty()));
    }

    #[test]
    fn async_copy_waits_for_slow_destination() {
        let mut system = system();
        let (src, input) = channel(&mut system);
        let (dst, output) = channel(&mut system);
        input.push_input(b"abcdef");
        output.push_output_would_block();

        let (outcome, callback) = recorder();
        system.copy_async(src, dst, None, callback).unwrap();
        assert!(output.written().is_empty());
        assert_eq!(output.watch_mask(), Some(Interest::WRITABLE));

        system.notify(dst, Interest::WRITABLE);
        assert_eq!(output.written(), b"abcdef");

        system.run_timers();
        assert!(matches!(*outcome.borrow(), Some((6, None))));
    }

    #[test]
    fn closing_a_channel_stops_its_copy() {
        let mut system = system();
        let (src, input) = channel(&mut system);
        let (dst, _output) = channel(&mut system);
        input.set_eof_when_drained(false);

        let (outcome, callback) = recorder();
        let copy = system.copy_async(src, dst, None, callback).unwrap();

        system.close(src).unwrap();
        assert!(!system.is_copy_active(copy));
        assert!(system.is_blocking(dst).unwrap());

        system.run_timers();
        assert!(outcome.borrow().is_none());
    }
}
