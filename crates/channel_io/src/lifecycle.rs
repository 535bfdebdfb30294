// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use derive_more::Display;
use tracing::{Level, event};

use crate::driver::Below;
use crate::flags::ChannelFlags;
use crate::{ChannelId, ChannelSystem, Direction, Error, Mode, Result};

/// Callback run while a channel is being closed. The channel can still be queried.
pub type CloseCallback = Box<dyn FnOnce(&mut ChannelSystem, ChannelId)>;

/// Identifies a callback added by [`ChannelSystem::add_close_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("close callback {_0}")]
pub struct CloseCallbackId(u64);

#[derive(derive_more::Debug)]
pub(crate) struct CloseCallbackRecord {
    id: CloseCallbackId,
    #[debug(skip)]
    callback: CloseCallback,
}

impl ChannelSystem {
    /// Adds a callback to run when the channel closes. Callbacks run most recent first.
    ///
    /// # Errors
    ///
    /// Fails if the handle is no longer valid.
    pub fn add_close_callback(
        &mut self,
        id: ChannelId,
        callback: CloseCallback,
    ) -> Result<CloseCallbackId> {
        let callback_id = CloseCallbackId(self.next_serial());
        self.state_mut(id)?.close_callbacks.push(CloseCallbackRecord {
            id: callback_id,
            callback,
        });
        Ok(callback_id)
    }

    /// Removes a close callback. Returns `false` if it does not exist.
    ///
    /// # Errors
    ///
    /// Fails if the handle is no longer valid.
    pub fn remove_close_callback(&mut self, id: ChannelId, callback: CloseCallbackId) -> Result<bool> {
        let callbacks = &mut self.state_mut(id)?.close_callbacks;
        let before = callbacks.len();
        callbacks.retain(|record| record.id != callback);
        Ok(callbacks.len() != before)
    }

    /// Closes a channel that is not registered in any context.
    ///
    /// Buffered output is written out first. In non-blocking mode output the device cannot
    /// take yet keeps the channel alive until the background flush drains it. The handle
    /// becomes invalid once the close completes.
    ///
    /// # Errors
    ///
    /// Fails if the channel is still registered or is already closing. Otherwise the first
    /// error of flushing or of closing the drivers is returned, after the close completed.
    pub fn close(&mut self, id: ChannelId) -> Result<()> {
        let state = self.state(id)?;

        if state.flags.contains(ChannelFlags::IN_CLOSE) {
            return Err(Error::RecursiveClose(state.name.clone()));
        }
        if state.flags.contains(ChannelFlags::CLOSED) {
            return Err(Error::Closed(state.name.clone()));
        }
        if state.ref_count > 0 {
            return Err(Error::StillRegistered(state.name.clone()));
        }

        self.close_channel(id)
    }

    pub(crate) fn close_channel(&mut self, id: ChannelId) -> Result<()> {
        let state = self.state_mut(id)?;
        if state.flags.contains(ChannelFlags::IN_CLOSE) {
            return Err(Error::RecursiveClose(state.name.clone()));
        }
        state.flags.insert(ChannelFlags::IN_CLOSE);

        let callbacks = std::mem::take(&mut state.close_callbacks);
        for record in callbacks.into_iter().rev() {
            (record.callback)(self, id);
        }

        self.stop_copies_of(id);

        let state = self.state_mut(id)?;
        state.handlers.clear();

        let mut first_error = None;
        if state.mode.contains(Mode::WRITE) && !state.flags.contains(ChannelFlags::CLOSED_WRITE) {
            if let Some(eof_char) = state.output_eof_char {
                if let Err(error) = state.put_output(&[eof_char]) {
                    first_error = Some(error);
                }
            }

            state.flags.insert(ChannelFlags::BUFFER_READY);
            if let Err(error) = state.flush(false) {
                first_error.get_or_insert(error);
            }
        }

        state.flags.remove(ChannelFlags::IN_CLOSE);
        state.flags.insert(ChannelFlags::CLOSED);

        if state.flags.contains(ChannelFlags::BG_FLUSH_SCHEDULED) && state.has_pending_output() {
            if let Some(error) = first_error {
                state.defer_error(error);
            }
            event!(
                Level::TRACE,
                message = "close deferred until output drains",
                channel = %state.name
            );
            self.update_interest(id);
            return Ok(());
        }

        self.finish_close(id, first_error)
    }

    /// Closes every driver of the channel from the top down and frees its slot.
    pub(crate) fn finish_close(&mut self, id: ChannelId, first_error: Option<Error>) -> Result<()> {
        let state = self.state_mut(id)?;

        // An error kept from an earlier background operation happened first.
        let mut first_error = state.unreported_error.take().or(first_error);

        state.discard_input();
        state.discard_output();
        state.flags.insert(ChannelFlags::DEAD);

        while let Some(mut layer) = state.layers.pop() {
            if let Err(e) = layer.driver.close(&mut Below::new(&mut state.layers)) {
                let error = Error::from_driver(e, layer.driver.take_error_payload());
                first_error.get_or_insert(error);
            }
        }

        let name = std::mem::take(&mut state.name);
        self.std.forget(id);
        self.remove_channel(id);

        event!(Level::TRACE, message = "channel closed", channel = %name);

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Closes one direction of the channel while the other stays usable. Closing the last
    /// open direction closes the channel.
    ///
    /// Closing the write side writes out buffered output, and the output end-of-file
    /// character if one is set, before the driver shuts it down. Closing the read side
    /// discards buffered input.
    ///
    /// # Errors
    ///
    /// Fails if the channel is not open for `direction` or its driver cannot close one
    /// direction only.
    pub fn close_half(&mut self, id: ChannelId, direction: Direction) -> Result<()> {
        let state = self.state_mut(id)?;
        match direction {
            Direction::Read => state.check_readable()?,
            Direction::Write => state.check_writable()?,
        }

        if state.mode == direction.mode() {
            return self.close(id);
        }
        if !state.top().driver.supports_half_close() {
            return Err(state.unsupported("half-close"));
        }

        let mut first_error = None;
        match direction {
            Direction::Read => {
                state.discard_input();
                state.top_mut().pushback.clear();
            }
            Direction::Write => {
                if let Some(eof_char) = state.output_eof_char {
                    if let Err(error) = state.put_output(&[eof_char]) {
                        first_error = Some(error);
                    }
                }
                if let Err(error) = state.flush_blocking() {
                    first_error.get_or_insert(error);
                }
                state.flags.insert(ChannelFlags::CLOSED_WRITE);
            }
        }

        let level = state.top_level();
        let (top, rest) = state
            .layers
            .split_last_mut()
            .expect(crate::state::ERR_NO_LAYERS);
        let closed = top.driver.close_half(&mut Below::new(rest), direction);
        if let Err(e) = closed {
            let error = state.driver_error(level, e);
            first_error.get_or_insert(error);
        }

        state.mode.remove(direction.mode());
        event!(
            Level::TRACE,
            message = "channel half closed",
            channel = %state.name,
            direction = ?direction
        );
        self.update_interest(id);

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Flushes and closes every open channel regardless of its registrations, the standard
    /// channels last. Errors are logged. Running it again does nothing.
    ///
    /// Called when the system is dropped.
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        event!(Level::DEBUG, message = "finalizing channel system");

        self.stop_all_copies();
        self.timers.clear();

        let std_ids = self.std.ids();
        let mut ids: Vec<ChannelId> = self
            .live_ids()
            .into_iter()
            .filter(|id| !std_ids.contains(id))
            .collect();
        ids.extend(std_ids);

        for id in ids {
            // A close callback may have closed it already.
            let Ok(state) = self.state_mut(id) else {
                continue;
            };
            state.ref_count = 0;

            if let Err(error) = state.set_blocking(true) {
                event!(
                    Level::ERROR,
                    message = "switching channel to blocking mode failed",
                    channel = %state.name,
                    error = %error
                );
            }

            let result = if state.flags.contains(ChannelFlags::CLOSED) {
                state.flags.insert(ChannelFlags::BUFFER_READY);
                let flushed = state.flush(false);
                self.finish_close(id, flushed.err())
            } else {
                self.close_channel(id)
            };

            if let Err(error) = result {
                event!(
                    Level::ERROR,
                    message = "closing channel during finalization failed",
                    channel = %id,
                    error = %error
                );
            }
        }

        self.std.clear();
        self.clear_contexts();
    }
}
