// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use derive_more::Display;
use smallvec::SmallVec;
use tracing::{Level, event};

use crate::flags::ChannelFlags;
use crate::system::{ContextId, CopyId};
use crate::{ChannelId, ChannelSystem, Direction, Error, Interest, Result};

/// Callback invoked when a channel becomes ready for one of the conditions it was registered
/// for. Receives the conditions that are ready.
pub type ChannelHandler = Box<dyn FnMut(&mut ChannelSystem, ChannelId, Interest) -> Result<()>>;

/// Identifies a handler created by [`ChannelSystem::create_handler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("handler {_0}")]
pub struct HandlerId(u64);

#[derive(derive_more::Debug)]
pub(crate) struct HandlerRecord {
    pub(crate) id: HandlerId,
    pub(crate) mask: Interest,
    pub(crate) kind: HandlerKind,
}

#[derive(derive_more::Debug)]
pub(crate) enum HandlerKind {
    // The closure is taken out of the record while it runs.
    User(#[debug(skip)] Option<ChannelHandler>),
    EventCallback {
        context: ContextId,
        #[debug(skip)]
        callback: Option<ChannelHandler>,
    },
    Copy(CopyId),
}

/// Zero-delay work items, fired by [`ChannelSystem::run_timers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Timer {
    /// Buffered input is waiting for a readable handler.
    ChannelReady(ChannelId),
    /// An asynchronous copy is done and its callback is due.
    CopyFinished(CopyId),
}

impl ChannelSystem {
    /// Registers `handler` to be called whenever the channel is ready for a condition in
    /// `mask`.
    ///
    /// # Errors
    ///
    /// Fails if the handle is no longer valid.
    pub fn create_handler(
        &mut self,
        id: ChannelId,
        mask: Interest,
        handler: ChannelHandler,
    ) -> Result<HandlerId> {
        self.add_handler(id, mask, HandlerKind::User(Some(handler)))
    }

    pub(crate) fn add_handler(
        &mut self,
        id: ChannelId,
        mask: Interest,
        kind: HandlerKind,
    ) -> Result<HandlerId> {
        let handler_id = HandlerId(self.next_serial());
        self.state_mut(id)?.handlers.push(HandlerRecord {
            id: handler_id,
            mask,
            kind,
        });
        self.update_interest(id);
        Ok(handler_id)
    }

    /// Changes the conditions a handler is called for. Returns `false` if the handler does not
    /// exist.
    ///
    /// # Errors
    ///
    /// Fails if the handle is no longer valid.
    pub fn set_handler_mask(
        &mut self,
        id: ChannelId,
        handler: HandlerId,
        mask: Interest,
    ) -> Result<bool> {
        let Some(record) = self
            .state_mut(id)?
            .handlers
            .iter_mut()
            .find(|record| record.id == handler)
        else {
            return Ok(false);
        };

        record.mask = mask;
        self.update_interest(id);
        Ok(true)
    }

    /// Removes a handler. A handler removed while the channel is dispatching is not called
    /// anymore, even if it was ready. Returns `false` if the handler does not exist.
    ///
    /// # Errors
    ///
    /// Fails if the handle is no longer valid.
    pub fn delete_handler(&mut self, id: ChannelId, handler: HandlerId) -> Result<bool> {
        let handlers = &mut self.state_mut(id)?.handlers;
        let before = handlers.len();
        handlers.retain(|record| record.id != handler);
        let removed = handlers.len() != before;

        if removed {
            self.update_interest(id);
        }
        Ok(removed)
    }

    /// Sets or, with `None`, removes the event callback of a context for one direction of a
    /// channel. A context has at most one callback per channel and direction.
    ///
    /// A callback that returns an error is removed and the error is logged.
    ///
    /// # Errors
    ///
    /// Fails if the channel is not registered in the context or is not open for `direction`.
    pub fn set_event_callback(
        &mut self,
        context: ContextId,
        id: ChannelId,
        direction: Direction,
        callback: Option<ChannelHandler>,
    ) -> Result<()> {
        let state = self.state(id)?;
        let name = state.name.clone();
        if !self.is_registered(context, id) {
            return Err(Error::NotRegistered(name));
        }
        if !state.mode.contains(direction.mode()) {
            return Err(match direction {
                Direction::Read => Error::NotReadable(name),
                Direction::Write => Error::NotWritable(name),
            });
        }

        let mask = direction.interest();
        let handlers = &mut self.state_mut(id)?.handlers;
        let existing = handlers.iter().position(|record| {
            record.mask == mask
                && matches!(record.kind, HandlerKind::EventCallback { context: c, .. } if c == context)
        });

        match (existing, callback) {
            (Some(index), Some(new)) => {
                if let HandlerKind::EventCallback { callback, .. } = &mut handlers[index].kind {
                    *callback = Some(new);
                }
            }
            (Some(index), None) => {
                handlers.remove(index);
            }
            (None, Some(new)) => {
                self.add_handler(
                    id,
                    mask,
                    HandlerKind::EventCallback {
                        context,
                        callback: Some(new),
                    },
                )?;
            }
            (None, None) => {}
        }

        self.update_interest(id);
        Ok(())
    }

    /// Whether the context has an event callback for this direction of the channel.
    #[must_use]
    pub fn has_event_callback(
        &self,
        context: ContextId,
        id: ChannelId,
        direction: Direction,
    ) -> bool {
        let mask = direction.interest();
        self.state(id).is_ok_and(|state| {
            state.handlers.iter().any(|record| {
                record.mask == mask
                    && matches!(record.kind, HandlerKind::EventCallback { context: c, .. } if c == context)
            })
        })
    }

    /// Drops every event callback the context set on the channel.
    pub(crate) fn remove_event_callbacks(&mut self, context: ContextId, id: ChannelId) {
        let Ok(state) = self.state_mut(id) else {
            return;
        };

        state.handlers.retain(|record| {
            !matches!(record.kind, HandlerKind::EventCallback { context: c, .. } if c == context)
        });
        self.update_interest(id);
    }

    /// Delivers readiness of the channel's device.
    ///
    /// Drivers, or the event loop they cooperate with, call this when a condition they were
    /// asked to watch for holds. Writability first serves a scheduled background flush; the
    /// remaining conditions go to every handler interested in them.
    pub fn notify(&mut self, id: ChannelId, ready: Interest) {
        let Ok(state) = self.state_mut(id) else {
            return;
        };
        if state.flags.contains(ChannelFlags::DEAD) {
            return;
        }

        let mut ready = ready;
        if ready.contains(Interest::WRITABLE)
            && state.flags.contains(ChannelFlags::BG_FLUSH_SCHEDULED)
        {
            if let Err(error) = state.flush(true) {
                state.defer_error(error);
            }
            // Writers only hear about writability once the queue has drained.
            if state.flags.contains(ChannelFlags::BG_FLUSH_SCHEDULED) {
                ready.remove(Interest::WRITABLE);
            }

            if state.flags.contains(ChannelFlags::CLOSED) && !state.has_pending_output() {
                if let Err(error) = self.finish_close(id, None) {
                    event!(
                        Level::ERROR,
                        message = "deferred close failed",
                        channel = %id,
                        error = %error
                    );
                }
                return;
            }
        }

        // Handlers may create and delete handlers while running. Only the ones present now
        // are considered, and each is looked up again right before it runs.
        let targets: SmallVec<[HandlerId; 4]> = state
            .handlers
            .iter()
            .filter(|record| record.mask.intersects(ready))
            .map(|record| record.id)
            .collect();

        for handler in targets {
            if !self.is_open(id) {
                return;
            }
            self.invoke_handler(id, handler, ready);
        }

        self.update_interest(id);
    }

    fn invoke_handler(&mut self, id: ChannelId, handler: HandlerId, ready: Interest) {
        enum Action {
            Call(ChannelHandler, bool),
            Copy(CopyId),
        }

        let Ok(state) = self.state_mut(id) else {
            return;
        };
        let Some(record) = state.handlers.iter_mut().find(|record| record.id == handler) else {
            return;
        };

        let ready = record.mask & ready;
        if ready.is_empty() {
            return;
        }

        let action = match &mut record.kind {
            HandlerKind::Copy(copy) => Action::Copy(*copy),
            HandlerKind::User(slot) => match slot.take() {
                Some(callback) => Action::Call(callback, false),
                None => return,
            },
            HandlerKind::EventCallback { callback, .. } => match callback.take() {
                Some(callback) => Action::Call(callback, true),
                None => return,
            },
        };

        match action {
            Action::Copy(copy) => self.copy_ready(copy),
            Action::Call(mut callback, is_event_callback) => {
                let result = callback(self, id, ready);
                self.restore_handler(id, handler, callback);

                if let Err(error) = result {
                    event!(
                        Level::ERROR,
                        message = "channel handler failed",
                        channel = %id,
                        handler = %handler,
                        error = %error
                    );
                    if is_event_callback {
                        let _ = self.delete_handler(id, handler);
                    }
                }
            }
        }
    }

    // Puts a closure back unless its record was deleted or given a new closure meanwhile.
    fn restore_handler(&mut self, id: ChannelId, handler: HandlerId, callback: ChannelHandler) {
        let Ok(state) = self.state_mut(id) else {
            return;
        };
        let Some(record) = state.handlers.iter_mut().find(|record| record.id == handler) else {
            return;
        };

        match &mut record.kind {
            HandlerKind::User(slot) | HandlerKind::EventCallback { callback: slot, .. } => {
                if slot.is_none() {
                    *slot = Some(callback);
                }
            }
            HandlerKind::Copy(_) => {}
        }
    }

    /// Recomputes the conditions the channel wants to hear about and passes them to its
    /// drivers.
    ///
    /// Readability is not requested from the device while buffered input can already satisfy
    /// a reader. A zero-delay timer delivers it instead.
    pub(crate) fn update_interest(&mut self, id: ChannelId) {
        let Ok(state) = self.state_mut(id) else {
            return;
        };
        if state.flags.contains(ChannelFlags::DEAD) {
            return;
        }

        let mut mask = state
            .handlers
            .iter()
            .fold(Interest::empty(), |mask, record| mask | record.mask);
        if state.flags.contains(ChannelFlags::BG_FLUSH_SCHEDULED) {
            mask |= Interest::WRITABLE;
        }
        mask &= state.mode.interest() | Interest::EXCEPTION;

        let mut arm_timer = false;
        if mask.contains(Interest::READABLE)
            && !state.flags.contains(ChannelFlags::NEED_MORE_DATA)
            && state.has_ready_input()
        {
            mask.remove(Interest::READABLE);
            if !state.timer_armed {
                state.timer_armed = true;
                arm_timer = true;
            }
        }

        state.interest = mask;
        state.interest_dirty = false;
        for layer in state.layers.iter_mut().rev() {
            layer.driver.watch(mask);
        }

        if arm_timer {
            self.timers.push_back(Timer::ChannelReady(id));
        }
    }

    /// Updates the interest mask if an operation changed something it depends on.
    pub(crate) fn refresh_interest(&mut self, id: ChannelId) {
        if self.state(id).is_ok_and(|state| state.interest_dirty) {
            self.update_interest(id);
        }
    }

    /// Whether [`run_timers`][Self::run_timers] has work to do.
    #[must_use]
    pub fn has_pending_timers(&self) -> bool {
        !self.timers.is_empty()
    }

    /// Fires the zero-delay timers armed so far and returns how many did something. Timers
    /// armed while this runs wait for the next call.
    pub fn run_timers(&mut self) -> usize {
        let due: Vec<Timer> = self.timers.drain(..).collect();
        let mut fired = 0;

        for timer in due {
            match timer {
                Timer::ChannelReady(id) => {
                    let Ok(state) = self.state_mut(id) else {
                        continue;
                    };
                    state.timer_armed = false;

                    let deliver = state.has_ready_input()
                        && !state.flags.contains(ChannelFlags::NEED_MORE_DATA);
                    if deliver {
                        fired += 1;
                        self.notify(id, Interest::READABLE);
                    } else {
                        self.update_interest(id);
                    }
                }
                Timer::CopyFinished(copy) => {
                    fired += 1;
                    self.complete_copy(copy);
                }
            }
        }
        fired
    }
}
