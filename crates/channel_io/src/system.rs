// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::thread;

use derive_more::Display;
use tracing::{Level, event};

use crate::config::SystemConfig;
use crate::constants::GENERIC_TYPE_NAME;
use crate::copy::CopyState;
use crate::events::Timer;
use crate::flags::ChannelFlags;
use crate::state::ChannelState;
use crate::std_channels::{StdChannels, StdStream};
use crate::{ChannelDriver, Direction, Error, Mode, OsHandle, Result, ThreadAction};

/// Handle of a channel owned by a [`ChannelSystem`].
///
/// Handles stay valid until the channel is closed. A handle of a closed channel never refers
/// to a channel created later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("channel {index}#{generation}")]
pub struct ChannelId {
    index: u32,
    generation: u32,
}

/// Handle of a naming context: a table that maps channel names to channels and holds one
/// reference on every channel registered in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("context {_0}")]
pub struct ContextId(u32);

/// Handle of an asynchronous copy between two channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("copy {_0}")]
pub struct CopyId(pub(crate) u64);

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    state: Option<Box<ChannelState>>,
}

#[derive(Debug, Default)]
struct ContextTable {
    channels: BTreeMap<String, ChannelId>,
}

/// Remembers the result of one name lookup so that repeated lookups of the same name can
/// skip the context table while the channel's registration is unchanged.
#[derive(Debug, Clone, Default)]
pub struct LookupCache {
    entry: Option<CachedLookup>,
}

#[derive(Debug, Clone)]
struct CachedLookup {
    context: ContextId,
    name: String,
    id: ChannelId,
    epoch: u64,
}

/// Owns every channel and naming context and drives their I/O.
///
/// All operations take the channel or context handle they act on. Event delivery is driven
/// by the embedding event loop: drivers report readiness through [`notify`][Self::notify] and
/// [`run_timers`][Self::run_timers] fires the zero-delay timers the system arms.
///
/// Dropping the system finalizes it, which flushes and closes every open channel.
#[derive(Debug)]
pub struct ChannelSystem {
    config: SystemConfig,
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    contexts: Vec<Option<ContextTable>>,
    pub(crate) copies: HashMap<CopyId, CopyState>,
    pub(crate) timers: VecDeque<Timer>,
    next_serial: u64,
    type_counters: HashMap<&'static str, u64>,
    pub(crate) std: StdChannels,
    pub(crate) finalized: bool,
}

impl Default for ChannelSystem {
    fn default() -> Self {
        Self::new(SystemConfig::default())
    }
}

impl ChannelSystem {
    /// Creates an empty channel system.
    #[must_use]
    pub fn new(config: SystemConfig) -> Self {
        let std = StdChannels::new(config.std_channels());

        Self {
            config,
            slots: Vec::new(),
            free_slots: Vec::new(),
            contexts: Vec::new(),
            copies: HashMap::new(),
            timers: VecDeque::new(),
            next_serial: 1,
            type_counters: HashMap::new(),
            std,
            finalized: false,
        }
    }

    /// The defaults applied to new channels.
    #[must_use]
    pub const fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub(crate) fn next_serial(&mut self) -> u64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        serial
    }

    /// Creates a channel over `driver`, named after the driver type with a numeric suffix.
    pub fn create_channel(&mut self, driver: Box<dyn ChannelDriver>, mode: Mode) -> ChannelId {
        let name = self.generate_name(driver.type_name());
        self.insert_channel(name, driver, mode)
    }

    /// Creates a channel over `driver` with an explicit name.
    pub fn create_named_channel(
        &mut self,
        name: impl Into<String>,
        driver: Box<dyn ChannelDriver>,
        mode: Mode,
    ) -> ChannelId {
        self.insert_channel(name.into(), driver, mode)
    }

    fn generate_name(&mut self, type_name: &'static str) -> String {
        let type_name = if type_name.is_empty() {
            GENERIC_TYPE_NAME
        } else {
            type_name
        };

        loop {
            let counter = self.type_counters.entry(type_name).or_insert(0);
            let name = format!("{type_name}{counter}");
            *counter += 1;

            if !self.live_states().any(|state| state.name == name) {
                return name;
            }
        }
    }

    fn insert_channel(
        &mut self,
        name: String,
        mut driver: Box<dyn ChannelDriver>,
        mode: Mode,
    ) -> ChannelId {
        driver.thread_action(ThreadAction::Insert);
        let state = Box::new(ChannelState::new(name, driver, mode, &self.config));

        event!(
            Level::TRACE,
            message = "channel created",
            channel = %state.name,
            mode = ?mode
        );

        if let Some(index) = self.free_slots.pop() {
            let slot = &mut self.slots[index as usize];
            slot.state = Some(state);
            return ChannelId {
                index,
                generation: slot.generation,
            };
        }

        let index = u32::try_from(self.slots.len()).expect("channel count exceeds u32::MAX");
        self.slots.push(Slot {
            generation: 0,
            state: Some(state),
        });
        ChannelId {
            index,
            generation: 0,
        }
    }

    /// Releases the slot of a channel. Its handle becomes invalid.
    pub(crate) fn remove_channel(&mut self, id: ChannelId) -> Option<Box<ChannelState>> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }

        let state = slot.state.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_slots.push(id.index);
        Some(state)
    }

    pub(crate) fn state(&self, id: ChannelId) -> Result<&ChannelState> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.state.as_deref())
            .ok_or(Error::InvalidHandle)
    }

    pub(crate) fn state_mut(&mut self, id: ChannelId) -> Result<&mut ChannelState> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.state.as_deref_mut())
            .ok_or(Error::InvalidHandle)
    }

    fn live_states(&self) -> impl Iterator<Item = &ChannelState> {
        self.slots.iter().filter_map(|slot| slot.state.as_deref())
    }

    pub(crate) fn live_ids(&self) -> Vec<ChannelId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state.is_some())
            .filter_map(|(index, slot)| {
                Some(ChannelId {
                    index: u32::try_from(index).ok()?,
                    generation: slot.generation,
                })
            })
            .collect()
    }

    /// Whether the handle refers to a channel that has not been fully closed yet.
    #[must_use]
    pub fn is_open(&self, id: ChannelId) -> bool {
        self.state(id).is_ok()
    }

    /// The name of the channel.
    ///
    /// # Errors
    ///
    /// Fails if the handle is no longer valid.
    pub fn name(&self, id: ChannelId) -> Result<&str> {
        Ok(&self.state(id)?.name)
    }

    /// The type name of the top driver of the channel.
    ///
    /// # Errors
    ///
    /// Fails if the handle is no longer valid.
    pub fn type_name(&self, id: ChannelId) -> Result<&'static str> {
        Ok(self.state(id)?.top().driver.type_name())
    }

    /// The directions the channel is open for.
    ///
    /// # Errors
    ///
    /// Fails if the handle is no longer valid.
    pub fn mode(&self, id: ChannelId) -> Result<Mode> {
        Ok(self.state(id)?.mode)
    }

    /// Number of drivers stacked in the channel, at least one.
    ///
    /// # Errors
    ///
    /// Fails if the handle is no longer valid.
    pub fn stack_depth(&self, id: ChannelId) -> Result<usize> {
        Ok(self.state(id)?.layers.len())
    }

    /// Counter that changes whenever the channel's registration or stack changes.
    ///
    /// # Errors
    ///
    /// Fails if the handle is no longer valid.
    pub fn epoch(&self, id: ChannelId) -> Result<u64> {
        Ok(self.state(id)?.epoch)
    }

    /// The native handle of the device behind the channel for one direction.
    ///
    /// # Errors
    ///
    /// Fails if the handle is no longer valid.
    pub fn os_handle(&self, id: ChannelId, direction: Direction) -> Result<Option<OsHandle>> {
        let state = self.state(id)?;
        Ok(state
            .layers
            .iter()
            .rev()
            .find_map(|layer| layer.driver.os_handle(direction)))
    }

    /// Creates an empty naming context.
    pub fn create_context(&mut self) -> ContextId {
        let index = u32::try_from(self.contexts.len()).expect("context count exceeds u32::MAX");
        self.contexts.push(Some(ContextTable::default()));
        ContextId(index)
    }

    fn context(&self, context: ContextId) -> Result<&ContextTable> {
        self.contexts
            .get(context.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(Error::InvalidContext)
    }

    fn context_mut(&mut self, context: ContextId) -> Result<&mut ContextTable> {
        self.contexts
            .get_mut(context.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidContext)
    }

    /// Deletes a context, releasing its reference on every channel registered in it. Channels
    /// left without references are closed; their close errors are logged.
    ///
    /// # Errors
    ///
    /// Fails if the context handle is no longer valid.
    pub fn delete_context(&mut self, context: ContextId) -> Result<()> {
        let ids: Vec<ChannelId> = self.context(context)?.channels.values().copied().collect();

        for id in ids {
            if let Err(error) = self.unregister(context, id) {
                event!(
                    Level::WARN,
                    message = "closing channel of deleted context failed",
                    channel = %id,
                    error = %error
                );
            }
        }

        if let Some(slot) = self.contexts.get_mut(context.0 as usize) {
            *slot = None;
        }
        Ok(())
    }

    pub(crate) fn clear_contexts(&mut self) {
        for table in self.contexts.iter_mut().flatten() {
            table.channels.clear();
        }
    }

    /// Makes the channel reachable by name in the context and takes a reference on it.
    /// Registering a channel that is already registered under its name does nothing.
    ///
    /// # Errors
    ///
    /// Fails if either handle is invalid or another channel with the same name is registered
    /// in the context.
    pub fn register(&mut self, context: ContextId, id: ChannelId) -> Result<()> {
        let name = self.state(id)?.name.clone();
        let table = self.context_mut(context)?;

        match table.channels.get(&name) {
            Some(existing) if *existing == id => return Ok(()),
            Some(_) => return Err(Error::NameInUse(name)),
            None => {}
        }
        table.channels.insert(name, id);

        let state = self.state_mut(id)?;
        state.ref_count += 1;
        state.epoch += 1;
        if state.owner.is_none() {
            state.owner = Some(context);
        }
        Ok(())
    }

    /// Removes the channel from the context and releases the context's reference on it. The
    /// channel is closed when no references remain.
    ///
    /// # Errors
    ///
    /// Fails if the channel is not registered in the context. Errors of the resulting close
    /// are returned as well.
    pub fn unregister(&mut self, context: ContextId, id: ChannelId) -> Result<()> {
        let name = self.state(id)?.name.clone();
        let table = self.context_mut(context)?;

        if table.channels.get(&name) != Some(&id) {
            return Err(Error::NotRegistered(name));
        }
        table.channels.remove(&name);

        self.remove_event_callbacks(context, id);

        let is_std = self.std.holds(id);
        let state = self.state_mut(id)?;
        state.ref_count = state.ref_count.saturating_sub(1);
        state.epoch += 1;
        if state.owner == Some(context) {
            state.owner = None;
        }

        // A standard channel is kept alive by the system itself. Giving up the last
        // registration closes it like any other channel.
        if is_std && state.ref_count == 1 {
            state.ref_count = 0;
            self.std.forget(id);
        }

        let state = self.state_mut(id)?;
        if state.ref_count == 0 && !state.flags.contains(ChannelFlags::IN_CLOSE) {
            return self.close_channel(id);
        }
        Ok(())
    }

    /// Finds the channel registered under `name`. The standard channel names resolve to the
    /// standard channels, which are created and registered on first use.
    ///
    /// # Errors
    ///
    /// Fails if no such channel exists.
    pub fn lookup(&mut self, context: ContextId, name: &str) -> Result<ChannelId> {
        if let Some(id) = self.context(context)?.channels.get(name) {
            return Ok(*id);
        }

        if let Some(stream) = StdStream::from_name(name) {
            if let Some(id) = self.std_channel(stream) {
                self.register(context, id)?;
                return Ok(id);
            }
        }

        Err(Error::UnknownChannel(name.to_string()))
    }

    /// Like [`lookup`][Self::lookup], reusing the cached result while the channel's epoch is
    /// unchanged.
    ///
    /// # Errors
    ///
    /// Fails if no such channel exists.
    pub fn lookup_cached(
        &mut self,
        context: ContextId,
        name: &str,
        cache: &mut LookupCache,
    ) -> Result<ChannelId> {
        if let Some(entry) = &cache.entry {
            if entry.context == context
                && entry.name == name
                && self
                    .state(entry.id)
                    .is_ok_and(|state| state.epoch == entry.epoch)
            {
                return Ok(entry.id);
            }
        }

        let id = self.lookup(context, name)?;
        cache.entry = Some(CachedLookup {
            context,
            name: name.to_string(),
            id,
            epoch: self.state(id)?.epoch,
        });
        Ok(id)
    }

    /// Names of the channels registered in the context, sorted.
    ///
    /// # Errors
    ///
    /// Fails if the context handle is no longer valid.
    pub fn names(&self, context: ContextId) -> Result<Vec<String>> {
        Ok(self.context(context)?.channels.keys().cloned().collect())
    }

    /// Whether the channel is registered in the context.
    #[must_use]
    pub fn is_registered(&self, context: ContextId, id: ChannelId) -> bool {
        let Ok(state) = self.state(id) else {
            return false;
        };
        self.context(context)
            .is_ok_and(|table| table.channels.get(&state.name) == Some(&id))
    }

    /// Whether more than one reference is held on the channel.
    ///
    /// # Errors
    ///
    /// Fails if the handle is no longer valid.
    pub fn is_shared(&self, id: ChannelId) -> Result<bool> {
        Ok(self.state(id)?.ref_count > 1)
    }

    /// Removes the channel from its only context without closing it, so that it can be
    /// attached to another context.
    ///
    /// # Errors
    ///
    /// Fails if the channel is not registered in the context, is registered anywhere else or
    /// is a standard channel.
    pub fn detach(&mut self, context: ContextId, id: ChannelId) -> Result<()> {
        let state = self.state(id)?;
        let name = state.name.clone();

        if !self.is_registered(context, id) {
            return Err(Error::NotRegistered(name));
        }
        if state.ref_count > 1 || self.std.holds(id) {
            return Err(Error::Shared(name));
        }

        self.context_mut(context)?.channels.remove(&name);
        self.remove_event_callbacks(context, id);

        let state = self.state_mut(id)?;
        state.ref_count = 0;
        state.owner = None;
        state.epoch += 1;
        for layer in state.layers.iter_mut() {
            layer.driver.thread_action(ThreadAction::Remove);
        }

        event!(Level::TRACE, message = "channel detached", channel = %name);
        Ok(())
    }

    /// Registers a detached channel in a context and makes that context its owner.
    ///
    /// # Errors
    ///
    /// Fails if either handle is invalid or the name is taken in the context.
    pub fn attach(&mut self, context: ContextId, id: ChannelId) -> Result<()> {
        self.register(context, id)?;

        let state = self.state_mut(id)?;
        state.owner = Some(context);
        for layer in state.layers.iter_mut() {
            layer.driver.thread_action(ThreadAction::Insert);
        }
        Ok(())
    }
}

impl Drop for ChannelSystem {
    fn drop(&mut self) {
        // Do not pile a second panic on top of an unwinding one; the channels are simply
        // dropped in that case.
        if !thread::panicking() {
            self.finalize();
        }
    }
}
