// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use tracing::{Level, event};

use crate::driver::Below;
use crate::flags::ChannelFlags;
use crate::state::Layer;
use crate::{ChannelDriver, ChannelId, ChannelSystem, Error, Mode, Result};

impl ChannelSystem {
    /// Stacks a transformation driver on top of the channel. From now on all I/O of the
    /// channel goes through `driver`, which reaches the previous top through [`Below`].
    ///
    /// Buffered output is written out through the previous top first. Buffered input that was
    /// not consumed yet is handed back to the previous top, so `driver` reads it before
    /// anything new from the device.
    ///
    /// # Errors
    ///
    /// Fails if `mode` is empty or asks for a direction the channel is not open for, or if
    /// writing out buffered output fails. The channel is unchanged in both cases.
    pub fn stack(&mut self, id: ChannelId, mut driver: Box<dyn ChannelDriver>, mode: Mode) -> Result<()> {
        let state = self.state_mut(id)?;
        state.check_usable()?;

        if mode.is_empty() || !state.mode.contains(mode) {
            return Err(Error::CapabilitiesDisallowed(state.name.clone()));
        }

        if state.mode.contains(Mode::WRITE) && !state.flags.contains(ChannelFlags::CLOSED_WRITE) {
            state.flush_blocking()?;
        }

        if let Err(e) = driver.set_blocking(!state.is_nonblocking()) {
            return Err(Error::from_driver(e, driver.take_error_payload()));
        }

        let pending: Vec<_> = state.in_queue.drain(..).collect();
        let top = state.top_mut();
        for buffer in pending.into_iter().rev() {
            top.pushback.push_front(buffer);
        }

        state.decoder = crate::encoding::DecoderState::default();
        state.flags.remove(
            ChannelFlags::EOF
                | ChannelFlags::STICKY_EOF
                | ChannelFlags::BLOCKED
                | ChannelFlags::INPUT_SAW_CR
                | ChannelFlags::NEED_MORE_DATA,
        );

        event!(
            Level::DEBUG,
            message = "driver stacked",
            channel = %state.name,
            driver = driver.type_name(),
            depth = state.layers.len() + 1
        );

        state.layers.push(Layer::new(driver, mode));
        state.epoch += 1;
        state.interest_dirty = true;
        self.update_interest(id);
        Ok(())
    }

    /// Removes the top driver of the channel. Buffered output is written out through it
    /// first, buffered input it produced is discarded. Unstacking the only driver closes the
    /// channel.
    ///
    /// # Errors
    ///
    /// Returns the first error of writing out buffered output or of closing the driver. The
    /// driver is removed either way.
    pub fn unstack(&mut self, id: ChannelId) -> Result<()> {
        let state = self.state_mut(id)?;
        if state.layers.len() == 1 {
            return self.close(id);
        }
        state.check_usable()?;

        let mut first_error = None;
        if state.mode.contains(Mode::WRITE) && !state.flags.contains(ChannelFlags::CLOSED_WRITE) {
            if let Err(error) = state.flush_blocking() {
                first_error = Some(error);
            }
        }
        state.discard_input();

        let mut layer = state.layers.pop().expect(crate::state::ERR_NO_LAYERS);
        if let Err(e) = layer.driver.close(&mut Below::new(&mut state.layers)) {
            first_error.get_or_insert(Error::from_driver(e, layer.driver.take_error_payload()));
        }

        event!(
            Level::DEBUG,
            message = "driver unstacked",
            channel = %state.name,
            driver = layer.driver.type_name(),
            depth = state.layers.len()
        );

        state.epoch += 1;
        self.update_interest(id);

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeDeviceHandle, FakeDriver, Rot13Transform};
    use crate::{Interest, SystemConfig, Translation};

    fn channel(system: &mut ChannelSystem) -> (ChannelId, FakeDeviceHandle) {
        let (driver, device) = FakeDriver::new();
        let id = system.create_channel(Box::new(driver), Mode::all());
        system
            .set_translation(id, Some(Translation::Lf), Some(Translation::Lf))
            .unwrap();
        (id, device)
    }

    fn system() -> ChannelSystem {
        ChannelSystem::new(SystemConfig::default().without_std_channels())
    }

    #[test]
    fn buffered_input_passes_through_new_layer_once() {
        let mut system = system();
        let (id, device) = channel(&mut system);
        device.push_input(b"abc\nhello");

        let mut line = String::new();
        system.read_line(id, &mut line).unwrap();
        assert_eq!(line, "abc");
        assert_eq!(system.input_buffered(id).unwrap(), 5);

        system.stack(id, Box::new(Rot13Transform::default()), Mode::all()).unwrap();
        assert_eq!(system.stack_depth(id).unwrap(), 2);
        assert_eq!(system.type_name(id).unwrap(), "rot13");

        let mut rest = String::new();
        system.read_chars(id, None, &mut rest).unwrap();
        assert_eq!(rest, "uryyb");
    }

    #[test]
    fn pending_output_is_written_before_stacking() {
        let mut system = system();
        let (id, device) = channel(&mut system);

        system.write_chars(id, "plain ").unwrap();
        system.stack(id, Box::new(Rot13Transform::default()), Mode::all()).unwrap();
        system.write_chars(id, "secret").unwrap();
        system.flush(id).unwrap();

        assert_eq!(device.written(), b"plain frperg");
    }

    #[test]
    fn unstack_flushes_through_removed_layer() {
        let mut system = system();
        let (id, device) = channel(&mut system);
        system.stack(id, Box::new(Rot13Transform::default()), Mode::all()).unwrap();
        let epoch = system.epoch(id).unwrap();

        system.write_chars(id, "abc").unwrap();
        system.unstack(id).unwrap();
        system.write_chars(id, "abc").unwrap();
        system.flush(id).unwrap();

        assert_eq!(device.written(), b"nopabc");
        assert_eq!(system.stack_depth(id).unwrap(), 1);
        assert_ne!(system.epoch(id).unwrap(), epoch);
        assert_eq!(device.close_count(), 0);
    }

    #[test]
    fn unstacking_last_driver_closes_channel() {
        let mut system = system();
        let (id, device) = channel(&mut system);

        system.unstack(id).unwrap();
        assert!(!system.is_open(id));
        assert_eq!(device.close_count(), 1);
    }

    #[test]
    fn stacking_outside_channel_mode_is_rejected() {
        let mut system = system();
        let (driver, _device) = FakeDriver::new();
        let id = system.create_channel(Box::new(driver), Mode::READ);

        assert!(matches!(
            system.stack(id, Box::new(Rot13Transform::default()), Mode::WRITE),
            Err(Error::CapabilitiesDisallowed(name)) if name == "fake0"
        ));
        assert!(matches!(
            system.stack(id, Box::new(Rot13Transform::default()), Mode::all()),
            Err(Error::CapabilitiesDisallowed(_))
        ));
        assert_eq!(system.stack_depth(id).unwrap(), 1);

        system.stack(id, Box::new(Rot13Transform::default()), Mode::READ).unwrap();
        assert_eq!(system.stack_depth(id).unwrap(), 2);
    }

    #[test]
    fn every_layer_is_told_the_interest() {
        let mut system = system();
        let (id, device) = channel(&mut system);
        system.stack(id, Box::new(Rot13Transform::default()), Mode::all()).unwrap();

        system
            .create_handler(id, Interest::READABLE, Box::new(|_, _, _| Ok(())))
            .unwrap();
        assert_eq!(device.watch_mask(), Some(Interest::READABLE));
    }
}
