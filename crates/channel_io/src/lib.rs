// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Buffered, encoding-aware channels over pluggable byte-stream drivers.
//!
//! A channel wraps a device, such as a file, a socket or a pipe, behind a [driver][1] that only
//! moves raw bytes. The channel adds everything above that:
//!
//! * Input and output buffering with full, line and unbuffered modes.
//! * Character encodings and end-of-line translation, symmetric on input and output.
//! * End-of-file characters that end input before the device does.
//! * Blocking and non-blocking operation, with output that the device cannot take right away
//!   written in the background once the device becomes writable.
//! * Stacked transformation drivers that see the I/O of the channel before the device does.
//! * Readiness handlers that take buffered input into account.
//! * Bulk copies between channels, synchronous or driven by readiness.
//!
//! All channels live in a [`ChannelSystem`], which is passed to every operation explicitly.
//! Channels are addressed by [`ChannelId`] handles and are registered by name in naming
//! [contexts][2]. The system also owns the standard channels of the process.
//!
//! The system reports device readiness through [`ChannelSystem::notify`] and runs its own
//! zero-delay timers through [`ChannelSystem::run_timers`]; an event loop drives both.
//!
//! [1]: crate::ChannelDriver
//! [2]: crate::ContextId

mod buffer;
mod config;
mod constants;
mod copy;
mod driver;
mod encoding;
mod error;
mod events;
mod flags;
mod interest;
mod lifecycle;
mod operations;
mod options;
mod read;
mod seek;
mod stack;
mod state;
mod std_channels;
mod system;
mod text;
mod translation;
mod write;

pub use config::*;
pub use constants::*;
pub use copy::*;
pub use driver::*;
pub use encoding::*;
pub use error::*;
pub use events::*;
pub use interest::*;
pub use lifecycle::*;
pub use operations::*;
pub use options::*;
pub use std_channels::*;
pub use system::*;
pub use translation::*;

#[cfg(any(feature = "fakes", test))]
mod fake;
#[cfg(any(feature = "fakes", test))]
pub use fake::*;

#[cfg(test)]
mod mocks;

#[cfg(test)]
mod tests {
    #[test]
    fn is_64_bit() {
        // Byte counts of copies are u64 and are compared against buffer sizes in usize.
        static_assertions::const_assert!(size_of::<usize>() >= 8);
    }
}
