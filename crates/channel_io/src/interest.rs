// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use bitflags::bitflags;

bitflags! {
    /// Readiness conditions a channel can be watched for and notified about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Interest: u8 {
        /// Input is available, or the device reached end of stream.
        const READABLE = 0b001;
        /// The device can accept output without blocking.
        const WRITABLE = 0b010;
        /// An exceptional condition is pending on the device.
        const EXCEPTION = 0b100;
    }
}

bitflags! {
    /// The directions a channel (or a single layer of a channel) was opened for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Mode: u8 {
        /// The channel can be read from.
        const READ = 0b01;
        /// The channel can be written to.
        const WRITE = 0b10;
    }
}

/// One direction of data flow through a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Data flowing from the device to the caller.
    Read,
    /// Data flowing from the caller to the device.
    Write,
}

impl Direction {
    /// The mode bit that corresponds to this direction.
    #[must_use]
    pub const fn mode(self) -> Mode {
        match self {
            Self::Read => Mode::READ,
            Self::Write => Mode::WRITE,
        }
    }

    /// The readiness condition that signals progress is possible in this direction.
    #[must_use]
    pub const fn interest(self) -> Interest {
        match self {
            Self::Read => Interest::READABLE,
            Self::Write => Interest::WRITABLE,
        }
    }
}

impl Mode {
    /// The readiness conditions that are meaningful for a channel opened with this mode.
    #[must_use]
    pub fn interest(self) -> Interest {
        let mut interest = Interest::EXCEPTION;
        if self.contains(Self::READ) {
            interest |= Interest::READABLE;
        }
        if self.contains(Self::WRITE) {
            interest |= Interest::WRITABLE;
        }
        interest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_maps_to_mode_and_interest() {
        assert_eq!(Direction::Read.mode(), Mode::READ);
        assert_eq!(Direction::Write.mode(), Mode::WRITE);
        assert_eq!(Direction::Read.interest(), Interest::READABLE);
        assert_eq!(Direction::Write.interest(), Interest::WRITABLE);
    }

    #[test]
    fn mode_limits_interest() {
        assert_eq!(
            Mode::READ.interest(),
            Interest::READABLE | Interest::EXCEPTION
        );
        assert_eq!(Mode::all().interest(), Interest::all());
        assert_eq!(Mode::empty().interest(), Interest::EXCEPTION);
    }
}
