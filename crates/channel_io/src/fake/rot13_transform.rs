// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io;

use crate::{Below, ChannelDriver, Interest};

/// A transformation layer that applies ROT13 to letters in both directions.
/// For test and example purposes only.
///
/// Stack it on a channel with [`ChannelSystem::stack`][crate::ChannelSystem::stack].
#[derive(Debug, Default)]
pub struct Rot13Transform {
    interest: Interest,
}

impl Rot13Transform {
    /// The interest mask most recently passed to this layer.
    #[must_use]
    pub const fn interest(&self) -> Interest {
        self.interest
    }
}

const fn rot13(byte: u8) -> u8 {
    match byte {
        b'a'..=b'm' | b'A'..=b'M' => byte + 13,
        b'n'..=b'z' | b'N'..=b'Z' => byte - 13,
        _ => byte,
    }
}

impl ChannelDriver for Rot13Transform {
    fn type_name(&self) -> &'static str {
        "rot13"
    }

    fn input(&mut self, below: &mut Below<'_>, buf: &mut [u8]) -> io::Result<usize> {
        let count = below.read(buf)?;
        for byte in &mut buf[..count] {
            *byte = rot13(*byte);
        }
        Ok(count)
    }

    fn output(&mut self, below: &mut Below<'_>, data: &[u8]) -> io::Result<usize> {
        let encoded: Vec<u8> = data.iter().copied().map(rot13).collect();
        below.write(&encoded)
    }

    fn close(&mut self, _below: &mut Below<'_>) -> io::Result<()> {
        Ok(())
    }

    fn watch(&mut self, interest: Interest) {
        self.interest = interest;
    }
}
