// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::constants::{DEFAULT_BUFFER_SIZE, MAX_BUFFER_SIZE, MIN_BUFFER_SIZE};
use crate::Encoding;

/// Defaults applied to every channel a [`ChannelSystem`][crate::ChannelSystem] creates.
///
/// # Examples
///
/// ```
/// use channel_io::{Encoding, SystemConfig};
///
/// let config = SystemConfig::new()
///     .with_buffer_size(16 * 1024)
///     .with_encoding(Encoding::Iso8859_1)
///     .without_std_channels();
///
/// assert_eq!(config.buffer_size(), 16 * 1024);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemConfig {
    buffer_size: usize,
    encoding: Encoding,
    std_channels: bool,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            encoding: Encoding::Utf8,
            std_channels: true,
        }
    }
}

impl SystemConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the buffer size of new channels. Values outside the supported range are clamped.
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = clamp_buffer_size(buffer_size);
        self
    }

    /// Sets the encoding of new channels.
    #[must_use]
    pub const fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Disables the lazily created standard channels. Lookups of `stdin`, `stdout` and `stderr`
    /// then only find channels installed explicitly.
    #[must_use]
    pub const fn without_std_channels(mut self) -> Self {
        self.std_channels = false;
        self
    }

    /// The buffer size of new channels.
    #[must_use]
    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// The encoding of new channels.
    #[must_use]
    pub const fn default_encoding(&self) -> Encoding {
        self.encoding
    }

    /// Whether the standard channels are created on first use.
    #[must_use]
    pub const fn std_channels(&self) -> bool {
        self.std_channels
    }
}

pub(crate) fn clamp_buffer_size(buffer_size: usize) -> usize {
    buffer_size.clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE)
}
