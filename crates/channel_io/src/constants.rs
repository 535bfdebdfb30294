// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

/// Size of the buffers a channel allocates for input and output unless configured otherwise.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Smallest buffer size a channel accepts. Requests below this are clamped up.
pub const MIN_BUFFER_SIZE: usize = 1;

/// Largest buffer size a channel accepts. Requests above this are clamped down.
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

// Spare bytes reserved in front of and behind the usable region of every buffer. The front
// padding receives the tail of a multibyte sequence split across two buffers.
pub(crate) const BUFFER_PADDING: usize = 16;

// Name reported for channels created without an explicit name when the driver type is unnamed.
pub(crate) const GENERIC_TYPE_NAME: &str = "chan";
