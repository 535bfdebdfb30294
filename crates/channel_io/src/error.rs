// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io;

use thiserror::Error;

/// Any error that may arise from channel operations.
///
/// Driver failures are surfaced as [`Error::Driver`] when the driver supplied a descriptive
/// payload for the failure and as [`Error::StdIo`] otherwise.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// No channel with the given name is registered in the context.
    #[error("can not find channel named \"{0}\"")]
    UnknownChannel(String),

    /// The channel handle refers to a channel that has already been closed.
    #[error("channel handle is no longer valid")]
    InvalidHandle,

    /// The context handle refers to a context that has already been deleted.
    #[error("context handle is no longer valid")]
    InvalidContext,

    /// An input operation was attempted on a channel that is not readable.
    #[error("channel \"{0}\" wasn't opened for reading")]
    NotReadable(String),

    /// An output operation was attempted on a channel that is not writable.
    #[error("channel \"{0}\" wasn't opened for writing")]
    NotWritable(String),

    /// The channel is closed or in the middle of closing.
    #[error("channel \"{0}\" is closed")]
    Closed(String),

    /// The channel already takes part in a copy in the requested direction.
    #[error("channel \"{0}\" is busy")]
    Busy(String),

    /// A close callback attempted to close the channel that is running it.
    #[error("illegal recursive call to close through close-handler of channel \"{0}\"")]
    RecursiveClose(String),

    /// The channel is still registered in at least one context and cannot be closed directly.
    #[error("channel \"{0}\" is still registered")]
    StillRegistered(String),

    /// The channel is not registered in the context.
    #[error("channel \"{0}\" is not registered in this context")]
    NotRegistered(String),

    /// The channel is registered in more than one place and cannot be detached.
    #[error("channel \"{0}\" is shared")]
    Shared(String),

    /// Another channel with the same name is already registered in the context.
    #[error("channel name \"{0}\" is already in use")]
    NameInUse(String),

    /// The encoding name is not recognized.
    #[error("unknown encoding \"{0}\"")]
    UnknownEncoding(String),

    /// The option name is not recognized by the channel or its driver.
    #[error("bad option \"{option}\": should be one of {expected}")]
    BadOption {
        /// The rejected option name.
        option: String,
        /// Human-readable list of accepted option names.
        expected: String,
    },

    /// The option value is not valid for the option.
    #[error("bad value for {option}: {reason}")]
    BadValue {
        /// The option whose value was rejected.
        option: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// A driver was stacked with directions the channel is not open for.
    #[error("reading and writing both disallowed for channel \"{0}\"")]
    CapabilitiesDisallowed(String),

    /// The channel's driver does not implement the capability the operation needs.
    #[error("channel \"{channel}\" does not support {operation}")]
    Unsupported {
        /// Name of the channel.
        channel: String,
        /// The operation that was requested.
        operation: &'static str,
    },

    /// The input could not be decoded with the channel's encoding.
    #[error("invalid or incomplete multibyte or wide character in channel \"{0}\"")]
    MalformedInput(String),

    /// A driver failed and supplied a descriptive message that replaces the generic one.
    #[error("{message}")]
    Driver {
        /// The message supplied by the driver.
        message: String,
        /// The underlying driver failure.
        source: io::Error,
    },

    /// Reading the source of a copy failed.
    #[error("error reading \"{channel}\": {source}")]
    CopyRead {
        /// Name of the source channel.
        channel: String,
        /// The failure reported by the source.
        source: Box<Error>,
    },

    /// Writing the destination of a copy failed.
    #[error("error writing \"{channel}\": {source}")]
    CopyWrite {
        /// Name of the destination channel.
        channel: String,
        /// The failure reported by the destination.
        source: Box<Error>,
    },

    /// We are forwarding an error received from a driver or the standard library's I/O APIs.
    #[error(transparent)]
    StdIo(#[from] io::Error),
}

/// A specialized `Result` for use with channel operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns `true` if the error was reported by a driver as "operation would block".
    #[must_use]
    pub fn is_would_block(&self) -> bool {
        self.io_kind() == Some(io::ErrorKind::WouldBlock)
    }

    /// The standard I/O error kind behind this error, if it came from a driver.
    #[must_use]
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::StdIo(e) | Self::Driver { source: e, .. } => Some(e.kind()),
            Self::CopyRead { source, .. } | Self::CopyWrite { source, .. } => source.io_kind(),
            _ => None,
        }
    }

    pub(crate) fn from_driver(error: io::Error, payload: Option<String>) -> Self {
        match payload {
            Some(message) => Self::Driver {
                message,
                source: error,
            },
            None => Self::StdIo(error),
        }
    }
}

/// Represents a channel error as a standard I/O error.
/// This is often used when interoperating with code that expects standard I/O errors.
impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::StdIo(error) => error,
            Error::Driver { message, source } => Self::new(source.kind(), message),
            _ => Self::other(value),
        }
    }
}
