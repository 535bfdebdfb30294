// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use bitflags::bitflags;

bitflags! {
    /// Internal status bits of a channel.
    ///
    /// `EOF` and `BLOCKED` are never set at the same time. `EOF` without `STICKY_EOF` implies
    /// the input queue holds no data.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub(crate) struct ChannelFlags: u32 {
        const NONBLOCKING = 1 << 0;
        const LINE_BUFFERED = 1 << 1;
        const UNBUFFERED = 1 << 2;
        // The last input attempt reached end of stream.
        const EOF = 1 << 3;
        // End of stream was produced by the input eofchar and persists until reconfigured.
        const STICKY_EOF = 1 << 4;
        // The last input attempt would have blocked.
        const BLOCKED = 1 << 5;
        // Close was requested; the channel is only waiting for its output to drain.
        const CLOSED = 1 << 6;
        const CLOSED_WRITE = 1 << 7;
        // Close callbacks are running.
        const IN_CLOSE = 1 << 8;
        // Drivers were closed; the state is about to be released.
        const DEAD = 1 << 9;
        const BG_FLUSH_SCHEDULED = 1 << 10;
        // A non-blocking line read needed more data; buffered input alone cannot satisfy it.
        const NEED_MORE_DATA = 1 << 11;
        // Auto translation emitted a newline for a trailing \r; a following \n is dropped.
        const INPUT_SAW_CR = 1 << 12;
        // The current output buffer must be queued on the next flush even though it is not full.
        const BUFFER_READY = 1 << 13;
    }
}

impl ChannelFlags {
    /// Panics if the flag combination is one that can never legitimately occur.
    pub(crate) fn assert_consistent(self) {
        assert!(
            !self.contains(Self::EOF | Self::BLOCKED),
            "channel reports both end of stream and would-block"
        );
    }
}
