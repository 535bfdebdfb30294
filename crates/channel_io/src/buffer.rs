// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::rc::Rc;

use crate::constants::BUFFER_PADDING;
use crate::Mode;

/// A fixed-capacity byte buffer with a read cursor and a write cursor.
///
/// The storage is reference counted. Cloning a buffer retains the same storage, which is how
/// buffers are moved between channels during a copy without touching the bytes. Mutating a
/// shared buffer detaches it from the other owners first.
///
/// Layout of the storage:
///
/// ```text
/// | padding | consumed | unread bytes | free space | padding |
///           ^          ^ next_removed ^ next_added ^ end of usable capacity
/// ```
///
/// The front padding exists so that the unfinished tail of a multibyte sequence at the end of
/// one buffer can be moved in front of the next buffer's data.
#[derive(Debug, Clone)]
pub(crate) struct ChannelBuffer {
    storage: Rc<Vec<u8>>,
    next_removed: usize,
    next_added: usize,
    capacity: usize,
}

impl ChannelBuffer {
    pub(crate) fn allocate(capacity: usize) -> Self {
        Self {
            storage: Rc::new(vec![0; capacity + 2 * BUFFER_PADDING]),
            next_removed: BUFFER_PADDING,
            next_added: BUFFER_PADDING,
            capacity,
        }
    }

    pub(crate) const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of bytes that have been added but not yet removed.
    pub(crate) const fn len(&self) -> usize {
        self.next_added - self.next_removed
    }

    pub(crate) const fn is_empty(&self) -> bool {
        self.next_added == self.next_removed
    }

    /// Number of bytes that can still be added.
    pub(crate) const fn space(&self) -> usize {
        (BUFFER_PADDING + self.capacity).saturating_sub(self.next_added)
    }

    pub(crate) const fn is_full(&self) -> bool {
        self.space() == 0
    }

    pub(crate) fn is_shared(&self) -> bool {
        Rc::strong_count(&self.storage) > 1
    }

    /// The bytes that have been added but not yet removed.
    pub(crate) fn bytes(&self) -> &[u8] {
        &self.storage[self.next_removed..self.next_added]
    }

    /// The free space after the unread bytes. Bytes placed here become visible via [`commit`].
    ///
    /// [`commit`]: Self::commit
    pub(crate) fn space_mut(&mut self) -> &mut [u8] {
        let start = self.next_added;
        let end = BUFFER_PADDING + self.capacity;
        &mut Rc::make_mut(&mut self.storage)[start..end]
    }

    pub(crate) fn commit(&mut self, count: usize) {
        assert!(
            count <= self.space(),
            "committed {count} bytes into a buffer with {} bytes of space",
            self.space()
        );
        self.next_added += count;
    }

    pub(crate) fn consume(&mut self, count: usize) {
        assert!(
            count <= self.len(),
            "consumed {count} bytes from a buffer holding {} bytes",
            self.len()
        );
        self.next_removed += count;
    }

    /// Copies as much of `data` as fits into the free space and returns how much was copied.
    pub(crate) fn put(&mut self, data: &[u8]) -> usize {
        let count = data.len().min(self.space());
        if count > 0 {
            self.space_mut()[..count].copy_from_slice(&data[..count]);
            self.commit(count);
        }
        count
    }

    /// Places `data` in front of the unread bytes, using space freed by consumption or the
    /// front padding. Returns `false` without modifying the buffer if there is not enough room.
    pub(crate) fn prepend(&mut self, data: &[u8]) -> bool {
        if data.len() > self.next_removed {
            return false;
        }

        let start = self.next_removed - data.len();
        let end = self.next_removed;
        Rc::make_mut(&mut self.storage)[start..end].copy_from_slice(data);
        self.next_removed = start;
        true
    }

    /// Forgets the last `count` unread bytes.
    pub(crate) fn truncate_tail(&mut self, count: usize) {
        assert!(
            count <= self.len(),
            "truncated {count} bytes from a buffer holding {} bytes",
            self.len()
        );
        self.next_added -= count;
    }

    /// Splits the unread bytes at `at`, keeping the first part and returning the rest in a new
    /// buffer of the same capacity.
    pub(crate) fn split_off(&mut self, at: usize) -> Self {
        assert!(at <= self.len(), "split point {at} beyond {} unread bytes", self.len());

        let mut tail = Self::allocate(self.capacity.max(self.len() - at));
        tail.put(&self.bytes()[at..]);
        self.truncate_tail(self.len() - at);
        tail
    }

    fn reset(&mut self) {
        self.next_removed = BUFFER_PADDING;
        self.next_added = BUFFER_PADDING;
    }
}

/// One-slot caches of empty buffers for each direction of a channel.
#[derive(Debug, Default)]
pub(crate) struct SpareBuffers {
    input: Option<ChannelBuffer>,
    output: Option<ChannelBuffer>,
}

impl SpareBuffers {
    pub(crate) fn take_input(&mut self, buffer_size: usize) -> ChannelBuffer {
        Self::take(&mut self.input, buffer_size)
    }

    pub(crate) fn take_output(&mut self, buffer_size: usize) -> ChannelBuffer {
        Self::take(&mut self.output, buffer_size)
    }

    fn take(slot: &mut Option<ChannelBuffer>, buffer_size: usize) -> ChannelBuffer {
        match slot.take() {
            Some(buffer) if buffer.capacity() == buffer_size => buffer,
            _ => ChannelBuffer::allocate(buffer_size),
        }
    }

    /// Keeps `buffer` for reuse if it is private, has the current buffer size and a slot for a
    /// direction the channel supports is free. Otherwise the buffer is released.
    pub(crate) fn recycle(
        &mut self,
        mut buffer: ChannelBuffer,
        buffer_size: usize,
        mode: Mode,
        force_discard: bool,
    ) {
        if force_discard || buffer.is_shared() || buffer.capacity() != buffer_size {
            return;
        }

        buffer.reset();

        if mode.contains(Mode::READ) && self.input.is_none() {
            self.input = Some(buffer);
        } else if mode.contains(Mode::WRITE) && self.output.is_none() {
            self.output = Some(buffer);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.input = None;
        self.output = None;
    }
}
