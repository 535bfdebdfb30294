// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Character-level input: decoding, end-of-line translation and eofchar detection over the
//! input queue.
//!
//! Reads scan the queue with a cursor and only commit what they consumed once they know the
//! outcome, so a read that gives up leaves the queue exactly as it found it.

use crate::encoding::{Decoded, DecoderState, decode_char};
use crate::flags::ChannelFlags;
use crate::read::Fill;
use crate::state::ChannelState;
use crate::translation::{CarriageReturn, Lookahead, translate_cr};
use crate::{Error, Result, Translation};

#[derive(Debug, Clone, Copy)]
struct Scan {
    buffer: usize,
    // Relative to the first unread byte of the buffer.
    offset: usize,
    decoder: DecoderState,
    saw_cr: bool,
    consumed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawChar {
    Char(char),
    EofChar,
    Pending,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fetch {
    Char(char),
    EofChar,
    NeedMore,
    Invalid,
}

/// What a line read has to put back when it returns without a line.
#[derive(Debug)]
struct LineCheckpoint {
    target_len: usize,
    decoder: DecoderState,
    saw_cr: bool,
}

impl LineCheckpoint {
    fn capture(state: &ChannelState, target: &str) -> Self {
        Self {
            target_len: target.len(),
            decoder: state.decoder,
            saw_cr: state.flags.contains(ChannelFlags::INPUT_SAW_CR),
        }
    }

    fn rollback(self, state: &mut ChannelState, target: &mut String) {
        target.truncate(self.target_len);
        state.decoder = self.decoder;
        state.flags.set(ChannelFlags::INPUT_SAW_CR, self.saw_cr);
    }
}

impl ChannelState {
    fn start_scan(&self) -> Scan {
        Scan {
            buffer: 0,
            offset: 0,
            decoder: self.decoder,
            saw_cr: self.flags.contains(ChannelFlags::INPUT_SAW_CR),
            consumed: 0,
        }
    }

    fn decode_raw(&mut self, scan: &mut Scan, at_eof: bool) -> RawChar {
        loop {
            let queued = self.in_queue.len();
            let Some(buffer) = self.in_queue.get(scan.buffer) else {
                return RawChar::Pending;
            };

            let bytes = &buffer.bytes()[scan.offset..];
            let Some(&first) = bytes.first() else {
                if scan.buffer + 1 < queued {
                    scan.buffer += 1;
                    scan.offset = 0;
                    continue;
                }
                return RawChar::Pending;
            };

            if self.input_eof_char == Some(first) {
                return RawChar::EofChar;
            }

            match decode_char(self.encoding, &mut scan.decoder, bytes) {
                Decoded::Char { ch, len } => {
                    scan.offset += len;
                    scan.consumed += len;
                    return RawChar::Char(ch);
                }
                Decoded::Skip { len } => {
                    scan.offset += len;
                    scan.consumed += len;
                }
                Decoded::Incomplete if scan.buffer + 1 < queued => {
                    let partial = bytes.to_vec();
                    self.splice_partial(scan.buffer, &partial);
                    scan.buffer += 1;
                    scan.offset = 0;
                }
                Decoded::Incomplete if at_eof => return RawChar::Invalid,
                Decoded::Incomplete => return RawChar::Pending,
                Decoded::Invalid => return RawChar::Invalid,
            }
        }
    }

    // Moves the unfinished character at the end of one buffer to the front of the next one.
    fn splice_partial(&mut self, index: usize, partial: &[u8]) {
        let moved = self.in_queue[index + 1].prepend(partial);
        assert!(
            moved,
            "no room in front of the next buffer for a {} byte partial character",
            partial.len()
        );
        self.in_queue[index].truncate_tail(partial.len());
    }

    fn next_char(&mut self, scan: &mut Scan, at_eof: bool) -> Fetch {
        loop {
            let before = *scan;
            match self.decode_raw(scan, at_eof) {
                RawChar::Char('\n') if scan.saw_cr => scan.saw_cr = false,
                RawChar::Char('\r') => {
                    scan.saw_cr = false;
                    let mode = self.input_translation;

                    let mut ahead = *scan;
                    let next = if matches!(mode, Translation::CrLf | Translation::Auto) {
                        match self.decode_raw(&mut ahead, at_eof) {
                            RawChar::Char(ch) => Lookahead::Char(ch),
                            RawChar::Invalid => Lookahead::Char(char::REPLACEMENT_CHARACTER),
                            RawChar::EofChar => Lookahead::End,
                            RawChar::Pending if at_eof => Lookahead::End,
                            RawChar::Pending => Lookahead::Pending,
                        }
                    } else {
                        Lookahead::End
                    };

                    return match translate_cr(mode, next) {
                        CarriageReturn::Newline { swallow_next: true } => {
                            *scan = ahead;
                            Fetch::Char('\n')
                        }
                        CarriageReturn::Newline {
                            swallow_next: false,
                        } => Fetch::Char('\n'),
                        CarriageReturn::NewlineSkipLf => {
                            scan.saw_cr = true;
                            Fetch::Char('\n')
                        }
                        CarriageReturn::Literal => Fetch::Char('\r'),
                        CarriageReturn::Undecided => {
                            *scan = before;
                            Fetch::NeedMore
                        }
                    };
                }
                RawChar::Char(ch) => {
                    scan.saw_cr = false;
                    return Fetch::Char(ch);
                }
                RawChar::EofChar => return Fetch::EofChar,
                RawChar::Pending => return Fetch::NeedMore,
                RawChar::Invalid => return Fetch::Invalid,
            }
        }
    }

    fn commit_scan(&mut self, scan: &Scan) {
        for _ in 0..scan.buffer {
            if let Some(buffer) = self.in_queue.pop_front() {
                self.recycle(buffer, false);
            }
        }

        if let Some(front) = self.in_queue.front_mut() {
            front.consume(scan.offset);
            if front.is_empty() {
                if let Some(buffer) = self.in_queue.pop_front() {
                    self.recycle(buffer, false);
                }
            }
        }

        self.decoder = scan.decoder;
        self.flags.set(ChannelFlags::INPUT_SAW_CR, scan.saw_cr);
    }

    fn hit_eof_char(&mut self) {
        self.set_flags(ChannelFlags::EOF | ChannelFlags::STICKY_EOF);
        self.interest_dirty = true;
    }

    /// Reads one line into `target`, without its terminator.
    ///
    /// Returns the number of characters in the line, or `None` if no line is available: either
    /// the stream ended without further data or, in non-blocking mode, the line is not
    /// complete yet. In the latter case nothing is consumed and `target` is left untouched.
    pub(crate) fn read_line(&mut self, target: &mut String) -> Result<Option<usize>> {
        self.check_readable()?;
        self.begin_read();

        if self.flags.contains(ChannelFlags::STICKY_EOF) {
            return Ok(None);
        }

        let checkpoint = LineCheckpoint::capture(self, target);
        let mut scan = self.start_scan();
        let mut at_eof = false;
        let mut chars = 0;

        let complete = loop {
            match self.next_char(&mut scan, at_eof) {
                Fetch::Char('\n') => break true,
                Fetch::Char(ch) => {
                    target.push(ch);
                    chars += 1;
                }
                Fetch::EofChar => {
                    self.hit_eof_char();
                    break false;
                }
                Fetch::Invalid => {
                    checkpoint.rollback(self, target);
                    self.flags.remove(ChannelFlags::EOF);
                    return Err(Error::MalformedInput(self.name.clone()));
                }
                Fetch::NeedMore if at_eof => break false,
                Fetch::NeedMore => match self.fill_input(None) {
                    Ok(Fill::Data(_)) => {}
                    Ok(Fill::Eof) => at_eof = true,
                    Ok(Fill::Blocked) => {
                        checkpoint.rollback(self, target);
                        self.flags.insert(ChannelFlags::NEED_MORE_DATA);
                        self.interest_dirty = true;
                        return Ok(None);
                    }
                    Err(e) => {
                        checkpoint.rollback(self, target);
                        return Err(e);
                    }
                },
            }
        };

        self.commit_scan(&scan);
        self.assert_invariants();

        Ok((complete || chars > 0).then_some(chars))
    }

    /// Reads up to `max` characters (everything until end of stream if `None`) into `target`
    /// and returns how many were read.
    pub(crate) fn read_chars(&mut self, max: Option<usize>, target: &mut String) -> Result<usize> {
        if max == Some(0) {
            return Ok(0);
        }

        self.check_readable()?;
        self.begin_read();

        if self.flags.contains(ChannelFlags::STICKY_EOF) {
            return Ok(0);
        }

        let estimate = self.input_buffered() * 1000 / self.bytes_per_char_milli.max(1);
        target.reserve(max.map_or(estimate, |max| max.min(estimate)));

        let mut scan = self.start_scan();
        let mut at_eof = false;
        let mut count = 0;
        let mut failure = None;
        let mut starved = false;

        while max.is_none_or(|max| count < max) {
            match self.next_char(&mut scan, at_eof) {
                Fetch::Char(ch) => {
                    target.push(ch);
                    count += 1;
                }
                Fetch::EofChar => {
                    self.hit_eof_char();
                    break;
                }
                Fetch::Invalid => {
                    self.flags.remove(ChannelFlags::EOF);
                    if count == 0 {
                        failure = Some(Error::MalformedInput(self.name.clone()));
                    }
                    break;
                }
                Fetch::NeedMore if at_eof => break,
                Fetch::NeedMore => match self.fill_input(None) {
                    Ok(Fill::Data(_)) => {}
                    Ok(Fill::Eof) => at_eof = true,
                    Ok(Fill::Blocked) => {
                        starved = true;
                        break;
                    }
                    Err(e) if count == 0 => {
                        failure = Some(e);
                        break;
                    }
                    Err(e) => {
                        self.defer_error(e);
                        break;
                    }
                },
            }
        }

        self.commit_scan(&scan);
        // Whatever is left cannot be decoded until the device delivers more.
        if starved && self.has_ready_input() {
            self.flags.insert(ChannelFlags::NEED_MORE_DATA);
            self.interest_dirty = true;
        }
        if count > 0 {
            self.bytes_per_char_milli = (scan.consumed * 1000 / count).max(1);
        }
        self.assert_invariants();

        match failure {
            Some(error) => Err(error),
            None => Ok(count),
        }
    }
}
