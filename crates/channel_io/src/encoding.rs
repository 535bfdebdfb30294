// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Character encodings a channel can convert between text and device bytes.
///
/// `Binary` maps each byte to the character with the same code point and back. Characters
/// that cannot be represented in the target encoding are written as `?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum Encoding {
    /// Raw bytes; every byte is one character in the range U+0000 to U+00FF.
    Binary,
    /// UTF-8.
    #[default]
    Utf8,
    /// 7-bit US-ASCII.
    Ascii,
    /// ISO 8859-1 (Latin-1).
    Iso8859_1,
    /// UTF-16 with byte order detected from a leading byte order mark. Output starts with a
    /// byte order mark in native order.
    Utf16,
    /// UTF-16, little endian, no byte order mark.
    Utf16Le,
    /// UTF-16, big endian, no byte order mark.
    Utf16Be,
}

impl Encoding {
    /// Every encoding, in the order their names are listed.
    pub const ALL: [Self; 7] = [
        Self::Binary,
        Self::Utf8,
        Self::Ascii,
        Self::Iso8859_1,
        Self::Utf16,
        Self::Utf16Le,
        Self::Utf16Be,
    ];

    /// The canonical name of the encoding.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Utf8 => "utf-8",
            Self::Ascii => "ascii",
            Self::Iso8859_1 => "iso8859-1",
            Self::Utf16 => "utf-16",
            Self::Utf16Le => "utf-16le",
            Self::Utf16Be => "utf-16be",
        }
    }

    /// Looks up an encoding by name. Names are case-insensitive and a few common aliases are
    /// accepted.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        let encoding = match lower.as_str() {
            "binary" => Self::Binary,
            "utf-8" | "utf8" => Self::Utf8,
            "ascii" | "us-ascii" => Self::Ascii,
            "iso8859-1" | "iso-8859-1" | "latin-1" | "latin1" => Self::Iso8859_1,
            "utf-16" | "unicode" => Self::Utf16,
            "utf-16le" => Self::Utf16Le,
            "utf-16be" => Self::Utf16Be,
            _ => return None,
        };
        Some(encoding)
    }

    /// Typical number of bytes one character occupies, used to estimate output sizes.
    pub(crate) const fn typical_char_len(self) -> usize {
        match self {
            Self::Utf16 | Self::Utf16Le | Self::Utf16Be => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Encoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s).ok_or_else(|| Error::UnknownEncoding(s.to_string()))
    }
}

/// Conversion state carried between decode calls on one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DecoderState {
    start_of_stream: bool,
    big_endian: bool,
}

impl Default for DecoderState {
    fn default() -> Self {
        Self {
            start_of_stream: true,
            big_endian: cfg!(target_endian = "big"),
        }
    }
}

impl DecoderState {
    /// The encoding whose output this decoder accepts from here on without a byte order mark.
    pub(crate) const fn mid_stream_encoding(&self, encoding: Encoding) -> Encoding {
        match encoding {
            Encoding::Utf16 if self.big_endian => Encoding::Utf16Be,
            Encoding::Utf16 => Encoding::Utf16Le,
            other => other,
        }
    }
}

/// Conversion state carried between encode calls on one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EncoderState {
    start_of_stream: bool,
}

impl Default for EncoderState {
    fn default() -> Self {
        Self {
            start_of_stream: true,
        }
    }
}

/// Outcome of decoding the character at the start of a byte slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decoded {
    /// A character spanning `len` bytes.
    Char { ch: char, len: usize },
    /// `len` bytes of stream metadata (a byte order mark) that produce no character.
    Skip { len: usize },
    /// The slice ends inside a character.
    Incomplete,
    /// The bytes do not form a valid character.
    Invalid,
}

pub(crate) fn decode_char(encoding: Encoding, state: &mut DecoderState, src: &[u8]) -> Decoded {
    let Some(&first) = src.first() else {
        return Decoded::Incomplete;
    };

    match encoding {
        Encoding::Binary | Encoding::Iso8859_1 => Decoded::Char {
            ch: char::from(first),
            len: 1,
        },
        Encoding::Ascii if first.is_ascii() => Decoded::Char {
            ch: char::from(first),
            len: 1,
        },
        Encoding::Ascii => Decoded::Invalid,
        Encoding::Utf8 => decode_utf8(src),
        Encoding::Utf16 => {
            if state.start_of_stream {
                if src.len() < 2 {
                    return Decoded::Incomplete;
                }
                state.start_of_stream = false;
                match [src[0], src[1]] {
                    [0xFE, 0xFF] => {
                        state.big_endian = true;
                        return Decoded::Skip { len: 2 };
                    }
                    [0xFF, 0xFE] => {
                        state.big_endian = false;
                        return Decoded::Skip { len: 2 };
                    }
                    _ => {}
                }
            }
            decode_utf16(src, state.big_endian)
        }
        Encoding::Utf16Le => decode_utf16(src, false),
        Encoding::Utf16Be => decode_utf16(src, true),
    }
}

fn decode_utf8(src: &[u8]) -> Decoded {
    let width = match src[0] {
        0x00..=0x7F => {
            return Decoded::Char {
                ch: char::from(src[0]),
                len: 1,
            };
        }
        0xC2..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF4 => 4,
        _ => return Decoded::Invalid,
    };

    if src.len() < width {
        // Only report an incomplete sequence if what we have could still become valid.
        return if src[1..].iter().all(|b| b & 0xC0 == 0x80) {
            Decoded::Incomplete
        } else {
            Decoded::Invalid
        };
    }

    std::str::from_utf8(&src[..width])
        .ok()
        .and_then(|s| s.chars().next())
        .map_or(Decoded::Invalid, |ch| Decoded::Char { ch, len: width })
}

fn decode_utf16(src: &[u8], big_endian: bool) -> Decoded {
    let unit = |at: usize| {
        let pair = [src[at], src[at + 1]];
        if big_endian {
            u16::from_be_bytes(pair)
        } else {
            u16::from_le_bytes(pair)
        }
    };

    if src.len() < 2 {
        return Decoded::Incomplete;
    }

    let lead = unit(0);
    match lead {
        0xD800..=0xDBFF => {
            if src.len() < 4 {
                return Decoded::Incomplete;
            }
            let trail = unit(2);
            if !(0xDC00..=0xDFFF).contains(&trail) {
                return Decoded::Invalid;
            }
            let code = 0x10000 + ((u32::from(lead) - 0xD800) << 10) + (u32::from(trail) - 0xDC00);
            char::from_u32(code).map_or(Decoded::Invalid, |ch| Decoded::Char { ch, len: 4 })
        }
        0xDC00..=0xDFFF => Decoded::Invalid,
        _ => char::from_u32(u32::from(lead))
            .map_or(Decoded::Invalid, |ch| Decoded::Char { ch, len: 2 }),
    }
}

/// Longest byte sequence `encode_char` can produce for one character.
pub(crate) const MAX_ENCODED_LEN: usize = 6;

/// Encodes one character into `out`, returning the number of bytes written.
pub(crate) fn encode_char(
    encoding: Encoding,
    state: &mut EncoderState,
    ch: char,
    out: &mut [u8; MAX_ENCODED_LEN],
) -> usize {
    let code = u32::from(ch);
    match encoding {
        Encoding::Binary | Encoding::Iso8859_1 => {
            out[0] = u8::try_from(code).unwrap_or(b'?');
            1
        }
        Encoding::Ascii => {
            out[0] = u8::try_from(code).ok().filter(u8::is_ascii).unwrap_or(b'?');
            1
        }
        Encoding::Utf8 => ch.encode_utf8(out).len(),
        Encoding::Utf16 => {
            let big_endian = cfg!(target_endian = "big");
            let mut written = 0;
            if state.start_of_stream {
                state.start_of_stream = false;
                written = put_utf16_unit(&mut out[..], 0xFEFF, big_endian);
            }
            written + encode_utf16(ch, big_endian, &mut out[written..])
        }
        Encoding::Utf16Le => encode_utf16(ch, false, out),
        Encoding::Utf16Be => encode_utf16(ch, true, out),
    }
}

fn encode_utf16(ch: char, big_endian: bool, out: &mut [u8]) -> usize {
    let mut units = [0_u16; 2];
    let mut written = 0;
    for &unit in ch.encode_utf16(&mut units).iter() {
        written += put_utf16_unit(&mut out[written..], unit, big_endian);
    }
    written
}

fn put_utf16_unit(out: &mut [u8], unit: u16, big_endian: bool) -> usize {
    let bytes = if big_endian {
        unit.to_be_bytes()
    } else {
        unit.to_le_bytes()
    };
    out[..2].copy_from_slice(&bytes);
    2
}

/// Encodes a whole string, appending the bytes to `out`.
pub(crate) fn encode_str(
    encoding: Encoding,
    state: &mut EncoderState,
    text: &str,
    out: &mut Vec<u8>,
) {
    let mut scratch = [0; MAX_ENCODED_LEN];
    for ch in text.chars() {
        let len = encode_char(encoding, state, ch, &mut scratch);
        out.extend_from_slice(&scratch[..len]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(encoding: Encoding, mut src: &[u8]) -> (String, Option<Decoded>) {
        let mut state = DecoderState::default();
        let mut text = String::new();
        loop {
            if src.is_empty() {
                return (text, None);
            }
            match decode_char(encoding, &mut state, src) {
                Decoded::Char { ch, len } => {
                    text.push(ch);
                    src = &src[len..];
                }
                Decoded::Skip { len } => src = &src[len..],
                other => return (text, Some(other)),
            }
        }
    }

    #[test]
    fn names_round_trip() {
        for encoding in Encoding::ALL {
            assert_eq!(Encoding::from_name(encoding.name()), Some(encoding));
            assert_eq!(encoding.to_string(), encoding.name());
        }

        assert_eq!(Encoding::from_name("Latin-1"), Some(Encoding::Iso8859_1));
        assert!(matches!(
            "klingon".parse::<Encoding>(),
            Err(Error::UnknownEncoding(name)) if name == "klingon"
        ));
    }

    #[test]
    fn utf8_decoding() {
        assert_eq!(
            decode_all(Encoding::Utf8, "héllo €𝄞".as_bytes()),
            ("héllo €𝄞".to_string(), None)
        );

        // Cut in the middle of the euro sign.
        assert_eq!(
            decode_all(Encoding::Utf8, b"a\xe2\x82"),
            ("a".to_string(), Some(Decoded::Incomplete))
        );

        assert_eq!(
            decode_all(Encoding::Utf8, b"a\xe2(b"),
            ("a".to_string(), Some(Decoded::Invalid))
        );
        assert_eq!(
            decode_all(Encoding::Utf8, b"\xff"),
            (String::new(), Some(Decoded::Invalid))
        );
    }

    #[test]
    fn single_byte_decoding() {
        assert_eq!(
            decode_all(Encoding::Iso8859_1, b"caf\xe9"),
            ("café".to_string(), None)
        );
        assert_eq!(
            decode_all(Encoding::Binary, b"\x00\xff"),
            ("\u{0}\u{ff}".to_string(), None)
        );
        assert_eq!(
            decode_all(Encoding::Ascii, b"ok\x80"),
            ("ok".to_string(), Some(Decoded::Invalid))
        );
    }

    #[test]
    fn utf16_byte_order_mark_selects_order() {
        assert_eq!(
            decode_all(Encoding::Utf16, b"\xfe\xff\x00h\x00i"),
            ("hi".to_string(), None)
        );
        assert_eq!(
            decode_all(Encoding::Utf16, b"\xff\xfeh\x00i\x00"),
            ("hi".to_string(), None)
        );
        assert_eq!(
            decode_all(Encoding::Utf16Be, b"\xd8\x34\xdd\x1e"),
            ("𝄞".to_string(), None)
        );
        assert_eq!(
            decode_all(Encoding::Utf16Le, b"\x34\xd8"),
            (String::new(), Some(Decoded::Incomplete))
        );
        assert_eq!(
            decode_all(Encoding::Utf16Le, b"\x1e\xdd"),
            (String::new(), Some(Decoded::Invalid))
        );
    }

    #[test]
    fn unrepresentable_output_becomes_question_mark() {
        let mut state = EncoderState::default();
        let mut out = Vec::new();
        encode_str(Encoding::Ascii, &mut state, "naïve", &mut out);
        assert_eq!(out, b"na?ve");

        out.clear();
        encode_str(Encoding::Iso8859_1, &mut state, "€5 café", &mut out);
        assert_eq!(out, b"?5 caf\xe9");
    }

    #[test]
    fn utf16_output_starts_with_byte_order_mark_once() {
        let mut state = EncoderState::default();
        let mut out = Vec::new();
        encode_str(Encoding::Utf16, &mut state, "a", &mut out);
        encode_str(Encoding::Utf16, &mut state, "b", &mut out);

        let (text, rest) = decode_all(Encoding::Utf16, &out);
        assert_eq!(text, "ab");
        assert_eq!(rest, None);
        assert_eq!(out.len(), 6);
    }

    #[test]
    fn utf16_round_trip_with_surrogates() {
        let mut state = EncoderState::default();
        let mut out = Vec::new();
        encode_str(Encoding::Utf16Be, &mut state, "x𝄞", &mut out);
        assert_eq!(out, b"\x00x\xd8\x34\xdd\x1e");
    }
}
