// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;

/// End-of-line translation mode for one direction of a channel.
///
/// On input, the selected line terminator is converted to `\n`. On output, `\n` is converted to
/// the selected line terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Translation {
    /// Input: `\n`, `\r` and `\r\n` all end a line. Output: same as [`Translation::PLATFORM`].
    Auto,
    /// No translation; the channel also switches to binary encoding.
    Binary,
    /// `\n` terminates lines.
    Lf,
    /// `\r` terminates lines.
    Cr,
    /// `\r\n` terminates lines.
    CrLf,
}

impl Translation {
    /// The native line terminator of the platform.
    #[cfg(windows)]
    pub const PLATFORM: Self = Self::CrLf;

    /// The native line terminator of the platform.
    #[cfg(not(windows))]
    pub const PLATFORM: Self = Self::Lf;

    /// The name used for this mode in channel options.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Binary => "binary",
            Self::Lf => "lf",
            Self::Cr => "cr",
            Self::CrLf => "crlf",
        }
    }

    /// Parses an option value. `platform` resolves to [`Translation::PLATFORM`].
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "auto" => Some(Self::Auto),
            "binary" => Some(Self::Binary),
            "lf" => Some(Self::Lf),
            "cr" => Some(Self::Cr),
            "crlf" => Some(Self::CrLf),
            "platform" => Some(Self::PLATFORM),
            _ => None,
        }
    }

    /// What a `\n` written by the caller turns into on the device.
    pub(crate) const fn output_newline(self) -> &'static str {
        match self {
            Self::Lf | Self::Binary => "\n",
            Self::Cr => "\r",
            Self::CrLf => "\r\n",
            Self::Auto => Self::PLATFORM.output_newline(),
        }
    }

    /// Whether output bytes pass through untouched.
    pub(crate) fn is_transparent_output(self) -> bool {
        self.output_newline() == "\n"
    }
}

impl fmt::Display for Translation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What follows a `\r` on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lookahead {
    Char(char),
    /// Nothing is buffered after the `\r` yet, but the stream may continue.
    Pending,
    /// The stream ends after the `\r`.
    End,
}

/// How an input `\r` is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CarriageReturn {
    /// Deliver `\n`. If `swallow_next`, the lookahead character is part of the terminator.
    Newline { swallow_next: bool },
    /// Deliver `\n` and drop the next character if it turns out to be `\n`.
    NewlineSkipLf,
    /// Deliver `\r` unchanged.
    Literal,
    /// Cannot decide until more input is available.
    Undecided,
}

pub(crate) fn translate_cr(mode: Translation, next: Lookahead) -> CarriageReturn {
    match (mode, next) {
        (Translation::Lf | Translation::Binary, _) => CarriageReturn::Literal,
        (Translation::Cr, _) => CarriageReturn::Newline {
            swallow_next: false,
        },
        (Translation::CrLf | Translation::Auto, Lookahead::Char('\n')) => {
            CarriageReturn::Newline { swallow_next: true }
        }
        (Translation::CrLf, Lookahead::Char(_) | Lookahead::End) => CarriageReturn::Literal,
        (Translation::CrLf, Lookahead::Pending) => CarriageReturn::Undecided,
        (Translation::Auto, Lookahead::Char(_) | Lookahead::End) => CarriageReturn::Newline {
            swallow_next: false,
        },
        (Translation::Auto, Lookahead::Pending) => CarriageReturn::NewlineSkipLf,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        for mode in [
            Translation::Auto,
            Translation::Binary,
            Translation::Lf,
            Translation::Cr,
            Translation::CrLf,
        ] {
            assert_eq!(Translation::from_name(mode.name()), Some(mode));
        }

        assert_eq!(Translation::from_name("platform"), Some(Translation::PLATFORM));
        assert_eq!(Translation::from_name("LF"), None);
    }

    #[test]
    fn output_newlines() {
        assert_eq!(Translation::Lf.output_newline(), "\n");
        assert_eq!(Translation::Cr.output_newline(), "\r");
        assert_eq!(Translation::CrLf.output_newline(), "\r\n");
        assert_eq!(
            Translation::Auto.output_newline(),
            Translation::PLATFORM.output_newline()
        );
        assert!(Translation::Binary.is_transparent_output());
        assert!(!Translation::Cr.is_transparent_output());
    }

    #[test]
    fn crlf_needs_lookahead() {
        assert_eq!(
            translate_cr(Translation::CrLf, Lookahead::Char('\n')),
            CarriageReturn::Newline { swallow_next: true }
        );
        assert_eq!(
            translate_cr(Translation::CrLf, Lookahead::Char('x')),
            CarriageReturn::Literal
        );
        assert_eq!(
            translate_cr(Translation::CrLf, Lookahead::End),
            CarriageReturn::Literal
        );
        assert_eq!(
            translate_cr(Translation::CrLf, Lookahead::Pending),
            CarriageReturn::Undecided
        );
    }

    #[test]
    fn auto_never_waits() {
        assert_eq!(
            translate_cr(Translation::Auto, Lookahead::Pending),
            CarriageReturn::NewlineSkipLf
        );
        assert_eq!(
            translate_cr(Translation::Auto, Lookahead::Char('a')),
            CarriageReturn::Newline {
                swallow_next: false
            }
        );
        assert_eq!(
            translate_cr(Translation::Cr, Lookahead::Pending),
            CarriageReturn::Newline {
                swallow_next: false
            }
        );
        assert_eq!(
            translate_cr(Translation::Lf, Lookahead::Char('\n')),
            CarriageReturn::Literal
        );
    }
}
