// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;

use tracing::{Level, event};

use crate::config::clamp_buffer_size;
use crate::encoding::{DecoderState, EncoderState};
use crate::flags::ChannelFlags;
use crate::state::ChannelState;
use crate::{ChannelId, ChannelSystem, Encoding, Error, Mode, Result, Translation};

const GENERIC_OPTIONS: [&str; 6] = [
    "-blocking",
    "-buffering",
    "-buffersize",
    "-encoding",
    "-eofchar",
    "-translation",
];

/// When buffered output is handed to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Buffering {
    /// When a buffer is full or on an explicit flush.
    Full,
    /// Also after every write that contains a newline.
    Line,
    /// After every write.
    Unbuffered,
}

impl Buffering {
    /// The name used for this mode in channel options.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Line => "line",
            Self::Unbuffered => "none",
        }
    }

    /// Parses an option value.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "full" => Some(Self::Full),
            "line" => Some(Self::Line),
            "none" => Some(Self::Unbuffered),
            _ => None,
        }
    }
}

impl fmt::Display for Buffering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn bad_value(option: &str, reason: impl Into<String>) -> Error {
    Error::BadValue {
        option: option.to_string(),
        reason: reason.into(),
    }
}

fn parse_bool(option: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(bad_value(option, format!("expected boolean value but got \"{value}\""))),
    }
}

/// Splits a list of up to two elements, such as `{} x` or `{lf crlf}`.
fn split_list(option: &str, value: &str) -> Result<Vec<String>> {
    let value = value.trim();
    let value = value
        .strip_prefix('{')
        .and_then(|inner| inner.strip_suffix('}'))
        .filter(|inner| !inner.contains(['{', '}']) && !inner.trim().is_empty())
        .unwrap_or(value);

    let mut elements = Vec::new();
    let mut rest = value.trim_start();
    while !rest.is_empty() {
        if let Some(braced) = rest.strip_prefix('{') {
            let end = braced
                .find('}')
                .ok_or_else(|| bad_value(option, "unmatched open brace in list"))?;
            elements.push(braced[..end].to_string());
            rest = braced[end + 1..].trim_start();
        } else {
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            elements.push(rest[..end].to_string());
            rest = rest[end..].trim_start();
        }
    }
    Ok(elements)
}

fn list_element(value: &str) -> String {
    if value.is_empty() || value.contains(char::is_whitespace) {
        format!("{{{value}}}")
    } else {
        value.to_string()
    }
}

fn parse_eof_char(option: &str, value: &str) -> Result<Option<u8>> {
    let mut chars = value.chars();
    match (chars.next(), chars.next()) {
        (None, _) => Ok(None),
        (Some(ch), None) if ch.is_ascii() && ch != '\0' => Ok(Some(ch as u8)),
        _ => Err(bad_value(option, "must be non-NUL ASCII character")),
    }
}

fn describe_options(names: &[&str]) -> String {
    match names {
        [] => String::new(),
        [only] => (*only).to_string(),
        [init @ .., last] => format!("{}, or {last}", init.join(", ")),
    }
}

impl ChannelState {
    fn buffering(&self) -> Buffering {
        if self.flags.contains(ChannelFlags::UNBUFFERED) {
            Buffering::Unbuffered
        } else if self.flags.contains(ChannelFlags::LINE_BUFFERED) {
            Buffering::Line
        } else {
            Buffering::Full
        }
    }

    fn set_buffering(&mut self, buffering: Buffering) {
        self.flags
            .remove(ChannelFlags::LINE_BUFFERED | ChannelFlags::UNBUFFERED);
        match buffering {
            Buffering::Full => {}
            Buffering::Line => self.flags.insert(ChannelFlags::LINE_BUFFERED),
            Buffering::Unbuffered => self.flags.insert(ChannelFlags::UNBUFFERED),
        }
    }

    fn set_buffer_size(&mut self, size: usize) {
        self.buffer_size = clamp_buffer_size(size);
        // Spares of the old size would be dropped on their next use anyway.
        self.spares.clear();
    }

    // Conversion state of both directions starts over with the new encoding.
    fn set_encoding(&mut self, encoding: Encoding) {
        self.encoding = encoding;
        self.decoder = DecoderState::default();
        self.encoder = EncoderState::default();
        self.bytes_per_char_milli = encoding.typical_char_len() * 1000;
        self.flags.remove(ChannelFlags::NEED_MORE_DATA);
        self.interest_dirty = true;
    }

    fn set_translation(&mut self, input: Option<Translation>, output: Option<Translation>) {
        if let Some(input) = input.filter(|_| self.mode.contains(Mode::READ)) {
            if input != self.input_translation {
                self.input_translation = input;
                self.flags.remove(ChannelFlags::INPUT_SAW_CR);
                self.flags.remove(ChannelFlags::NEED_MORE_DATA);
                self.interest_dirty = true;
            }
            if input == Translation::Binary {
                self.input_eof_char = None;
                self.set_encoding(Encoding::Binary);
            }
        }

        if let Some(output) = output.filter(|_| self.mode.contains(Mode::WRITE)) {
            self.output_translation = output;
            if output == Translation::Binary {
                self.output_eof_char = None;
                self.set_encoding(Encoding::Binary);
            }
        }
    }

    fn set_eof_chars(&mut self, input: Option<u8>, output: Option<u8>) {
        if self.mode.contains(Mode::READ) {
            self.input_eof_char = input;
        }
        if self.mode.contains(Mode::WRITE) {
            self.output_eof_char = output;
        }
        self.flags.remove(
            ChannelFlags::EOF | ChannelFlags::STICKY_EOF | ChannelFlags::BLOCKED,
        );
        self.interest_dirty = true;
    }

    // Formats a value that may differ per direction: one element for a channel open in one
    // direction, a two-element list otherwise.
    fn per_direction(&self, input: String, output: String) -> String {
        if self.mode == Mode::all() {
            format!("{} {}", list_element(&input), list_element(&output))
        } else if self.mode.contains(Mode::READ) {
            input
        } else {
            output
        }
    }

    fn generic_option(&self, name: &str) -> Option<String> {
        let eof = |c: Option<u8>| c.map(|c| char::from(c).to_string()).unwrap_or_default();

        Some(match name {
            "-blocking" => String::from(if self.is_nonblocking() { "0" } else { "1" }),
            "-buffering" => self.buffering().name().to_string(),
            "-buffersize" => self.buffer_size.to_string(),
            "-encoding" => self.encoding.name().to_string(),
            "-eofchar" => self.per_direction(eof(self.input_eof_char), eof(self.output_eof_char)),
            "-translation" => self.per_direction(
                self.input_translation.name().to_string(),
                self.output_translation.name().to_string(),
            ),
            _ => return None,
        })
    }

    fn all_option_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = GENERIC_OPTIONS.to_vec();
        for layer in self.layers.iter().rev() {
            for name in layer.driver.option_names() {
                if !names.contains(name) {
                    names.push(name);
                }
            }
        }
        names
    }

    fn bad_option(&self, option: &str) -> Error {
        Error::BadOption {
            option: option.to_string(),
            expected: describe_options(&self.all_option_names()),
        }
    }
}

impl ChannelSystem {
    /// Sets a channel option from its string form.
    ///
    /// The generic options are `-blocking`, `-buffering`, `-buffersize`, `-encoding`,
    /// `-eofchar` and `-translation`. Any other option is passed to the drivers, top first.
    ///
    /// # Errors
    ///
    /// Fails if no driver recognizes the option or the value is not valid for it.
    pub fn configure(&mut self, id: ChannelId, option: &str, value: &str) -> Result<()> {
        match option {
            "-blocking" => self.set_blocking(id, parse_bool(option, value)?),
            "-buffering" => {
                let buffering = Buffering::from_name(value).ok_or_else(|| {
                    bad_value(option, "must be one of full, line, or none")
                })?;
                self.set_buffering(id, buffering)
            }
            "-buffersize" => {
                let size = value.trim().parse::<usize>().map_err(|_| {
                    bad_value(option, format!("expected integer but got \"{value}\""))
                })?;
                self.set_buffer_size(id, size)
            }
            "-encoding" => {
                let encoding = if value.is_empty() {
                    Encoding::Binary
                } else {
                    Encoding::from_name(value)
                        .ok_or_else(|| Error::UnknownEncoding(value.to_string()))?
                };
                self.set_encoding(id, encoding)
            }
            "-eofchar" => {
                let elements = split_list(option, value)?;
                let (input, output) = match elements.as_slice() {
                    [] => (None, None),
                    [both] => {
                        let c = parse_eof_char(option, both)?;
                        (c, c)
                    }
                    [input, output] => (
                        parse_eof_char(option, input)?,
                        parse_eof_char(option, output)?,
                    ),
                    _ => {
                        return Err(bad_value(
                            option,
                            "should be a list of no more than two elements",
                        ));
                    }
                };
                self.set_eof_chars(id, input, output)
            }
            "-translation" => {
                let elements = split_list(option, value)?;
                let parse = |name: &str| {
                    Translation::from_name(name).ok_or_else(|| {
                        bad_value(
                            option,
                            "must be one of auto, binary, cr, lf, crlf, or platform",
                        )
                    })
                };
                let (input, output) = match elements.as_slice() {
                    [both] => {
                        let translation = parse(both)?;
                        (translation, translation)
                    }
                    [input, output] => (parse(input)?, parse(output)?),
                    _ => {
                        return Err(bad_value(
                            option,
                            "should be a list of one or two elements",
                        ));
                    }
                };
                self.set_translation(id, Some(input), Some(output))
            }
            _ => self.configure_driver(id, option, value),
        }
    }

    fn configure_driver(&mut self, id: ChannelId, option: &str, value: &str) -> Result<()> {
        let state = self.state_mut(id)?;
        state.check_usable()?;

        for level in (0..state.layers.len()).rev() {
            match state.layers[level].driver.set_option(option, value) {
                Some(Ok(())) => return Ok(()),
                Some(Err(e)) => return Err(state.driver_error(level, e)),
                None => {}
            }
        }
        Err(state.bad_option(option))
    }

    /// The value of a channel option in the string form [`configure`][Self::configure]
    /// accepts.
    ///
    /// # Errors
    ///
    /// Fails if no driver recognizes the option.
    pub fn cget(&mut self, id: ChannelId, option: &str) -> Result<String> {
        let state = self.state_mut(id)?;
        if let Some(value) = state.generic_option(option) {
            return Ok(value);
        }

        for level in (0..state.layers.len()).rev() {
            match state.layers[level].driver.option(option) {
                Some(Ok(value)) => return Ok(value),
                Some(Err(e)) => return Err(state.driver_error(level, e)),
                None => {}
            }
        }
        Err(state.bad_option(option))
    }

    /// Every option of the channel with its value, generic options first.
    ///
    /// # Errors
    ///
    /// Fails if the handle is no longer valid or a driver cannot report one of its options.
    pub fn configure_all(&mut self, id: ChannelId) -> Result<Vec<(String, String)>> {
        let names = self.state(id)?.all_option_names();
        names
            .into_iter()
            .map(|name| Ok((name.to_string(), self.cget(id, name)?)))
            .collect()
    }

    /// Switches the channel and all of its drivers between blocking and non-blocking mode.
    ///
    /// # Errors
    ///
    /// Fails if a driver cannot switch.
    pub fn set_blocking(&mut self, id: ChannelId, blocking: bool) -> Result<()> {
        let state = self.state_mut(id)?;
        state.check_usable()?;
        state.set_blocking(blocking)?;
        event!(
            Level::TRACE,
            message = "blocking mode changed",
            channel = %state.name,
            blocking
        );
        self.refresh_interest(id);
        Ok(())
    }

    /// Whether the channel is in blocking mode.
    ///
    /// # Errors
    ///
    /// Fails if the handle is no longer valid.
    pub fn is_blocking(&self, id: ChannelId) -> Result<bool> {
        Ok(!self.state(id)?.is_nonblocking())
    }

    /// Sets when buffered output is handed to the device.
    ///
    /// # Errors
    ///
    /// Fails if the handle is no longer valid.
    pub fn set_buffering(&mut self, id: ChannelId, buffering: Buffering) -> Result<()> {
        self.state_mut(id)?.set_buffering(buffering);
        Ok(())
    }

    /// When buffered output is handed to the device.
    ///
    /// # Errors
    ///
    /// Fails if the handle is no longer valid.
    pub fn buffering(&self, id: ChannelId) -> Result<Buffering> {
        Ok(self.state(id)?.buffering())
    }

    /// Sets the size of the buffers allocated from now on, clamped to the supported range.
    ///
    /// # Errors
    ///
    /// Fails if the handle is no longer valid.
    pub fn set_buffer_size(&mut self, id: ChannelId, size: usize) -> Result<()> {
        self.state_mut(id)?.set_buffer_size(size);
        Ok(())
    }

    /// The size of newly allocated buffers.
    ///
    /// # Errors
    ///
    /// Fails if the handle is no longer valid.
    pub fn buffer_size(&self, id: ChannelId) -> Result<usize> {
        Ok(self.state(id)?.buffer_size)
    }

    /// Changes the encoding of the channel. Output buffered so far keeps its old encoding;
    /// buffered input is decoded with the new one.
    ///
    /// # Errors
    ///
    /// Fails if the handle is no longer valid.
    pub fn set_encoding(&mut self, id: ChannelId, encoding: Encoding) -> Result<()> {
        let state = self.state_mut(id)?;
        state.check_usable()?;
        state.set_encoding(encoding);
        self.refresh_interest(id);
        Ok(())
    }

    /// The encoding of the channel.
    ///
    /// # Errors
    ///
    /// Fails if the handle is no longer valid.
    pub fn encoding(&self, id: ChannelId) -> Result<Encoding> {
        Ok(self.state(id)?.encoding)
    }

    /// Sets the end-of-line translation per direction. `None` leaves a direction unchanged, as
    /// does a direction the channel is not open for. [`Translation::Binary`] also switches the
    /// channel to binary encoding and clears the end-of-file character of that direction.
    ///
    /// # Errors
    ///
    /// Fails if the handle is no longer valid.
    pub fn set_translation(
        &mut self,
        id: ChannelId,
        input: Option<Translation>,
        output: Option<Translation>,
    ) -> Result<()> {
        let state = self.state_mut(id)?;
        state.check_usable()?;
        state.set_translation(input, output);
        self.refresh_interest(id);
        Ok(())
    }

    /// The input and output translation of the channel.
    ///
    /// # Errors
    ///
    /// Fails if the handle is no longer valid.
    pub fn translation(&self, id: ChannelId) -> Result<(Translation, Translation)> {
        let state = self.state(id)?;
        Ok((state.input_translation, state.output_translation))
    }

    /// Sets the end-of-file characters. Input stops at the first input end-of-file character;
    /// the output one is written when the channel closes. Reading resumes after a change.
    ///
    /// # Errors
    ///
    /// Fails if the handle is no longer valid.
    pub fn set_eof_chars(
        &mut self,
        id: ChannelId,
        input: Option<u8>,
        output: Option<u8>,
    ) -> Result<()> {
        let state = self.state_mut(id)?;
        state.check_usable()?;
        state.set_eof_chars(input, output);
        self.refresh_interest(id);
        Ok(())
    }

    /// The input and output end-of-file characters.
    ///
    /// # Errors
    ///
    /// Fails if the handle is no longer valid.
    pub fn eof_chars(&self, id: ChannelId) -> Result<(Option<u8>, Option<u8>)> {
        let state = self.state(id)?;
        Ok((state.input_eof_char, state.output_eof_char))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeDeviceHandle, FakeDriver};
    use crate::SystemConfig;

    fn system() -> ChannelSystem {
        ChannelSystem::new(SystemConfig::default().without_std_channels())
    }

    fn channel(system: &mut ChannelSystem, mode: Mode) -> (ChannelId, FakeDeviceHandle) {
        let (driver, device) = FakeDriver::new();
        let driver = driver.with_option("-peername", "example.org");
        (system.create_channel(Box::new(driver), mode), device)
    }

    #[test]
    fn generic_options_round_trip() {
        let mut system = system();
        let (id, device) = channel(&mut system, Mode::all());

        system.configure(id, "-blocking", "0").unwrap();
        system.configure(id, "-buffering", "line").unwrap();
        system.configure(id, "-buffersize", "10").unwrap();
        system.configure(id, "-encoding", "iso8859-1").unwrap();
        system.configure(id, "-eofchar", "{} x").unwrap();
        system.configure(id, "-translation", "{auto crlf}").unwrap();

        assert_eq!(system.cget(id, "-blocking").unwrap(), "0");
        assert_eq!(device.is_blocking(), Some(false));
        assert_eq!(system.cget(id, "-buffering").unwrap(), "line");
        assert_eq!(system.cget(id, "-buffersize").unwrap(), "10");
        assert_eq!(system.cget(id, "-encoding").unwrap(), "iso8859-1");
        assert_eq!(system.cget(id, "-eofchar").unwrap(), "{} x");
        assert_eq!(system.cget(id, "-translation").unwrap(), "auto crlf");
    }

    #[test]
    fn single_direction_values_are_plain() {
        let mut system = system();
        let (id, _device) = channel(&mut system, Mode::READ);

        system.configure(id, "-translation", "cr").unwrap();
        system.configure(id, "-eofchar", "\u{1a}").unwrap();

        assert_eq!(system.cget(id, "-translation").unwrap(), "cr");
        assert_eq!(system.cget(id, "-eofchar").unwrap(), "\u{1a}");
        assert_eq!(system.eof_chars(id).unwrap(), (Some(0x1a), None));
    }

    #[test]
    fn buffer_size_is_clamped() {
        let mut system = system();
        let (id, _device) = channel(&mut system, Mode::all());

        system.configure(id, "-buffersize", "0").unwrap();
        assert_eq!(system.buffer_size(id).unwrap(), 1);

        system.set_buffer_size(id, usize::MAX).unwrap();
        assert_eq!(system.buffer_size(id).unwrap(), 1024 * 1024);
    }

    #[test]
    fn binary_translation_implies_binary_encoding() {
        let mut system = system();
        let (id, _device) = channel(&mut system, Mode::all());
        system.set_eof_chars(id, Some(b'x'), Some(b'y')).unwrap();

        system.configure(id, "-translation", "binary").unwrap();

        assert_eq!(system.encoding(id).unwrap(), Encoding::Binary);
        assert_eq!(system.eof_chars(id).unwrap(), (None, None));
        assert_eq!(
            system.translation(id).unwrap(),
            (Translation::Binary, Translation::Binary)
        );
    }

    #[test]
    fn driver_options_are_forwarded() {
        let mut system = system();
        let (id, device) = channel(&mut system, Mode::all());

        assert_eq!(system.cget(id, "-peername").unwrap(), "example.org");
        system.configure(id, "-peername", "example.com").unwrap();
        assert_eq!(device.option("-peername").as_deref(), Some("example.com"));

        let all = system.configure_all(id).unwrap();
        assert_eq!(all.len(), 7);
        assert_eq!(all[6], ("-peername".to_string(), "example.com".to_string()));
    }

    #[test]
    fn unknown_option_lists_the_known_ones() {
        let mut system = system();
        let (id, _device) = channel(&mut system, Mode::all());

        let error = system.configure(id, "-bogus", "1").unwrap_err();
        assert_eq!(
            error.to_string(),
            "bad option \"-bogus\": should be one of -blocking, -buffering, -buffersize, \
             -encoding, -eofchar, -translation, or -peername"
        );
    }

    #[test]
    fn bad_values_are_rejected() {
        let mut system = system();
        let (id, _device) = channel(&mut system, Mode::all());

        assert!(matches!(
            system.configure(id, "-encoding", "klingon"),
            Err(Error::UnknownEncoding(name)) if name == "klingon"
        ));
        assert!(matches!(
            system.configure(id, "-buffering", "sometimes"),
            Err(Error::BadValue { .. })
        ));
        assert!(matches!(
            system.configure(id, "-eofchar", "ab"),
            Err(Error::BadValue { .. })
        ));
        assert!(matches!(
            system.configure(id, "-translation", "lf cr crlf"),
            Err(Error::BadValue { .. })
        ));
        assert!(matches!(
            system.configure(id, "-blocking", "maybe"),
            Err(Error::BadValue { .. })
        ));
        assert_eq!(system.cget(id, "-encoding").unwrap(), "utf-8");
    }

    #[test]
    fn list_splitting() {
        assert_eq!(split_list("-x", "").unwrap(), Vec::<String>::new());
        assert_eq!(split_list("-x", "{}").unwrap(), [""]);
        assert_eq!(split_list("-x", "{} {}").unwrap(), ["", ""]);
        assert_eq!(split_list("-x", "{lf crlf}").unwrap(), ["lf", "crlf"]);
        assert_eq!(split_list("-x", "a {}").unwrap(), ["a", ""]);
        assert!(split_list("-x", "{a").is_err());
    }
}
