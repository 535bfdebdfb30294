// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! End-of-line translation and end-of-file characters as seen through the public API.

#![cfg(feature = "fakes")]

use channel_io::{
    ChannelId, ChannelSystem, FakeDeviceHandle, FakeDriver, Mode, SystemConfig, Translation,
};

fn system(buffer_size: usize) -> ChannelSystem {
    ChannelSystem::new(
        SystemConfig::default()
            .with_buffer_size(buffer_size)
            .without_std_channels(),
    )
}

fn channel(system: &mut ChannelSystem, translation: Translation) -> (ChannelId, FakeDeviceHandle) {
    let (driver, device) = FakeDriver::new();
    let id = system.create_channel(Box::new(driver), Mode::all());
    system
        .set_translation(id, Some(translation), Some(translation))
        .unwrap();
    (id, device)
}

fn round_trip(translation: Translation, text: &str) -> String {
    let mut system = system(16);

    let (writer, written) = channel(&mut system, translation);
    system.write_chars(writer, text).unwrap();
    system.flush(writer).unwrap();

    let (reader, device) = channel(&mut system, translation);
    device.push_input(&written.written());

    let mut read = String::new();
    system.read_chars(reader, None, &mut read).unwrap();
    read
}

#[test]
fn text_survives_write_and_read_with_same_translation() {
    let plain = [
        "",
        "one line\n",
        "two\nlines\n",
        "trailing partial line",
        "\n\n\nblank lines\n\n",
        "a line that is longer than one sixteen byte buffer\nand another\n",
    ];
    for translation in [Translation::Lf, Translation::Cr, Translation::CrLf, Translation::Auto] {
        for text in plain {
            assert_eq!(round_trip(translation, text), text, "{translation}: {text:?}");
        }
    }

    // A carriage return in the text only survives when it does not terminate lines itself.
    let with_returns = ["carriage\rreturn\n", "dos\r\nline\r\n", "ends with\r"];
    for translation in [Translation::Lf, Translation::CrLf] {
        for text in with_returns {
            assert_eq!(round_trip(translation, text), text, "{translation}: {text:?}");
        }
    }
}

#[test]
fn terminator_split_across_buffers_reads_like_unsplit() {
    let input = b"abcdefg\r\nhijklmnopq\r\nrst\r\n";

    let lines = |buffer_size| {
        let mut system = system(buffer_size);
        let (id, device) = channel(&mut system, Translation::CrLf);
        device.push_input(input);

        let mut lines = Vec::new();
        let mut line = String::new();
        while system.read_line(id, &mut line).unwrap().is_some() {
            lines.push(std::mem::take(&mut line));
        }
        lines
    };

    assert_eq!(lines(8), ["abcdefg", "hijklmnopq", "rst"]);
    assert_eq!(lines(8), lines(4096));
}

#[test]
fn auto_joins_carriage_return_and_newline_from_separate_reads() {
    let mut system = system(4096);
    let (id, device) = channel(&mut system, Translation::Auto);
    device.push_input(b"line1\r");
    device.push_input(b"\nline2\n");

    let mut line = String::new();
    assert_eq!(system.read_line(id, &mut line).unwrap(), Some(5));
    assert_eq!(line, "line1");

    line.clear();
    assert_eq!(system.read_line(id, &mut line).unwrap(), Some(5));
    assert_eq!(line, "line2");

    line.clear();
    assert_eq!(system.read_line(id, &mut line).unwrap(), None);
    assert!(system.eof(id).unwrap());
}

#[test]
fn eof_char_ends_input_for_good() {
    let mut system = system(4096);
    let (id, device) = channel(&mut system, Translation::Lf);
    system.configure(id, "-eofchar", "\u{1a} {}").unwrap();
    device.push_input(b"hello\x1aworld");

    let mut text = String::new();
    system.read_chars(id, None, &mut text).unwrap();
    assert_eq!(text, "hello");
    assert!(system.eof(id).unwrap());

    let requests = device.input_requests().len();
    let mut more = String::new();
    assert_eq!(system.read_chars(id, None, &mut more).unwrap(), 0);
    let mut bytes = Vec::new();
    assert_eq!(system.read_bytes(id, 4, &mut bytes).unwrap(), 0);
    assert!(system.eof(id).unwrap());
    assert_eq!(device.input_requests().len(), requests);
}

#[test]
fn reconfiguring_eof_char_resumes_reading() {
    let mut system = system(4096);
    let (id, device) = channel(&mut system, Translation::Lf);
    system.set_eof_chars(id, Some(b'.'), None).unwrap();
    device.push_input(b"first.second");

    let mut text = String::new();
    system.read_chars(id, None, &mut text).unwrap();
    assert_eq!(text, "first");

    system.set_eof_chars(id, None, None).unwrap();
    text.clear();
    system.read_chars(id, None, &mut text).unwrap();
    assert_eq!(text, ".second");
}
