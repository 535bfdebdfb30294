// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fakes enabled by the `fakes` feature. Primarily intended to help users test logic built on
//! channels without real devices.

mod fake_driver;
mod rot13_transform;

pub use fake_driver::*;
pub use rot13_transform::*;
