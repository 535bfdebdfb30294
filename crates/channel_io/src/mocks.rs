// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io;

use mockall::mock;

use crate::{SeekDriver, TruncateDriver, Whence};

mock! {
    #[derive(Debug)]
    pub SeekDriver {}

    impl SeekDriver for SeekDriver {
        fn seek(&mut self, offset: i64, whence: Whence) -> io::Result<u64>;
    }
}

mock! {
    #[derive(Debug)]
    pub TruncateDriver {}

    impl TruncateDriver for TruncateDriver {
        fn truncate(&mut self, len: u64) -> io::Result<()>;
    }
}
