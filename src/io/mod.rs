/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

//! Stream wrappers used to assemble per-connection codec paths: byte
//! accounting, proxy-wide rate limiting, buffered line reads with a hard
//! cap, once-buffered rewrap between connection phases, and a relay copy
//! future with idle accounting.

mod ext;
pub use ext::{LimitedBufReadExt, LimitedReadUntil, LineReadResult};

mod limit;
pub use limit::{BucketGrant, GlobalTrafficLimiter, ThrottleRates};

mod limited_read;
pub use limited_read::{ArcLimitedReaderStats, LimitedReader, LimitedReaderStats, NilLimitedReaderStats};

mod limited_write;
pub use limited_write::{
    ArcLimitedWriterStats, LimitedWriter, LimitedWriterStats, NilLimitedWriterStats,
};

mod limited_copy;
pub use limited_copy::{LimitedCopy, LimitedCopyConfig, LimitedCopyError};

mod once;
pub use once::OnceBufReader;
