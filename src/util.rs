// Copyright (c) 2019, 2020 Codethink Ltd.
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};

/// Seconds between 1601-01-01 and 1970-01-01, the FILETIME and Unix epochs.
const FILETIME_UNIX_OFFSET_SECS: u64 = 11_644_473_600;

pub fn get_source_date_epoch() -> Option<u64> {
    std::env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
}

/// The single timestamp shared by every document of one build.
/// `SOURCE_DATE_EPOCH` pins it for reproducible output.
pub fn build_timestamp() -> Result<DateTime<Utc>> {
    match get_source_date_epoch() {
        Some(ep) => DateTime::from_timestamp(ep as i64, 0)
            .ok_or_else(|| anyhow::anyhow!("Invalid SOURCE_DATE_EPOCH timestamp: {}", ep)),
        None => Ok(Utc::now()),
    }
}

/// RFC 3339 in UTC with only as many fractional digits as needed.
pub fn format_created(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Windows FILETIME (100ns ticks since 1601-01-01 UTC) for whole Unix seconds.
pub fn epoch_filetime(secs: u64) -> u64 {
    (secs + FILETIME_UNIX_OFFSET_SECS) * 10_000_000
}
