// Copyright 2024 kasumi
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Arithmetic for slicing a value of known size into fixed-size parts, and
//! the `<key>:<part_no>` naming convention of the stored parts.
//!
//! Every size here is non-negative by construction; a `part_size` of zero is
//! a caller bug.

use std::cmp::min;

use kasumi_common::{PartIndex, PartSize, PART_KEY_DELIMITER};
use snafu::OptionExt;

use crate::err::{InvalidPartKeySnafu, Result};

#[inline]
pub fn part_start_offset(part_size: PartSize, part_no: PartIndex) -> u64 { part_size * part_no }

/// The size of part `part_no`, only the last part may be shorter than
/// `part_size`. A part past the end of the value is empty.
pub fn actual_part_size(value_size: u64, part_size: PartSize, part_no: PartIndex) -> u64 {
    // min(1025 - 0 * 1024, 1024) = 1024
    // min(1025 - 1 * 1024, 1024) = 1
    let start = part_start_offset(part_size, part_no);
    if start >= value_size {
        return 0;
    }
    min(value_size - start, part_size)
}

pub fn part_count(value_size: u64, part_size: PartSize) -> u64 {
    debug_assert!(part_size > 0, "part size must be positive");
    value_size.div_ceil(part_size)
}

#[inline]
pub fn part_no_for_offset(offset: u64, part_size: PartSize) -> PartIndex {
    debug_assert!(part_size > 0, "part size must be positive");
    offset / part_size
}

/// One part of a partitioned value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    pub part_no: PartIndex,
    /// Offset of the part inside the value.
    pub start:   u64,
    pub len:     u64,
}

impl PartRange {
    pub fn end(&self) -> u64 { self.start + self.len }

    pub fn contains(&self, offset: u64) -> bool { offset >= self.start && offset < self.end() }
}

/// Yields every part of a value of `value_size` bytes, in order.
pub fn parts(value_size: u64, part_size: PartSize) -> impl Iterator<Item = PartRange> {
    (0..part_count(value_size, part_size)).map(move |part_no| PartRange {
        part_no,
        start: part_start_offset(part_size, part_no),
        len: actual_part_size(value_size, part_size, part_no),
    })
}

pub fn make_part_key(key: &str, part_no: PartIndex) -> String {
    format!("{}{}{}", key, PART_KEY_DELIMITER, part_no)
}

/// Strips everything after the last delimiter. A key without delimiter is
/// its own base key.
pub fn partition_key(key: &str) -> &str {
    match key.rfind(PART_KEY_DELIMITER) {
        Some(idx) => &key[..idx],
        None => key,
    }
}

pub fn is_part_key(key: &str) -> bool {
    key.rsplit_once(PART_KEY_DELIMITER)
        .is_some_and(|(base, no)| !base.is_empty() && no.parse::<PartIndex>().is_ok())
}

/// Splits a part key into its base key and part number.
pub fn parse_part_key(key: &str) -> Result<(&str, PartIndex)> {
    let (base, no) = key
        .rsplit_once(PART_KEY_DELIMITER)
        .filter(|(base, _)| !base.is_empty())
        .context(InvalidPartKeySnafu { key })?;
    let part_no = no
        .parse::<PartIndex>()
        .ok()
        .context(InvalidPartKeySnafu { key })?;
    Ok((base, part_no))
}
