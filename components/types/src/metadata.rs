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

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use kasumi_common::PartSize;
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};

use crate::{
    err::{CorruptedMetadataSnafu, InvalidArgumentSnafu, MetadataIoSnafu, Result},
    partition::part_count,
};

/// The record a store driver keeps for every stored value.
///
/// Binary form, all integers big-endian:
/// `[i32 key_len][key][i32 part_num][i64 entry_size][i32 extra_len][extra]`,
/// where `extra_len == 0` means there is no extra payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BigKeyValueStoreMetadata {
    key:        String,
    /// How many parts the value was split into.
    part_num:   u32,
    /// The logical length of the whole value.
    entry_size: u64,
    extra:      Option<Bytes>,
}

impl BigKeyValueStoreMetadata {
    pub fn new(key: &str, part_num: u32, entry_size: u64, extra: Option<Bytes>) -> Result<Self> {
        ensure!(
            !key.is_empty(),
            InvalidArgumentSnafu {
                reason: "metadata key must not be empty",
            }
        );
        ensure!(
            i32::try_from(key.len()).is_ok(),
            InvalidArgumentSnafu {
                reason: format!("metadata key is too long: {} bytes", key.len()),
            }
        );
        ensure!(
            i32::try_from(part_num).is_ok(),
            InvalidArgumentSnafu {
                reason: format!("part number {part_num} is out of range"),
            }
        );
        ensure!(
            i64::try_from(entry_size).is_ok(),
            InvalidArgumentSnafu {
                reason: format!("entry size {entry_size} is out of range"),
            }
        );
        // an empty payload is the same as no payload in the binary form.
        let extra = extra.filter(|e| !e.is_empty());
        if let Some(extra) = &extra {
            ensure!(
                i32::try_from(extra.len()).is_ok(),
                InvalidArgumentSnafu {
                    reason: format!("extra payload is too long: {} bytes", extra.len()),
                }
            );
        }
        Ok(Self {
            key: key.to_string(),
            part_num,
            entry_size,
            extra,
        })
    }

    /// Describes a value of `entry_size` bytes split into `part_size` parts.
    pub fn for_value(
        key: &str,
        entry_size: u64,
        part_size: PartSize,
        extra: Option<Bytes>,
    ) -> Result<Self> {
        ensure!(
            part_size > 0,
            InvalidArgumentSnafu {
                reason: "part size must be positive",
            }
        );
        let part_num = u32::try_from(part_count(entry_size, part_size)).ok();
        let part_num = part_num.ok_or_else(|| {
            InvalidArgumentSnafu {
                reason: format!("{entry_size} bytes need too many parts of {part_size} bytes"),
            }
            .build()
        })?;
        Self::new(key, part_num, entry_size, extra)
    }

    pub fn key(&self) -> &str { &self.key }

    pub fn part_num(&self) -> u32 { self.part_num }

    pub fn entry_size(&self) -> u64 { self.entry_size }

    pub fn extra(&self) -> Option<&Bytes> { self.extra.as_ref() }

    /// Returns a copy carrying another extra payload.
    pub fn with_extra(&self, extra: Option<Bytes>) -> Result<Self> {
        Self::new(&self.key, self.part_num, self.entry_size, extra)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let extra_len = self.extra.as_ref().map_or(0, Bytes::len);
        let mut buf = Vec::with_capacity(4 + self.key.len() + 4 + 8 + 4 + extra_len);
        buf.write_i32::<BigEndian>(self.key.len() as i32)
            .context(MetadataIoSnafu)?;
        buf.extend_from_slice(self.key.as_bytes());
        buf.write_i32::<BigEndian>(self.part_num as i32)
            .context(MetadataIoSnafu)?;
        buf.write_i64::<BigEndian>(self.entry_size as i64)
            .context(MetadataIoSnafu)?;
        buf.write_i32::<BigEndian>(extra_len as i32)
            .context(MetadataIoSnafu)?;
        if let Some(extra) = &self.extra {
            buf.extend_from_slice(extra);
        }
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);

        let key_len = read_len(&mut cursor, "key")?;
        ensure!(
            key_len > 0,
            CorruptedMetadataSnafu {
                reason: "empty key",
            }
        );
        let key = read_exact(&mut cursor, key_len, "key")?;
        let key = String::from_utf8(key).ok().ok_or_else(|| {
            CorruptedMetadataSnafu {
                reason: "key is not valid utf-8",
            }
            .build()
        })?;

        let part_num = cursor.read_i32::<BigEndian>().context(MetadataIoSnafu)?;
        let entry_size = cursor.read_i64::<BigEndian>().context(MetadataIoSnafu)?;
        ensure!(
            part_num >= 0 && entry_size >= 0,
            CorruptedMetadataSnafu {
                reason: format!("negative part_num {part_num} or entry_size {entry_size}"),
            }
        );

        let extra_len = read_len(&mut cursor, "extra")?;
        let extra = if extra_len == 0 {
            None
        } else {
            Some(Bytes::from(read_exact(&mut cursor, extra_len, "extra")?))
        };
        ensure!(
            cursor.position() as usize == buf.len(),
            CorruptedMetadataSnafu {
                reason: format!("{} trailing bytes", buf.len() - cursor.position() as usize),
            }
        );

        Ok(Self {
            key,
            part_num: part_num as u32,
            entry_size: entry_size as u64,
            extra,
        })
    }
}

fn read_len(cursor: &mut Cursor<&[u8]>, field: &str) -> Result<usize> {
    let len = cursor.read_i32::<BigEndian>().context(MetadataIoSnafu)?;
    ensure!(
        len >= 0,
        CorruptedMetadataSnafu {
            reason: format!("negative {field} length {len}"),
        }
    );
    Ok(len as usize)
}

fn read_exact(cursor: &mut Cursor<&[u8]>, len: usize, field: &str) -> Result<Vec<u8>> {
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    ensure!(
        len <= remaining,
        CorruptedMetadataSnafu {
            reason: format!("{field} needs {len} bytes, only {remaining} left"),
        }
    );
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf).context(MetadataIoSnafu)?;
    Ok(buf)
}
