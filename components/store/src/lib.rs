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


//! What a chunk store driver provides, and the drivers we ship.
//!
//! Small values go through [KeyValueStore]. Chunk bytes go through
//! [BigKeyValueStore], which splits every value into parts of at most
//! `part_size` bytes and keeps a [BigKeyValueStoreMetadata] per key.
//! `replace` is compare-and-swap on both traits; it is the only sanctioned
//! way to update a value somebody else may be updating.

pub mod err;
mod memory;
mod object;
mod placement;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use kasumi_common::{PartIndex, PartSize};
use kasumi_types::{BigKeyValueStoreMetadata, DataStoreProperties};
pub use memory::{MemoryBigKeyValueStore, MemoryKeyValueStore};
pub use object::ObjectBigKeyValueStore;
pub use placement::Placement;
use snafu::ensure;

use crate::err::{CorruptedSnafu, Result};

#[async_trait]
pub trait KeyValueStore<V>: Send + Sync
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    fn name(&self) -> &str;

    fn placement(&self) -> &Placement;

    fn properties(&self) -> &DataStoreProperties { self.placement().properties() }

    async fn len(&self) -> Result<usize>;

    async fn is_empty(&self) -> Result<bool> { Ok(self.len().await? == 0) }

    async fn contains_key(&self, key: &str) -> Result<bool> { Ok(self.get(key).await?.is_some()) }

    async fn get(&self, key: &str) -> Result<Option<V>>;

    /// Stores the value, returns the one it replaced.
    async fn put(&self, key: &str, value: V) -> Result<Option<V>>;

    /// Stores the value unless the key is taken, returns the current value
    /// when it is.
    async fn put_if_absent(&self, key: &str, value: V) -> Result<Option<V>>;

    /// Swaps in `new` only if the stored value still equals `old`.
    async fn replace(&self, key: &str, old: &V, new: V) -> Result<bool>;

    async fn remove(&self, key: &str) -> Result<Option<V>>;

    async fn clear(&self) -> Result<()>;

    async fn keys(&self) -> Result<Vec<String>>;

    fn primary_node(&self, key: &str) -> &str { self.placement().primary_node(key) }

    fn backup_nodes(&self, key: &str) -> Vec<&str> { self.placement().backup_nodes(key) }

    fn primary_and_backup_nodes(&self, key: &str) -> Vec<&str> {
        self.placement().primary_and_backup_nodes(key)
    }
}

#[async_trait]
pub trait BigKeyValueStore: Send + Sync {
    fn name(&self) -> &str;

    fn placement(&self) -> &Placement;

    fn properties(&self) -> &DataStoreProperties { self.placement().properties() }

    /// The largest part a value is split into.
    fn part_size(&self) -> PartSize;

    async fn contains_key(&self, key: &str) -> Result<bool> {
        Ok(self.get_metadata(key).await?.is_some())
    }

    async fn get_metadata(&self, key: &str) -> Result<Option<BigKeyValueStoreMetadata>>;

    /// One part of the value, `None` when the key is absent.
    async fn get_data_part(&self, key: &str, part_no: PartIndex) -> Result<Option<Bytes>>;

    /// The whole value, reassembled from its parts. A concurrent `put` of
    /// the same key is seen whole or not at all.
    async fn get_data(&self, key: &str) -> Result<Option<Bytes>>;

    /// Stores the value split in parts, returns its metadata.
    async fn put(
        &self,
        key: &str,
        value: Bytes,
        extra: Option<Bytes>,
    ) -> Result<BigKeyValueStoreMetadata>;

    /// Stores the value unless the key is taken, returns the current
    /// metadata when it is.
    async fn put_if_absent(
        &self,
        key: &str,
        value: Bytes,
        extra: Option<Bytes>,
    ) -> Result<Option<BigKeyValueStoreMetadata>>;

    /// Swaps the metadata of `key` from `old` to `new`. The stored parts are
    /// kept, so `new` must describe the same key, part count and size; only
    /// the extra payload may differ.
    async fn replace(
        &self,
        key: &str,
        old: &BigKeyValueStoreMetadata,
        new: BigKeyValueStoreMetadata,
    ) -> Result<bool>;

    async fn remove(&self, key: &str) -> Result<Option<BigKeyValueStoreMetadata>>;

    async fn clear(&self) -> Result<()>;

    async fn keys(&self) -> Result<Vec<String>>;

    fn primary_node(&self, key: &str) -> &str { self.placement().primary_node(key) }

    fn backup_nodes(&self, key: &str) -> Vec<&str> { self.placement().backup_nodes(key) }

    fn primary_and_backup_nodes(&self, key: &str) -> Vec<&str> {
        self.placement().primary_and_backup_nodes(key)
    }
}

/// Checks a metadata swap keeps the stored parts valid.
fn check_replacement(
    key: &str,
    old: &BigKeyValueStoreMetadata,
    new: &BigKeyValueStoreMetadata,
) -> Result<()> {
    ensure!(
        old.key() == key && new.key() == key,
        err::InvalidArgumentSnafu {
            reason: format!(
                "replacing {key} with metadata of {} and {}",
                old.key(),
                new.key()
            ),
        }
    );
    ensure!(
        old.part_num() == new.part_num() && old.entry_size() == new.entry_size(),
        err::InvalidArgumentSnafu {
            reason: format!(
                "replacing {key} must keep its layout, {} parts of {} bytes became {} parts of {} bytes",
                old.part_num(),
                old.entry_size(),
                new.part_num(),
                new.entry_size()
            ),
        }
    );
    Ok(())
}

/// Joins the parts of one value, checking them against its metadata.
fn assemble(
    key: &str,
    metadata: &BigKeyValueStoreMetadata,
    parts: &[Bytes],
    part_size: PartSize,
) -> Result<Bytes> {
    ensure!(
        parts.len() as u64 == metadata.part_num() as u64,
        CorruptedSnafu {
            key,
            reason: format!("{} parts, metadata says {}", parts.len(), metadata.part_num()),
        }
    );
    let mut value = BytesMut::with_capacity(metadata.entry_size() as usize);
    for (part_no, part) in parts.iter().enumerate() {
        ensure!(
            part.len() as u64 <= part_size,
            CorruptedSnafu {
                key,
                reason: format!("part {part_no} holds {} bytes", part.len()),
            }
        );
        value.extend_from_slice(part);
    }
    ensure!(
        value.len() as u64 == metadata.entry_size(),
        CorruptedSnafu {
            key,
            reason: format!(
                "parts add up to {} bytes, metadata says {}",
                value.len(),
                metadata.entry_size()
            ),
        }
    );
    Ok(value.freeze())
}

/// Cuts `value` into zero-copy parts of `part_size` bytes.
fn split_parts(value: &Bytes, part_size: PartSize) -> Vec<Bytes> {
    kasumi_types::partition::parts(value.len() as u64, part_size)
        .map(|range| value.slice(range.start as usize..range.end() as usize))
        .collect()
}
