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


use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{mapref::entry::Entry, DashMap};
use kasumi_common::{PartIndex, PartSize};
use kasumi_types::BigKeyValueStoreMetadata;
use snafu::{ensure, ResultExt};
use tokio::time::Instant;
use tracing::debug;

use crate::{
    assemble, check_replacement,
    err::{InvalidArgumentSnafu, MetadataSnafu, Result},
    split_parts, BigKeyValueStore, KeyValueStore, Placement,
};

struct Stored<T> {
    value:     T,
    stored_at: Instant,
}

impl<T> Stored<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            stored_at: Instant::now(),
        }
    }

    fn is_expired(&self, ttl: Option<Duration>) -> bool {
        ttl.is_some_and(|ttl| self.stored_at.elapsed() >= ttl)
    }
}

/// Entries of an expirable store are dropped lazily, when they are next
/// touched or when the whole map is walked.
struct ExpiringMap<T> {
    map: DashMap<String, Stored<T>>,
    ttl: Option<Duration>,
}

impl<T> ExpiringMap<T> {
    fn new(ttl: Option<Duration>) -> Self {
        Self {
            map: DashMap::new(),
            ttl,
        }
    }

    fn purge(&self, key: &str) {
        if self.ttl.is_none() {
            return;
        }
        if self
            .map
            .remove_if(key, |_, stored| stored.is_expired(self.ttl))
            .is_some()
        {
            debug!("{} expired", key);
        }
    }

    fn purge_all(&self) {
        if self.ttl.is_some() {
            self.map.retain(|_, stored| !stored.is_expired(self.ttl));
        }
    }

    fn insert(&self, key: &str, value: T) -> Option<T> {
        self.map
            .insert(key.to_string(), Stored::new(value))
            .filter(|old| !old.is_expired(self.ttl))
            .map(|old| old.value)
    }

    /// Returns `f` of the current value when there is one, stores `value`
    /// otherwise.
    fn insert_if_absent<R>(&self, key: &str, value: T, f: impl FnOnce(&T) -> R) -> Option<R> {
        match self.map.entry(key.to_string()) {
            Entry::Occupied(mut o) if o.get().is_expired(self.ttl) => {
                o.insert(Stored::new(value));
                None
            }
            Entry::Occupied(o) => Some(f(&o.get().value)),
            Entry::Vacant(v) => {
                v.insert(Stored::new(value));
                None
            }
        }
    }

    /// Runs `f` on the live value under the shard lock, `None` when absent.
    fn with_mut<R>(&self, key: &str, f: impl FnOnce(&mut Stored<T>) -> R) -> Option<R> {
        self.purge(key);
        self.map.get_mut(key).map(|mut stored| f(&mut stored))
    }

    fn with<R>(&self, key: &str, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.purge(key);
        self.map.get(key).map(|stored| f(&stored.value))
    }

    fn remove(&self, key: &str) -> Option<T> {
        self.map
            .remove(key)
            .map(|(_, stored)| stored)
            .filter(|stored| !stored.is_expired(self.ttl))
            .map(|stored| stored.value)
    }

    fn len(&self) -> usize {
        self.purge_all();
        self.map.len()
    }

    fn keys(&self) -> Vec<String> {
        self.purge_all();
        self.map.iter().map(|e| e.key().clone()).collect()
    }
}

/// An in-process [KeyValueStore].
pub struct MemoryKeyValueStore<V> {
    name:      String,
    placement: Placement,
    entries:   ExpiringMap<V>,
}

impl<V> MemoryKeyValueStore<V> {
    pub fn new(name: &str, placement: Placement) -> Self {
        let ttl = placement.properties().expire_duration();
        Self {
            name: name.to_string(),
            placement,
            entries: ExpiringMap::new(ttl),
        }
    }
}

#[async_trait]
impl<V> KeyValueStore<V> for MemoryKeyValueStore<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    fn name(&self) -> &str { &self.name }

    fn placement(&self) -> &Placement { &self.placement }

    async fn len(&self) -> Result<usize> { Ok(self.entries.len()) }

    async fn get(&self, key: &str) -> Result<Option<V>> { Ok(self.entries.with(key, V::clone)) }

    async fn put(&self, key: &str, value: V) -> Result<Option<V>> {
        Ok(self.entries.insert(key, value))
    }

    async fn put_if_absent(&self, key: &str, value: V) -> Result<Option<V>> {
        Ok(self.entries.insert_if_absent(key, value, V::clone))
    }

    async fn replace(&self, key: &str, old: &V, new: V) -> Result<bool> {
        let swapped = self.entries.with_mut(key, |stored| {
            if stored.value != *old {
                return false;
            }
            *stored = Stored::new(new);
            true
        });
        Ok(swapped.unwrap_or(false))
    }

    async fn remove(&self, key: &str) -> Result<Option<V>> { Ok(self.entries.remove(key)) }

    async fn clear(&self) -> Result<()> {
        self.entries.map.clear();
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> { Ok(self.entries.keys()) }
}

struct BigEntry {
    metadata: BigKeyValueStoreMetadata,
    // zero-copy slices of the value.
    parts:    Vec<Bytes>,
}

/// An in-process [BigKeyValueStore].
pub struct MemoryBigKeyValueStore {
    name:      String,
    placement: Placement,
    part_size: PartSize,
    entries:   ExpiringMap<BigEntry>,
}

impl MemoryBigKeyValueStore {
    pub fn new(name: &str, placement: Placement, part_size: PartSize) -> Result<Self> {
        ensure!(
            part_size > 0,
            InvalidArgumentSnafu {
                reason: "part size must be positive",
            }
        );
        let ttl = placement.properties().expire_duration();
        Ok(Self {
            name: name.to_string(),
            placement,
            part_size,
            entries: ExpiringMap::new(ttl),
        })
    }

    fn build_entry(&self, key: &str, value: Bytes, extra: Option<Bytes>) -> Result<BigEntry> {
        let metadata =
            BigKeyValueStoreMetadata::for_value(key, value.len() as u64, self.part_size, extra)
                .context(MetadataSnafu)?;
        Ok(BigEntry {
            parts: split_parts(&value, self.part_size),
            metadata,
        })
    }
}

#[async_trait]
impl BigKeyValueStore for MemoryBigKeyValueStore {
    fn name(&self) -> &str { &self.name }

    fn placement(&self) -> &Placement { &self.placement }

    fn part_size(&self) -> PartSize { self.part_size }

    async fn get_metadata(&self, key: &str) -> Result<Option<BigKeyValueStoreMetadata>> {
        Ok(self.entries.with(key, |e| e.metadata.clone()))
    }

    async fn get_data_part(&self, key: &str, part_no: PartIndex) -> Result<Option<Bytes>> {
        self.entries
            .with(key, |e| {
                ensure!(
                    part_no < e.parts.len() as PartIndex,
                    InvalidArgumentSnafu {
                        reason: format!("{key} has {} parts, asked for {part_no}", e.parts.len()),
                    }
                );
                Ok(e.parts[part_no as usize].clone())
            })
            .transpose()
    }

    async fn get_data(&self, key: &str) -> Result<Option<Bytes>> {
        // one guard, so a concurrent put is seen whole or not at all.
        let Some((metadata, parts)) = self
            .entries
            .with(key, |e| (e.metadata.clone(), e.parts.clone()))
        else {
            return Ok(None);
        };
        assemble(key, &metadata, &parts, self.part_size).map(Some)
    }

    async fn put(
        &self,
        key: &str,
        value: Bytes,
        extra: Option<Bytes>,
    ) -> Result<BigKeyValueStoreMetadata> {
        let entry = self.build_entry(key, value, extra)?;
        let metadata = entry.metadata.clone();
        self.entries.insert(key, entry);
        debug!("{} stored {} in {} parts", self.name, key, metadata.part_num());
        Ok(metadata)
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Bytes,
        extra: Option<Bytes>,
    ) -> Result<Option<BigKeyValueStoreMetadata>> {
        let entry = self.build_entry(key, value, extra)?;
        Ok(self
            .entries
            .insert_if_absent(key, entry, |e| e.metadata.clone()))
    }

    async fn replace(
        &self,
        key: &str,
        old: &BigKeyValueStoreMetadata,
        new: BigKeyValueStoreMetadata,
    ) -> Result<bool> {
        check_replacement(key, old, &new)?;
        let swapped = self.entries.with_mut(key, |stored| {
            if stored.value.metadata != *old {
                return false;
            }
            stored.value.metadata = new;
            stored.stored_at = Instant::now();
            true
        });
        Ok(swapped.unwrap_or(false))
    }

    async fn remove(&self, key: &str) -> Result<Option<BigKeyValueStoreMetadata>> {
        Ok(self.entries.remove(key).map(|e| e.metadata))
    }

    async fn clear(&self) -> Result<()> {
        self.entries.map.clear();
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> { Ok(self.entries.keys()) }
}
