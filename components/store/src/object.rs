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


use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::try_join_all;
use kasumi_common::{PartIndex, PartSize};
use kasumi_types::{partition::make_part_key, BigKeyValueStoreMetadata};
use opendal::{services, ErrorKind, Operator};
use snafu::{ensure, ResultExt};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::{
    assemble, check_replacement,
    err::{CorruptedSnafu, InvalidArgumentSnafu, MetadataSnafu, OpenDalSnafu, Result},
    split_parts, BigKeyValueStore, Placement,
};

const META_DIR: &str = "meta/";
const DATA_DIR: &str = "data/";

/// A [BigKeyValueStore] on top of an OpenDAL operator.
///
/// Every value is written as `data/<key>:<part_no>` objects plus a
/// `meta/<key>` object holding the binary metadata. The metadata is written
/// last, a value without it does not exist. Mutations and value reads are
/// serialized by an async mutex so that `replace` and `put_if_absent` are
/// atomic and a read never mixes two values, within the process owning the
/// operator.
pub struct ObjectBigKeyValueStore {
    name:      String,
    placement: Placement,
    part_size: PartSize,
    operator:  Operator,
    lock:      Mutex<()>,
}

impl ObjectBigKeyValueStore {
    pub fn new(
        name: &str,
        placement: Placement,
        part_size: PartSize,
        operator: Operator,
    ) -> Result<Self> {
        ensure!(
            part_size > 0,
            InvalidArgumentSnafu {
                reason: "part size must be positive",
            }
        );
        if placement.properties().expirable {
            warn!("{} is backed by an object store and never expires entries", name);
        }
        Ok(Self {
            name: name.to_string(),
            placement,
            part_size,
            operator,
            lock: Mutex::new(()),
        })
    }

    /// A store living in process memory.
    pub fn memory(name: &str, placement: Placement, part_size: PartSize) -> Result<Self> {
        let mut builder = services::Memory::default();
        builder.root("/");
        let operator = Operator::new(builder).context(OpenDalSnafu)?.finish();
        Self::new(name, placement, part_size, operator)
    }

    /// A store persisted under a local directory.
    pub fn fs<P: AsRef<Path>>(
        name: &str,
        placement: Placement,
        part_size: PartSize,
        root: P,
    ) -> Result<Self> {
        let root = root.as_ref();
        let root = root.to_str().ok_or_else(|| {
            InvalidArgumentSnafu {
                reason: format!("{root:?} is not valid unicode"),
            }
            .build()
        })?;
        let mut builder = services::Fs::default();
        builder.root(root);
        let operator = Operator::new(builder).context(OpenDalSnafu)?.finish();
        Self::new(name, placement, part_size, operator)
    }

    fn check_key(key: &str) -> Result<()> {
        ensure!(
            !key.is_empty() && !key.contains('/'),
            InvalidArgumentSnafu {
                reason: format!("{key:?} can not be used as an object name"),
            }
        );
        Ok(())
    }

    fn meta_path(key: &str) -> String { format!("{META_DIR}{key}") }

    fn part_path(key: &str, part_no: PartIndex) -> String {
        format!("{DATA_DIR}{}", make_part_key(key, part_no))
    }

    async fn read_metadata(&self, key: &str) -> Result<Option<BigKeyValueStoreMetadata>> {
        Self::check_key(key)?;
        match self.operator.read(&Self::meta_path(key)).await {
            Ok(buf) => {
                let metadata = BigKeyValueStoreMetadata::decode(&buf).context(MetadataSnafu)?;
                ensure!(
                    metadata.key() == key,
                    CorruptedSnafu {
                        key,
                        reason: format!("metadata belongs to {}", metadata.key()),
                    }
                );
                Ok(Some(metadata))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context(OpenDalSnafu),
        }
    }

    /// Writes the parts, then the metadata. Caller holds the lock.
    async fn write_value(
        &self,
        key: &str,
        value: Bytes,
        extra: Option<Bytes>,
    ) -> Result<BigKeyValueStoreMetadata> {
        let metadata =
            BigKeyValueStoreMetadata::for_value(key, value.len() as u64, self.part_size, extra)
                .context(MetadataSnafu)?;
        for (part_no, part) in split_parts(&value, self.part_size).into_iter().enumerate() {
            self.operator
                .write(&Self::part_path(key, part_no as PartIndex), part)
                .await
                .context(OpenDalSnafu)?;
        }
        self.write_metadata(&metadata).await?;
        Ok(metadata)
    }

    async fn write_metadata(&self, metadata: &BigKeyValueStoreMetadata) -> Result<()> {
        let encoded = metadata.encode().context(MetadataSnafu)?;
        self.operator
            .write(&Self::meta_path(metadata.key()), encoded)
            .await
            .context(OpenDalSnafu)
    }

    /// Reads a part the metadata promises. Caller holds the lock.
    async fn read_part(&self, key: &str, part_no: PartIndex) -> Result<Bytes> {
        match self.operator.read(&Self::part_path(key, part_no)).await {
            Ok(buf) => Ok(Bytes::from(buf)),
            Err(e) if e.kind() == ErrorKind::NotFound => CorruptedSnafu {
                key,
                reason: format!("part {part_no} is missing"),
            }
            .fail(),
            Err(e) => Err(e).context(OpenDalSnafu),
        }
    }

    /// Deletes parts `[from, to)` of `key`.
    async fn delete_parts(&self, key: &str, from: u32, to: u32) -> Result<()> {
        for part_no in from..to {
            self.operator
                .delete(&Self::part_path(key, part_no as PartIndex))
                .await
                .context(OpenDalSnafu)?;
        }
        Ok(())
    }
}

#[async_trait]
impl BigKeyValueStore for ObjectBigKeyValueStore {
    fn name(&self) -> &str { &self.name }

    fn placement(&self) -> &Placement { &self.placement }

    fn part_size(&self) -> PartSize { self.part_size }

    async fn get_metadata(&self, key: &str) -> Result<Option<BigKeyValueStoreMetadata>> {
        self.read_metadata(key).await
    }

    async fn get_data_part(&self, key: &str, part_no: PartIndex) -> Result<Option<Bytes>> {
        let _guard = self.lock.lock().await;
        let Some(metadata) = self.read_metadata(key).await? else {
            return Ok(None);
        };
        ensure!(
            part_no < metadata.part_num() as PartIndex,
            InvalidArgumentSnafu {
                reason: format!("{key} has {} parts, asked for {part_no}", metadata.part_num()),
            }
        );
        self.read_part(key, part_no).await.map(Some)
    }

    #[instrument(level = "debug", skip(self))]
    async fn get_data(&self, key: &str) -> Result<Option<Bytes>> {
        // a put rewrites parts before the metadata, never read in between.
        let _guard = self.lock.lock().await;
        let Some(metadata) = self.read_metadata(key).await? else {
            return Ok(None);
        };
        let parts = try_join_all(
            (0..metadata.part_num() as PartIndex).map(|part_no| self.read_part(key, part_no)),
        )
        .await?;
        assemble(key, &metadata, &parts, self.part_size).map(Some)
    }

    #[instrument(level = "debug", skip(self, value, extra))]
    async fn put(
        &self,
        key: &str,
        value: Bytes,
        extra: Option<Bytes>,
    ) -> Result<BigKeyValueStoreMetadata> {
        Self::check_key(key)?;
        let _guard = self.lock.lock().await;
        let previous = self.read_metadata(key).await?;
        let metadata = self.write_value(key, value, extra).await?;
        if let Some(previous) = previous {
            // the new value may have fewer parts.
            self.delete_parts(key, metadata.part_num(), previous.part_num())
                .await?;
        }
        debug!("{} stored {} in {} parts", self.name, key, metadata.part_num());
        Ok(metadata)
    }

    #[instrument(level = "debug", skip(self, value, extra))]
    async fn put_if_absent(
        &self,
        key: &str,
        value: Bytes,
        extra: Option<Bytes>,
    ) -> Result<Option<BigKeyValueStoreMetadata>> {
        Self::check_key(key)?;
        let _guard = self.lock.lock().await;
        if let Some(current) = self.read_metadata(key).await? {
            return Ok(Some(current));
        }
        self.write_value(key, value, extra).await?;
        Ok(None)
    }

    #[instrument(level = "debug", skip(self, old, new))]
    async fn replace(
        &self,
        key: &str,
        old: &BigKeyValueStoreMetadata,
        new: BigKeyValueStoreMetadata,
    ) -> Result<bool> {
        check_replacement(key, old, &new)?;
        let _guard = self.lock.lock().await;
        if self.read_metadata(key).await?.as_ref() != Some(old) {
            return Ok(false);
        }
        self.write_metadata(&new).await?;
        Ok(true)
    }

    #[instrument(level = "debug", skip(self))]
    async fn remove(&self, key: &str) -> Result<Option<BigKeyValueStoreMetadata>> {
        let _guard = self.lock.lock().await;
        let Some(metadata) = self.read_metadata(key).await? else {
            return Ok(None);
        };
        self.operator
            .delete(&Self::meta_path(key))
            .await
            .context(OpenDalSnafu)?;
        self.delete_parts(key, 0, metadata.part_num()).await?;
        Ok(Some(metadata))
    }

    async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        for dir in [META_DIR, DATA_DIR] {
            match self.operator.remove_all(dir).await {
                Err(e) if e.kind() != ErrorKind::NotFound => {
                    return Err(e).context(OpenDalSnafu);
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let entries = match self.operator.list_with(META_DIR).recursive(true).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context(OpenDalSnafu),
        };
        Ok(entries
            .iter()
            .filter_map(|entry| entry.path().strip_prefix(META_DIR))
            .filter(|key| !key.is_empty() && !key.ends_with('/'))
            .map(str::to_string)
            .collect())
    }
}
