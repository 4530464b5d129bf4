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

//! The chunk table of one data object.
//!
//! A [Recipe] lists the chunks of an object ordered by offset, together with
//! the nodes able to serve each chunk. Chunks can be found by content hash
//! in O(1) and by byte offset in O(1) when chunk sizes are uniform, falling
//! back to a binary search otherwise.

use std::{
    collections::{BTreeSet, HashMap},
    fmt::{Display, Formatter},
};

use kasumi_common::{FileOffset, NodeId, ALL_NODES};
use serde::{Deserialize, Deserializer, Serialize};
use snafu::{ensure, ResultExt};

use crate::err::{InvalidArgumentSnafu, InvalidHashSnafu, JsonSnafu, Result};

fn validate_node_id(id: NodeId) -> Result<()> {
    ensure!(
        id >= 0 || id == ALL_NODES,
        InvalidArgumentSnafu {
            reason: format!("invalid node id {id}"),
        }
    );
    Ok(())
}

fn normalize_hash(hash: &str) -> Result<String> {
    ensure!(
        !hash.is_empty(),
        InvalidArgumentSnafu {
            reason: "chunk hash must not be empty",
        }
    );
    Ok(hash.to_ascii_lowercase())
}

fn deserialize_hash<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<String, D::Error> {
    let hash = String::deserialize(deserializer)?;
    normalize_hash(&hash).map_err(serde::de::Error::custom)
}

/// One entry of the chunk table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeChunk {
    offset:   FileOffset,
    length:   u64,
    /// Always lower case.
    #[serde(deserialize_with = "deserialize_hash")]
    hash:     String,
    node_ids: BTreeSet<NodeId>,
}

impl RecipeChunk {
    pub fn new<I>(offset: FileOffset, length: u64, hash: &str, node_ids: I) -> Result<Self>
    where
        I: IntoIterator<Item = NodeId>,
    {
        let mut chunk = Self {
            offset,
            length,
            hash: normalize_hash(hash)?,
            node_ids: BTreeSet::new(),
        };
        chunk.add_node_ids(node_ids)?;
        Ok(chunk)
    }

    /// Builds a chunk from a raw content digest.
    pub fn with_digest(offset: FileOffset, length: u64, digest: &[u8]) -> Result<Self> {
        Self::new(offset, length, &hex::encode(digest), [])
    }

    pub fn offset(&self) -> FileOffset { self.offset }

    pub fn set_offset(&mut self, offset: FileOffset) { self.offset = offset; }

    pub fn length(&self) -> u64 { self.length }

    pub fn set_length(&mut self, length: u64) { self.length = length; }

    /// The first offset past this chunk.
    pub fn end_offset(&self) -> FileOffset { self.offset + self.length }

    pub fn contains_offset(&self, offset: FileOffset) -> bool {
        offset >= self.offset && offset < self.end_offset()
    }

    pub fn hash(&self) -> &str { &self.hash }

    pub fn set_hash(&mut self, hash: &str) -> Result<()> {
        self.hash = normalize_hash(hash)?;
        Ok(())
    }

    pub fn set_hash_bytes(&mut self, digest: &[u8]) -> Result<()> {
        self.set_hash(&hex::encode(digest))
    }

    /// Decodes the hex hash back into the raw digest.
    pub fn hash_bytes(&self) -> Result<Vec<u8>> {
        hex::decode(&self.hash).context(InvalidHashSnafu { hash: &self.hash })
    }

    /// Exact, case-sensitive comparison against the normalized hash.
    pub fn has_hash(&self, hash: &str) -> bool { self.hash == hash }

    pub fn node_ids(&self) -> &BTreeSet<NodeId> { &self.node_ids }

    pub fn add_node_id(&mut self, id: NodeId) -> Result<bool> {
        validate_node_id(id)?;
        Ok(self.node_ids.insert(id))
    }

    pub fn add_node_ids<I: IntoIterator<Item = NodeId>>(&mut self, ids: I) -> Result<()> {
        for id in ids {
            self.add_node_id(id)?;
        }
        Ok(())
    }

    pub fn remove_node_id(&mut self, id: NodeId) -> bool { self.node_ids.remove(&id) }

    pub fn clear_node_ids(&mut self) { self.node_ids.clear(); }

    /// Whether `id` can serve this chunk, either listed explicitly or through
    /// the ALL_NODES sentinel.
    pub fn has_node_id(&self, id: NodeId) -> bool {
        self.node_ids.contains(&id) || self.node_ids.contains(&ALL_NODES)
    }
}

impl Display for RecipeChunk {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RecipeChunk {{ offset: {}, length: {}, hash: {}, nodes: {:?} }}",
            self.offset, self.length, self.hash, self.node_ids
        )
    }
}

/// Describes the data object a recipe was built for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub path:          String,
    pub size:          u64,
    /// Milliseconds since the unix epoch.
    pub last_modified: u64,
}

/// The persisted form of a [Recipe].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecipeRecord {
    metadata:       ObjectMetadata,
    hash_algorithm: String,
    chunk_size:     u64,
    #[serde(default)]
    node_names:     Vec<String>,
    #[serde(default)]
    chunks:         Vec<RecipeChunk>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RecipeRecord", into = "RecipeRecord")]
pub struct Recipe {
    metadata:       ObjectMetadata,
    hash_algorithm: String,
    /// Nominal chunk size, the last chunk may be shorter.
    chunk_size:     u64,
    node_names:     Vec<String>,
    /// Sorted by offset.
    chunks:         Vec<RecipeChunk>,
    /// hash -> index into `chunks`, rebuilt whenever `chunks` changes.
    hash_index:     HashMap<String, usize>,
}

impl Recipe {
    pub fn new(metadata: ObjectMetadata, hash_algorithm: &str, chunk_size: u64) -> Result<Self> {
        ensure!(
            !hash_algorithm.is_empty(),
            InvalidArgumentSnafu {
                reason: "hash algorithm must not be empty",
            }
        );
        ensure!(
            chunk_size > 0,
            InvalidArgumentSnafu {
                reason: "chunk size must be positive",
            }
        );
        Ok(Self {
            metadata,
            hash_algorithm: hash_algorithm.to_string(),
            chunk_size,
            node_names: Vec::new(),
            chunks: Vec::new(),
            hash_index: HashMap::new(),
        })
    }

    pub fn metadata(&self) -> &ObjectMetadata { &self.metadata }

    pub fn hash_algorithm(&self) -> &str { &self.hash_algorithm }

    pub fn chunk_size(&self) -> u64 { self.chunk_size }

    pub fn chunks(&self) -> &[RecipeChunk] { &self.chunks }

    pub fn len(&self) -> usize { self.chunks.len() }

    pub fn is_empty(&self) -> bool { self.chunks.is_empty() }

    /// The end offset of the last chunk.
    pub fn total_length(&self) -> u64 { self.chunks.last().map_or(0, RecipeChunk::end_offset) }

    /// Inserts a chunk keeping the table sorted by offset.
    pub fn add_chunk(&mut self, chunk: RecipeChunk) -> Result<()> {
        for id in chunk.node_ids() {
            self.check_node_id(*id)?;
        }
        let idx = self.chunks.partition_point(|c| c.offset <= chunk.offset);
        self.chunks.insert(idx, chunk);
        self.rebuild_hash_index();
        Ok(())
    }

    pub fn add_chunks<I: IntoIterator<Item = RecipeChunk>>(&mut self, chunks: I) -> Result<()> {
        for chunk in chunks {
            self.add_chunk(chunk)?;
        }
        Ok(())
    }

    /// Removes the chunk holding `hash`, if any.
    pub fn remove_chunk(&mut self, hash: &str) -> Option<RecipeChunk> {
        let idx = *self.hash_index.get(hash)?;
        let chunk = self.chunks.remove(idx);
        self.rebuild_hash_index();
        Some(chunk)
    }

    pub fn clear_chunks(&mut self) {
        self.chunks.clear();
        self.hash_index.clear();
    }

    pub fn chunk_by_hash(&self, hash: &str) -> Option<&RecipeChunk> {
        self.hash_index.get(hash).map(|idx| &self.chunks[*idx])
    }

    pub fn has_hash(&self, hash: &str) -> bool { self.hash_index.contains_key(hash) }

    /// Finds the chunk with `offset <= chunk.offset < offset + length`.
    pub fn chunk_by_offset(&self, offset: FileOffset) -> Option<&RecipeChunk> {
        // Fast path, only right while every chunk before `offset` has the
        // nominal size.
        let guess = offset / self.chunk_size;
        if let Some(chunk) = usize::try_from(guess).ok().and_then(|i| self.chunks.get(i)) {
            if chunk.contains_offset(offset) {
                return Some(chunk);
            }
        }

        let idx = self.chunks.partition_point(|c| c.offset <= offset);
        let chunk = self.chunks.get(idx.checked_sub(1)?)?;
        chunk.contains_offset(offset).then_some(chunk)
    }

    /// Registers a node and returns its id, an already known node keeps its id.
    pub fn add_node_name(&mut self, name: &str) -> Result<NodeId> {
        ensure!(
            !name.is_empty(),
            InvalidArgumentSnafu {
                reason: "node name must not be empty",
            }
        );
        if let Some(id) = self.node_id(name) {
            return Ok(id);
        }
        let id = NodeId::try_from(self.node_names.len()).ok().filter(|id| *id != ALL_NODES);
        let id = id.ok_or_else(|| {
            InvalidArgumentSnafu {
                reason: "too many nodes",
            }
            .build()
        })?;
        self.node_names.push(name.to_string());
        Ok(id)
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.node_names
            .iter()
            .position(|n| n == name)
            .and_then(|idx| NodeId::try_from(idx).ok())
    }

    pub fn node_name(&self, id: NodeId) -> Option<&str> {
        usize::try_from(id)
            .ok()
            .and_then(|idx| self.node_names.get(idx))
            .map(String::as_str)
    }

    pub fn node_names(&self) -> &[String] { &self.node_names }

    /// Resolves node ids to names, ALL_NODES expands to every known node.
    /// Unknown ids are skipped.
    pub fn node_names_for<'a, I>(&self, ids: I) -> Vec<&str>
    where
        I: IntoIterator<Item = &'a NodeId>,
    {
        let ids = ids.into_iter().copied().collect::<BTreeSet<_>>();
        if ids.contains(&ALL_NODES) {
            return self.node_names.iter().map(String::as_str).collect();
        }
        ids.into_iter().filter_map(|id| self.node_name(id)).collect()
    }

    /// The nodes able to serve `chunk`.
    pub fn chunk_node_names(&self, chunk: &RecipeChunk) -> Vec<&str> {
        self.node_names_for(chunk.node_ids())
    }

    pub fn to_json(&self) -> Result<String> { serde_json::to_string(self).context(JsonSnafu) }

    pub fn from_json(json: &str) -> Result<Self> { serde_json::from_str(json).context(JsonSnafu) }

    fn check_node_id(&self, id: NodeId) -> Result<()> {
        ensure!(
            id == ALL_NODES || self.node_name(id).is_some(),
            InvalidArgumentSnafu {
                reason: format!("node id {id} is not registered in the recipe"),
            }
        );
        Ok(())
    }

    fn rebuild_hash_index(&mut self) {
        self.hash_index.clear();
        for (idx, chunk) in self.chunks.iter().enumerate() {
            // duplicated content resolves to its first occurrence.
            self.hash_index.entry(chunk.hash.clone()).or_insert(idx);
        }
    }
}

impl TryFrom<RecipeRecord> for Recipe {
    type Error = crate::err::Error;

    fn try_from(record: RecipeRecord) -> Result<Self> {
        let mut recipe = Recipe::new(record.metadata, &record.hash_algorithm, record.chunk_size)?;
        for name in &record.node_names {
            recipe.add_node_name(name)?;
        }
        ensure!(
            recipe.node_names.len() == record.node_names.len(),
            InvalidArgumentSnafu {
                reason: "duplicated node names",
            }
        );
        recipe.add_chunks(record.chunks)?;
        Ok(recipe)
    }
}

impl From<Recipe> for RecipeRecord {
    fn from(recipe: Recipe) -> Self {
        Self {
            metadata:       recipe.metadata,
            hash_algorithm: recipe.hash_algorithm,
            chunk_size:     recipe.chunk_size,
            node_names:     recipe.node_names,
            chunks:         recipe.chunks,
        }
    }
}
