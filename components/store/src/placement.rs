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


//! Which nodes hold a key.

use std::collections::HashSet;

use kasumi_types::DataStoreProperties;
use snafu::ensure;

use crate::err::{InvalidArgumentSnafu, Result};

/// The node list of a store and the rule mapping keys onto it.
///
/// A store that is not sharded keeps every key on its first node, the local
/// one. A sharded store picks the primary by a stable hash of the key. Either
/// way the backups are the next `num_replicas` nodes in ring order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    nodes:      Vec<String>,
    properties: DataStoreProperties,
}

impl Placement {
    pub fn new<I, S>(nodes: I, properties: DataStoreProperties) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let nodes: Vec<String> = nodes.into_iter().map(Into::into).collect();
        ensure!(
            !nodes.is_empty(),
            InvalidArgumentSnafu {
                reason: "a store needs at least one node",
            }
        );
        let mut seen = HashSet::with_capacity(nodes.len());
        for node in &nodes {
            ensure!(
                !node.is_empty() && seen.insert(node.as_str()),
                InvalidArgumentSnafu {
                    reason: format!("node names must be non-empty and unique, got {node:?}"),
                }
            );
        }
        Ok(Self { nodes, properties })
    }

    /// A single node store.
    pub fn local(node: &str, properties: DataStoreProperties) -> Result<Self> {
        Self::new([node], properties)
    }

    pub fn nodes(&self) -> &[String] { &self.nodes }

    pub fn properties(&self) -> &DataStoreProperties { &self.properties }

    fn primary_index(&self, key: &str) -> usize {
        if !self.properties.sharded {
            return 0;
        }
        crc32fast::hash(key.as_bytes()) as usize % self.nodes.len()
    }

    pub fn primary_node(&self, key: &str) -> &str { &self.nodes[self.primary_index(key)] }

    pub fn backup_nodes(&self, key: &str) -> Vec<&str> {
        let primary = self.primary_index(key);
        let n = self.nodes.len();
        let replicas = (self.properties.num_replicas as usize).min(n - 1);
        (1..=replicas)
            .map(|i| self.nodes[(primary + i) % n].as_str())
            .collect()
    }

    pub fn primary_and_backup_nodes(&self, key: &str) -> Vec<&str> {
        let mut nodes = Vec::with_capacity(1 + self.properties.num_replicas as usize);
        nodes.push(self.primary_node(key));
        nodes.extend(self.backup_nodes(key));
        nodes
    }
}
