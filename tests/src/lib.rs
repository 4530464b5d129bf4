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


//! Scenarios spanning the whole data plane: a value arrives through a relay,
//! is cut into chunks described by a recipe, and the chunks land in a store.

use std::{io, time::Duration};

use bytes::Bytes;
use futures::{stream, stream::BoxStream, StreamExt};
use kasumi_common::NodeId;
use kasumi_types::{ObjectMetadata, Recipe, RecipeChunk};
use tokio_util::io::StreamReader;

pub type ScriptedSource = StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>;

/// A source handing out `data` in `piece` sized writes, `delay` apart.
pub fn scripted_source(data: Bytes, piece: usize, delay: Duration) -> ScriptedSource {
    let pieces: Vec<Bytes> = (0..data.len())
        .step_by(piece.max(1))
        .map(|start| data.slice(start..(start + piece.max(1)).min(data.len())))
        .collect();
    let s = stream::iter(pieces)
        .then(move |piece| async move {
            tokio::time::sleep(delay).await;
            Ok(piece)
        })
        .boxed();
    StreamReader::new(s)
}

/// Builds the recipe of `data` cut in `chunk_size` chunks, every chunk
/// served by every node. `digest` hashes one chunk.
pub fn build_recipe<F>(
    path: &str,
    data: &[u8],
    chunk_size: u64,
    nodes: &[&str],
    digest: F,
) -> kasumi_types::err::Result<Recipe>
where
    F: Fn(&[u8]) -> Vec<u8>,
{
    let metadata = ObjectMetadata {
        path:          path.to_string(),
        size:          data.len() as u64,
        last_modified: 0,
    };
    let mut recipe = Recipe::new(metadata, "SHA-256", chunk_size)?;
    for node in nodes {
        recipe.add_node_name(node)?;
    }
    for (i, bytes) in data.chunks(chunk_size as usize).enumerate() {
        let mut chunk = RecipeChunk::with_digest(i as u64 * chunk_size, bytes.len() as u64, &digest(bytes))?;
        chunk.add_node_id(kasumi_common::ALL_NODES)?;
        recipe.add_chunk(chunk)?;
    }
    Ok(recipe)
}

/// The node ids a recipe hands out, in registration order.
pub fn node_ids(recipe: &Recipe) -> Vec<NodeId> {
    recipe
        .node_names()
        .iter()
        .filter_map(|name| recipe.node_id(name))
        .collect()
}

#[cfg(test)]
mod tests {
    use kasumi_common::ALL_NODES;
    use kasumi_store::{
        BigKeyValueStore, KeyValueStore, MemoryBigKeyValueStore, MemoryKeyValueStore,
        ObjectBigKeyValueStore, Placement,
    };
    use kasumi_stream::{
        ChunkRead, ChunkSeek, ExternalFileConfig, ExternalFileWaitStream, ForwardSource,
        RelayConfig, RelayStream, SeekableWindow, UnrewindableWindow, Window,
    };
    use kasumi_types::{partition, DataStoreProperties};
    use kasumi_utils::logger::install_fmt_log;
    use rand::{Rng, RngCore};
    use sha2::{Digest, Sha256};
    use tokio::io::AsyncWriteExt;

    use super::*;

    const CHUNK: u64 = 64 << 10;
    const PART: u64 = 20 << 10;

    fn sha256(bytes: &[u8]) -> Vec<u8> { Sha256::digest(bytes).to_vec() }

    fn payload(len: usize) -> Bytes {
        let mut buf = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut buf);
        Bytes::from(buf)
    }

    fn relay_config() -> RelayConfig {
        RelayConfig::default().with_retry_interval(Duration::from_millis(50))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn relay_chunks_into_a_store() {
        install_fmt_log();
        let data = payload(300_000);
        let recipe = build_recipe("/data/a.bin", &data, CHUNK, &["n0", "n1"], sha256).unwrap();
        assert_eq!(recipe.len(), 5);
        assert_eq!(recipe.total_length(), 300_000);

        let source = scripted_source(data.clone(), 10_000, Duration::from_millis(1));
        let mut relay = RelayStream::disk(source, data.len() as u64, &relay_config()).unwrap();

        let placement = Placement::new(["n0", "n1"], DataStoreProperties::default()).unwrap();
        let store = MemoryBigKeyValueStore::new("chunks", placement, PART).unwrap();

        // chunks in reverse, the relay is seekable.
        for chunk in recipe.chunks().iter().rev() {
            let mut window = SeekableWindow::new(&mut relay, Window::for_chunk(chunk)).unwrap();
            let mut buf = vec![0u8; chunk.length() as usize];
            assert_eq!(window.read_full(&mut buf).await.unwrap(), buf.len());
            assert_eq!(chunk.hash(), hex::encode(sha256(&buf)));

            let metadata = store.put(chunk.hash(), Bytes::from(buf), None).await.unwrap();
            assert_eq!(
                metadata.part_num() as u64,
                partition::part_count(chunk.length(), PART)
            );
        }

        // every stored part matches the same part cut from the relay.
        for chunk in recipe.chunks() {
            for part in partition::parts(chunk.length(), PART) {
                let window = Window::part(chunk.offset(), chunk.length(), PART, part.part_no).unwrap();
                assert_eq!(window.start(), chunk.offset() + part.start);
                let mut window = SeekableWindow::new(&mut relay, window).unwrap();
                let mut buf = vec![0u8; part.len as usize];
                window.read_full(&mut buf).await.unwrap();
                let stored = store
                    .get_data_part(chunk.hash(), part.part_no)
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(&stored[..], &buf[..]);
            }
        }

        let temp = relay.temp_path().unwrap().to_path_buf();
        relay.close().await.unwrap();
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn recipe_survives_a_round_trip_through_a_store() {
        install_fmt_log();
        let data = payload(200_000);
        let mut recipe = build_recipe("/data/b.bin", &data, CHUNK, &["n0", "n1", "n2"], sha256).unwrap();
        let n1 = recipe.node_id("n1").unwrap();
        let mut pinned = recipe.chunks()[1].clone();
        pinned.clear_node_ids();
        pinned.add_node_id(n1).unwrap();
        recipe.remove_chunk(pinned.hash()).unwrap();
        recipe.add_chunk(pinned.clone()).unwrap();
        assert_eq!(node_ids(&recipe).len(), 3);

        let placement = Placement::new(
            ["n0", "n1", "n2"],
            DataStoreProperties::default().with_sharded(true).with_num_replicas(1),
        )
        .unwrap();
        let recipes: MemoryKeyValueStore<String> = MemoryKeyValueStore::new("recipes", placement);
        let key = recipe.metadata().path.clone();
        let json = recipe.to_json().unwrap();
        assert_eq!(recipes.put_if_absent(&key, json.clone()).await.unwrap(), None);
        assert_eq!(recipes.primary_and_backup_nodes(&key).len(), 2);

        let loaded = Recipe::from_json(&recipes.get(&key).await.unwrap().unwrap()).unwrap();
        assert_eq!(loaded.chunks(), recipe.chunks());
        assert_eq!(loaded.chunk_node_names(&loaded.chunks()[1]), vec!["n1"]);
        assert_eq!(loaded.chunk_node_names(&loaded.chunks()[0]), vec!["n0", "n1", "n2"]);

        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let offset = rng.gen_range(0..data.len() as u64);
            let chunk = loaded.chunk_by_offset(offset).unwrap();
            assert!(chunk.contains_offset(offset));
            assert_eq!(loaded.chunk_by_hash(chunk.hash()), Some(chunk));
        }
        assert!(loaded.chunk_by_offset(data.len() as u64).is_none());

        // publish a new version only if nobody else did.
        let mut updated = loaded.clone();
        updated.add_node_name("n3").unwrap();
        let new_json = updated.to_json().unwrap();
        assert!(recipes.replace(&key, &json, new_json.clone()).await.unwrap());
        assert!(!recipes.replace(&key, &json, new_json).await.unwrap());
    }

    #[tokio::test]
    async fn forward_only_source_feeds_chunk_windows() {
        let data = payload(150_000);
        let recipe = build_recipe("/data/c.bin", &data, CHUNK, &["n0"], sha256).unwrap();

        let pieces: Vec<io::Result<Bytes>> = (0..data.len())
            .step_by(7_000)
            .map(|s| Ok(data.slice(s..(s + 7_000).min(data.len()))))
            .collect();
        let reader = StreamReader::new(tokio_stream::iter(pieces));
        let mut source = ForwardSource::new(reader, data.len() as u64);

        // only every other chunk is wanted, the rest is skipped.
        for chunk in recipe.chunks().iter().step_by(2) {
            let mut window = UnrewindableWindow::new(&mut source, Window::for_chunk(chunk)).unwrap();
            let mut buf = vec![0u8; chunk.length() as usize];
            window.read_full(&mut buf).await.unwrap();
            assert_eq!(hex::encode(sha256(&buf)), chunk.hash());
            assert!(window.seek(0).await.unwrap_err().is_unsupported());
        }
    }

    #[tokio::test]
    async fn externally_written_chunk_reaches_an_object_store() {
        install_fmt_log();
        let data = payload(100_000);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("incoming");

        let writer_path = path.clone();
        let writer_data = data.clone();
        let writer = tokio::spawn(async move {
            let mut file = tokio::fs::File::create(&writer_path).await.unwrap();
            for piece in writer_data.chunks(8_192) {
                file.write_all(piece).await.unwrap();
                file.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });

        let config = ExternalFileConfig {
            poll_interval: Duration::from_millis(5),
            wait_timeout:  Duration::from_secs(30),
        };
        // the chunk is [10_000, 90_000) of the growing file.
        let mut stream = ExternalFileWaitStream::open(&path, 10_000, 80_000, &config).unwrap();
        let mut chunk = vec![0u8; 80_000];
        assert_eq!(stream.read_full(&mut chunk).await.unwrap(), 80_000);
        assert_eq!(&chunk[..], &data[10_000..90_000]);
        writer.await.unwrap();

        let store_dir = tempfile::tempdir().unwrap();
        let placement = Placement::local("n0", DataStoreProperties::default().with_persistent(true)).unwrap();
        let store = ObjectBigKeyValueStore::fs("objects", placement, PART, store_dir.path()).unwrap();
        let key = hex::encode(sha256(&chunk));
        store.put(&key, Bytes::from(chunk.clone()), None).await.unwrap();

        // a second writer of the same chunk loses the race politely.
        let existing = store.put_if_absent(&key, Bytes::from(chunk.clone()), None).await.unwrap();
        assert_eq!(existing.unwrap().entry_size(), 80_000);
        assert_eq!(store.get_data(&key).await.unwrap().unwrap(), Bytes::from(chunk));
        assert_eq!(store.keys().await.unwrap(), vec![key]);
    }

    #[tokio::test]
    async fn all_nodes_sentinel_expands() {
        let data = payload(1000);
        let recipe = build_recipe("/data/d.bin", &data, 512, &["x", "y"], sha256).unwrap();
        let chunk = &recipe.chunks()[0];
        assert!(chunk.has_node_id(ALL_NODES));
        assert_eq!(recipe.node_names_for(chunk.node_ids()), vec!["x", "y"]);
    }
}
