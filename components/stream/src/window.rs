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


//! Windows present one chunk, or one part of a chunk, of a larger stream as
//! a stream of its own starting at offset 0.

use std::cmp::min;

use async_trait::async_trait;
use kasumi_common::{ChunkSize, FileOffset, PartIndex, PartSize};
use kasumi_types::{partition, RecipeChunk};
use snafu::ensure;
use tracing::debug;

use crate::{
    err::{InvalidArgumentSnafu, Result, StreamClosedSnafu, UnsupportedSnafu},
    ChunkRead, ChunkSeek,
};

/// The absolute byte range a window exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    chunk_start: FileOffset,
    chunk_len:   ChunkSize,
    part:        Option<(PartSize, PartIndex)>,
}

impl Window {
    /// The whole chunk `[chunk_start, chunk_start + chunk_len)`.
    pub fn chunk(chunk_start: FileOffset, chunk_len: ChunkSize) -> Self {
        Self {
            chunk_start,
            chunk_len,
            part: None,
        }
    }

    pub fn for_chunk(chunk: &RecipeChunk) -> Self { Self::chunk(chunk.offset(), chunk.length()) }

    /// Part `part_no` of the chunk when it is split in `part_size` parts.
    pub fn part(
        chunk_start: FileOffset,
        chunk_len: ChunkSize,
        part_size: PartSize,
        part_no: PartIndex,
    ) -> Result<Self> {
        ensure!(
            part_size > 0,
            InvalidArgumentSnafu {
                reason: "part size must be positive",
            }
        );
        let count = partition::part_count(chunk_len, part_size);
        ensure!(
            part_no < count.max(1),
            InvalidArgumentSnafu {
                reason: format!("part {part_no} of a {chunk_len} byte chunk split in {count} parts"),
            }
        );
        Ok(Self {
            chunk_start,
            chunk_len,
            part: Some((part_size, part_no)),
        })
    }

    pub fn chunk_start(&self) -> FileOffset { self.chunk_start }

    pub fn chunk_len(&self) -> ChunkSize { self.chunk_len }

    pub fn part_no(&self) -> Option<PartIndex> { self.part.map(|(_, no)| no) }

    pub fn part_start_in_chunk(&self) -> u64 {
        self.part
            .map_or(0, |(size, no)| partition::part_start_offset(size, no))
    }

    /// The absolute offset of the first byte.
    pub fn start(&self) -> FileOffset { self.chunk_start + self.part_start_in_chunk() }

    pub fn len(&self) -> u64 {
        match self.part {
            Some((size, no)) => partition::actual_part_size(self.chunk_len, size, no),
            None => self.chunk_len,
        }
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn end(&self) -> FileOffset { self.start() + self.len() }

    /// Whether the absolute file offset falls inside this window.
    pub fn contains_offset(&self, offset: FileOffset) -> bool {
        offset >= self.start() && offset < self.end()
    }
}

/// A window over a stream that can seek in both directions.
pub struct SeekableWindow<S> {
    inner:  S,
    window: Window,
    offset: u64,
}

impl<S: ChunkSeek> SeekableWindow<S> {
    pub fn new(inner: S, window: Window) -> Result<Self> {
        ensure!(
            window.end() <= inner.len(),
            InvalidArgumentSnafu {
                reason: format!(
                    "window [{}, {}) is beyond the {} byte {}",
                    window.start(),
                    window.end(),
                    inner.len(),
                    inner.kind()
                ),
            }
        );
        Ok(Self {
            inner,
            window,
            offset: 0,
        })
    }

    pub fn window(&self) -> &Window { &self.window }

    pub fn contains_offset(&self, offset: FileOffset) -> bool { self.window.contains_offset(offset) }

    pub fn get_ref(&self) -> &S { &self.inner }

    pub fn into_inner(self) -> S { self.inner }

    fn absolute(&self) -> u64 { self.window.start() + self.offset }
}

#[async_trait]
impl<S: ChunkSeek> ChunkRead for SeekableWindow<S> {
    fn kind(&self) -> &'static str { "seekable window" }

    fn len(&self) -> u64 { self.window.len() }

    fn position(&self) -> u64 { self.offset }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = min(buf.len() as u64, self.remaining()) as usize;
        if n == 0 {
            return Ok(0);
        }
        let absolute = self.absolute();
        if self.inner.position() != absolute {
            self.inner.seek(absolute).await?;
        }
        let got = self.inner.read(&mut buf[..n]).await?;
        self.offset += got as u64;
        Ok(got)
    }

    async fn skip(&mut self, n: u64) -> Result<u64> {
        let from = self.offset;
        let to = self.seek(from.saturating_add(n)).await?;
        Ok(to - from)
    }

    async fn available(&mut self) -> Result<u64> {
        if self.inner.position() != self.absolute() {
            return Ok(0);
        }
        Ok(min(self.inner.available().await?, self.remaining()))
    }

    async fn close(&mut self) -> Result<()> { self.inner.close().await }
}

#[async_trait]
impl<S: ChunkSeek> ChunkSeek for SeekableWindow<S> {
    async fn seek(&mut self, offset: u64) -> Result<u64> {
        let offset = min(offset, self.window.len());
        self.inner.seek(self.window.start() + offset).await?;
        self.offset = offset;
        Ok(offset)
    }
}

/// A window over a forward-only stream. Seeking forward skips the inner
/// stream, seeking backward fails.
pub struct UnrewindableWindow<S> {
    inner:  S,
    window: Window,
    offset: u64,
}

impl<S: ChunkRead> UnrewindableWindow<S> {
    /// `inner` must not have gone past the window start yet.
    pub fn new(inner: S, window: Window) -> Result<Self> {
        ensure!(
            inner.position() <= window.start(),
            InvalidArgumentSnafu {
                reason: format!(
                    "{} is already at {}, past the window start {}",
                    inner.kind(),
                    inner.position(),
                    window.start()
                ),
            }
        );
        ensure!(
            window.end() <= inner.len(),
            InvalidArgumentSnafu {
                reason: format!(
                    "window [{}, {}) is beyond the {} byte {}",
                    window.start(),
                    window.end(),
                    inner.len(),
                    inner.kind()
                ),
            }
        );
        Ok(Self {
            inner,
            window,
            offset: 0,
        })
    }

    pub fn window(&self) -> &Window { &self.window }

    pub fn contains_offset(&self, offset: FileOffset) -> bool { self.window.contains_offset(offset) }

    pub fn get_ref(&self) -> &S { &self.inner }

    pub fn into_inner(self) -> S { self.inner }

    /// Skips the inner stream up to `offset` within the window.
    async fn catch_up(&mut self, offset: u64) -> Result<()> {
        let target = self.window.start() + offset;
        let position = self.inner.position();
        ensure!(
            position <= target,
            UnsupportedSnafu {
                operation: "backward seek",
                stream:    "unrewindable window",
            }
        );
        if position < target {
            let skipped = self.inner.skip(target - position).await?;
            ensure!(
                skipped == target - position,
                StreamClosedSnafu {
                    requested: target,
                    written:   position + skipped,
                }
            );
        }
        Ok(())
    }
}

#[async_trait]
impl<S: ChunkRead> ChunkRead for UnrewindableWindow<S> {
    fn kind(&self) -> &'static str { "unrewindable window" }

    fn len(&self) -> u64 { self.window.len() }

    fn position(&self) -> u64 { self.offset }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = min(buf.len() as u64, self.remaining()) as usize;
        if n == 0 {
            return Ok(0);
        }
        self.catch_up(self.offset).await?;
        let got = self.inner.read(&mut buf[..n]).await?;
        self.offset += got as u64;
        Ok(got)
    }

    async fn skip(&mut self, n: u64) -> Result<u64> {
        let from = self.offset;
        let to = self.seek(from.saturating_add(n)).await?;
        Ok(to - from)
    }

    async fn available(&mut self) -> Result<u64> {
        if self.inner.position() != self.window.start() + self.offset {
            return Ok(0);
        }
        Ok(min(self.inner.available().await?, self.remaining()))
    }

    async fn close(&mut self) -> Result<()> { self.inner.close().await }
}

#[async_trait]
impl<S: ChunkRead> ChunkSeek for UnrewindableWindow<S> {
    async fn seek(&mut self, offset: u64) -> Result<u64> {
        let offset = min(offset, self.window.len());
        if offset < self.offset {
            debug!(
                "backward seek from {} to {} on an unrewindable window",
                self.offset, offset
            );
            return UnsupportedSnafu {
                operation: "backward seek",
                stream:    "unrewindable window",
            }
            .fail();
        }
        // the cursor only moves once the inner stream got there.
        self.catch_up(offset).await?;
        self.offset = offset;
        Ok(offset)
    }
}
