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

//! Byte streams over chunk data that may still be arriving.
//!
//! ## Key Components
//! 1. [RelayStream]: copies an upstream source into memory or a temporary
//!    file on a background task, readers block until the bytes they ask for
//!    have been copied.
//! 2. [SeekableWindow] / [UnrewindableWindow]: present one chunk, or one part
//!    of a chunk, of a larger stream as an independent stream.
//! 3. [ExternalFileWaitStream]: reads a file grown by someone else, polling
//!    its length.
//! 4. [SeekableSource] / [ForwardSource]: plain caller-supplied sources.

pub mod config;
pub mod err;
mod external;
mod relay;
mod source;
mod window;

#[cfg(test)]
pub(crate) mod test_util;

use async_trait::async_trait;

pub use config::{ExternalFileConfig, RelayConfig};
pub use external::ExternalFileWaitStream;
pub use relay::{RelayProgress, RelayStream};
pub use source::{ForwardSource, SeekableSource};
pub use window::{SeekableWindow, UnrewindableWindow, Window};

use crate::err::{Result, UnsupportedSnafu};

/// A forward readable stream of a known length.
///
/// None of the streams support mark/reset.
#[async_trait]
pub trait ChunkRead: Send {
    /// A short name used in errors and logs.
    fn kind(&self) -> &'static str;

    /// The declared length of the stream.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool { self.len() == 0 }

    /// The current read offset.
    fn position(&self) -> u64;

    fn remaining(&self) -> u64 { self.len().saturating_sub(self.position()) }

    /// Reads up to `buf.len()` bytes, 0 means the end of the stream.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    async fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        let n = self.read(&mut byte).await?;
        Ok((n == 1).then_some(byte[0]))
    }

    /// Reads until `buf` is full or the stream ends.
    async fn read_full(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            let n = self.read(&mut buf[total..]).await?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    /// Skips up to `n` bytes, returns how many were actually skipped.
    async fn skip(&mut self, n: u64) -> Result<u64>;

    /// How many bytes can be read right now without waiting.
    async fn available(&mut self) -> Result<u64>;

    /// Releases the stream, closing twice is a no-op.
    async fn close(&mut self) -> Result<()>;

    fn mark_supported(&self) -> bool { false }

    fn mark(&mut self) -> Result<()> {
        UnsupportedSnafu {
            operation: "mark",
            stream:    self.kind(),
        }
        .fail()
    }

    fn reset(&mut self) -> Result<()> {
        UnsupportedSnafu {
            operation: "reset",
            stream:    self.kind(),
        }
        .fail()
    }
}

/// A stream that can be repositioned.
#[async_trait]
pub trait ChunkSeek: ChunkRead {
    /// Moves the read offset, clamped to `[0, len]`. Returns the new offset.
    async fn seek(&mut self, offset: u64) -> Result<u64>;
}

#[async_trait]
impl<S: ChunkRead + ?Sized> ChunkRead for &mut S {
    fn kind(&self) -> &'static str { (**self).kind() }

    fn len(&self) -> u64 { (**self).len() }

    fn position(&self) -> u64 { (**self).position() }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> { (**self).read(buf).await }

    async fn skip(&mut self, n: u64) -> Result<u64> { (**self).skip(n).await }

    async fn available(&mut self) -> Result<u64> { (**self).available().await }

    async fn close(&mut self) -> Result<()> { (**self).close().await }
}

#[async_trait]
impl<S: ChunkSeek + ?Sized> ChunkSeek for &mut S {
    async fn seek(&mut self, offset: u64) -> Result<u64> { (**self).seek(offset).await }
}
