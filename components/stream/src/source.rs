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


use std::{cmp::min, io::SeekFrom, path::Path};

use async_trait::async_trait;
use kasumi_common::SKIP_BUFFER_SIZE;
use snafu::{ensure, OptionExt, ResultExt};
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt},
};

use crate::{
    err::{ClosedSnafu, Result, StreamClosedSnafu, UnknownIOSnafu},
    ChunkRead, ChunkSeek,
};

/// A caller-supplied source that can seek, such as a local file.
///
/// The reader is expected to sit at its start.
pub struct SeekableSource<R> {
    inner: Option<R>,
    len:   u64,
    pos:   u64,
}

impl<R> SeekableSource<R>
where
    R: AsyncRead + AsyncSeek + Send + Unpin,
{
    pub fn new(reader: R, len: u64) -> Self {
        Self {
            inner: Some(reader),
            len,
            pos: 0,
        }
    }

    fn reader(&mut self) -> Result<&mut R> {
        self.inner.as_mut().context(ClosedSnafu {
            stream: "seekable source",
        })
    }
}

impl SeekableSource<File> {
    /// Opens a local file, the whole file is the stream.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path).await.context(UnknownIOSnafu)?;
        let len = file.metadata().await.context(UnknownIOSnafu)?.len();
        Ok(Self::new(file, len))
    }
}

#[async_trait]
impl<R> ChunkRead for SeekableSource<R>
where
    R: AsyncRead + AsyncSeek + Send + Unpin,
{
    fn kind(&self) -> &'static str { "seekable source" }

    fn len(&self) -> u64 { self.len }

    fn position(&self) -> u64 { self.pos }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = min(buf.len() as u64, self.remaining()) as usize;
        let reader = self.reader()?;
        if n == 0 {
            return Ok(0);
        }
        let got = reader.read(&mut buf[..n]).await.context(UnknownIOSnafu)?;
        self.pos += got as u64;
        Ok(got)
    }

    async fn skip(&mut self, n: u64) -> Result<u64> {
        let from = self.pos;
        let to = self.seek(from.saturating_add(n)).await?;
        Ok(to - from)
    }

    async fn available(&mut self) -> Result<u64> {
        self.reader()?;
        Ok(self.remaining())
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.take();
        Ok(())
    }
}

#[async_trait]
impl<R> ChunkSeek for SeekableSource<R>
where
    R: AsyncRead + AsyncSeek + Send + Unpin,
{
    async fn seek(&mut self, offset: u64) -> Result<u64> {
        let offset = min(offset, self.len);
        self.reader()?
            .seek(SeekFrom::Start(offset))
            .await
            .context(UnknownIOSnafu)?;
        self.pos = offset;
        Ok(offset)
    }
}

/// A caller-supplied source that only reads forward, such as a socket.
/// Skipping reads and discards.
pub struct ForwardSource<R> {
    inner: Option<R>,
    len:   u64,
    pos:   u64,
}

impl<R> ForwardSource<R>
where
    R: AsyncRead + Send + Unpin,
{
    pub fn new(reader: R, len: u64) -> Self {
        Self {
            inner: Some(reader),
            len,
            pos: 0,
        }
    }

    fn reader(&mut self) -> Result<&mut R> {
        self.inner.as_mut().context(ClosedSnafu {
            stream: "forward source",
        })
    }
}

#[async_trait]
impl<R> ChunkRead for ForwardSource<R>
where
    R: AsyncRead + Send + Unpin,
{
    fn kind(&self) -> &'static str { "forward source" }

    fn len(&self) -> u64 { self.len }

    fn position(&self) -> u64 { self.pos }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = min(buf.len() as u64, self.remaining()) as usize;
        let pos = self.pos;
        let reader = self.reader()?;
        if n == 0 {
            return Ok(0);
        }
        let got = reader.read(&mut buf[..n]).await.context(UnknownIOSnafu)?;
        // the source promised `len` bytes.
        ensure!(
            got > 0,
            StreamClosedSnafu {
                requested: pos + n as u64,
                written:   pos,
            }
        );
        self.pos += got as u64;
        Ok(got)
    }

    async fn skip(&mut self, n: u64) -> Result<u64> {
        let target = min(n, self.remaining());
        let mut scratch = vec![0u8; min(target, SKIP_BUFFER_SIZE as u64) as usize];
        let mut skipped = 0;
        while skipped < target {
            let want = min(target - skipped, scratch.len() as u64) as usize;
            skipped += self.read(&mut scratch[..want]).await? as u64;
        }
        Ok(skipped)
    }

    async fn available(&mut self) -> Result<u64> {
        self.reader()?;
        Ok(0)
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.take();
        Ok(())
    }
}
