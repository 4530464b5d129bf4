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


use std::{
    cmp::min,
    io::{ErrorKind, SeekFrom},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use snafu::{ensure, ResultExt};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    time::Instant,
};
use tracing::{debug, trace, warn};

use crate::{
    config::ExternalFileConfig,
    err::{ClosedSnafu, InvalidArgumentSnafu, Result, UnknownIOSnafu, WaitTimeoutSnafu},
    ChunkRead, ChunkSeek,
};

/// Reads `[begin, begin + len)` of a file written by somebody else.
///
/// There is nobody to notify us, so a read polls the file length until
/// enough bytes are on disk. The file does not have to exist when the
/// stream is opened.
pub struct ExternalFileWaitStream {
    path:     PathBuf,
    begin:    u64,
    len:      u64,
    offset:   u64,
    file:     Option<File>,
    // where `file` is positioned, absolute.
    file_pos: Option<u64>,
    config:   ExternalFileConfig,
    closed:   bool,
}

impl ExternalFileWaitStream {
    pub fn open<P: Into<PathBuf>>(
        path: P,
        begin: u64,
        len: u64,
        config: &ExternalFileConfig,
    ) -> Result<Self> {
        ensure!(
            !config.poll_interval.is_zero(),
            InvalidArgumentSnafu {
                reason: "poll interval must be positive",
            }
        );
        ensure!(
            begin.checked_add(len).is_some(),
            InvalidArgumentSnafu {
                reason: format!("range [{begin}, {begin} + {len}) overflows"),
            }
        );
        Ok(Self {
            path: path.into(),
            begin,
            len,
            offset: 0,
            file: None,
            file_pos: None,
            config: config.clone(),
            closed: false,
        })
    }

    pub fn path(&self) -> &Path { &self.path }

    pub fn begin(&self) -> u64 { self.begin }

    fn ensure_open(&self) -> Result<()> {
        ensure!(
            !self.closed,
            ClosedSnafu {
                stream: "external file",
            }
        );
        Ok(())
    }

    /// The current file length, 0 while the file does not exist.
    async fn file_len(&self) -> Result<u64> {
        match tokio::fs::metadata(&self.path).await {
            Ok(m) => Ok(m.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e).context(UnknownIOSnafu),
        }
    }

    /// Polls until the file holds at least `end` bytes.
    async fn wait_until(&self, end: u64) -> Result<()> {
        let start = Instant::now();
        loop {
            let on_disk = self.file_len().await?;
            if on_disk >= end {
                return Ok(());
            }
            let waited = start.elapsed();
            if waited >= self.config.wait_timeout {
                warn!(
                    "{:?} stuck at {} bytes, gave up waiting for {} after {:?}",
                    self.path, on_disk, end, waited
                );
                return WaitTimeoutSnafu {
                    requested: end,
                    waited,
                }
                .fail();
            }
            trace!("{:?} has {} of {} bytes", self.path, on_disk, end);
            tokio::time::sleep(min(
                self.config.poll_interval,
                self.config.wait_timeout - waited,
            ))
            .await;
        }
    }
}

#[async_trait]
impl ChunkRead for ExternalFileWaitStream {
    fn kind(&self) -> &'static str { "external file" }

    fn len(&self) -> u64 { self.len }

    fn position(&self) -> u64 { self.offset }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        let n = min(buf.len() as u64, self.remaining()) as usize;
        if n == 0 {
            return Ok(0);
        }
        let absolute = self.begin + self.offset;
        self.wait_until(absolute + n as u64).await?;

        if self.file.is_none() {
            debug!("opening external file {:?}", self.path);
            self.file = Some(File::open(&self.path).await.context(UnknownIOSnafu)?);
            self.file_pos = Some(0);
        }
        // unknown until the read below succeeds, a failed read re-seeks.
        let file_pos = self.file_pos.take();
        if let Some(file) = self.file.as_mut() {
            if file_pos != Some(absolute) {
                file.seek(SeekFrom::Start(absolute))
                    .await
                    .context(UnknownIOSnafu)?;
            }
            file.read_exact(&mut buf[..n])
                .await
                .context(UnknownIOSnafu)?;
        }
        self.file_pos = Some(absolute + n as u64);
        self.offset += n as u64;
        Ok(n)
    }

    async fn skip(&mut self, n: u64) -> Result<u64> {
        let from = self.offset;
        let to = self.seek(from.saturating_add(n)).await?;
        Ok(to - from)
    }

    async fn available(&mut self) -> Result<u64> {
        self.ensure_open()?;
        let on_disk = self.file_len().await?;
        Ok(min(
            on_disk.saturating_sub(self.begin + self.offset),
            self.remaining(),
        ))
    }

    async fn close(&mut self) -> Result<()> {
        self.file.take();
        self.file_pos = None;
        self.closed = true;
        Ok(())
    }
}

#[async_trait]
impl ChunkSeek for ExternalFileWaitStream {
    /// Only moves the cursor, the next read waits for the bytes.
    async fn seek(&mut self, offset: u64) -> Result<u64> {
        self.ensure_open()?;
        self.offset = min(offset, self.len);
        Ok(self.offset)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::test_util::pattern;

    fn quick() -> ExternalFileConfig {
        ExternalFileConfig {
            poll_interval: Duration::from_millis(10),
            wait_timeout:  Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn reads_a_growing_file() {
        let data = pattern(64 << 10);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("growing");

        let writer_path = path.clone();
        let writer_data = data.clone();
        let writer = tokio::spawn(async move {
            // the reader opens before the file exists.
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut file = tokio::fs::File::create(&writer_path).await.unwrap();
            for piece in writer_data.chunks(4096) {
                file.write_all(piece).await.unwrap();
                file.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let mut stream = ExternalFileWaitStream::open(&path, 1000, 20_000, &quick()).unwrap();
        assert_eq!(stream.available().await.unwrap(), 0);
        let mut buf = vec![0u8; 20_000];
        assert_eq!(stream.read_full(&mut buf).await.unwrap(), 20_000);
        assert_eq!(&buf[..], &data[1000..21_000]);
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);

        assert_eq!(stream.seek(10).await.unwrap(), 10);
        assert_eq!(stream.read_byte().await.unwrap(), Some(data[1010]));
        assert_eq!(stream.skip(1 << 20).await.unwrap(), 20_000 - 11);

        writer.await.unwrap();
        stream.seek(0).await.unwrap();
        assert_eq!(stream.available().await.unwrap(), 20_000);
    }

    #[tokio::test]
    async fn stalled_file_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stalled");
        tokio::fs::write(&path, pattern(100)).await.unwrap();

        let config = ExternalFileConfig {
            poll_interval: Duration::from_millis(10),
            wait_timeout:  Duration::from_millis(100),
        };
        let mut stream = ExternalFileWaitStream::open(&path, 0, 1000, &config).unwrap();
        let mut buf = vec![0u8; 50];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 50);

        // seeking never waits, reading past what is there does.
        assert_eq!(stream.seek(500).await.unwrap(), 500);
        let err = stream.read(&mut buf).await.unwrap_err();
        assert!(err.is_timeout());
        let io_err: std::io::Error = err.into();
        assert_eq!(io_err.kind(), std::io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn failed_read_is_retried_from_the_cursor() {
        let data = pattern(100);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replaced");
        let moved = dir.path().join("replaced.old");
        tokio::fs::write(&path, &data).await.unwrap();

        let mut stream = ExternalFileWaitStream::open(&path, 0, 100, &quick()).unwrap();
        let mut buf = vec![0u8; 10];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 10);

        // the open file shrinks under us while the path looks complete.
        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(30)
            .unwrap();
        std::fs::rename(&path, &moved).unwrap();
        std::fs::write(&path, &data).unwrap();
        let mut buf = vec![0u8; 50];
        assert!(stream.read(&mut buf).await.is_err());
        assert_eq!(stream.position(), 10);

        // the open handle is whole again.
        std::fs::write(&moved, &data).unwrap();
        assert_eq!(stream.read(&mut buf).await.unwrap(), 50);
        assert_eq!(&buf[..], &data[10..60]);
    }

    #[tokio::test]
    async fn closed_stream_rejects_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("closed");
        tokio::fs::write(&path, pattern(10)).await.unwrap();
        let mut stream = ExternalFileWaitStream::open(&path, 0, 10, &quick()).unwrap();
        stream.close().await.unwrap();
        stream.close().await.unwrap();
        let mut buf = [0u8; 4];
        assert!(stream.read(&mut buf).await.unwrap_err().is_closed());
        assert!(!stream.mark_supported());
    }
}
