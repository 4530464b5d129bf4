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
    io::SeekFrom,
    path::Path,
    sync::Arc,
};

use snafu::ResultExt;
use tempfile::TempPath;
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tracing::trace;

use super::RelayShared;
use crate::err::{Result, UnknownIOSnafu};

const RELAY_FILE_PREFIX: &str = "kasumi-relay-";

/// A temporary file holding the relayed bytes. The producer writes through
/// its own handle, the reader keeps a second one.
pub(crate) struct DiskBacking {
    reader:     File,
    reader_pos: u64,
    path:       TempPath,
}

impl DiskBacking {
    /// Creates the file, returning the backing and the producer's handle.
    pub(crate) fn new(dir: Option<&Path>) -> Result<(Self, File)> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(RELAY_FILE_PREFIX);
        let temp = match dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .context(UnknownIOSnafu)?;

        let writer = File::from_std(temp.reopen().context(UnknownIOSnafu)?);
        let reader = File::from_std(temp.reopen().context(UnknownIOSnafu)?);
        Ok((
            Self {
                reader,
                reader_pos: 0,
                path: temp.into_temp_path(),
            },
            writer,
        ))
    }

    pub(crate) fn path(&self) -> &Path { &self.path }

    pub(crate) async fn read_at(&mut self, offset: u64, dst: &mut [u8]) -> Result<()> {
        if self.reader_pos != offset {
            self.reader
                .seek(SeekFrom::Start(offset))
                .await
                .context(UnknownIOSnafu)?;
            self.reader_pos = offset;
        }
        self.reader.read_exact(dst).await.context(UnknownIOSnafu)?;
        self.reader_pos += dst.len() as u64;
        Ok(())
    }

    /// Bytes already on disk past `offset`, capped by `remaining`.
    pub(crate) async fn available(&self, offset: u64, remaining: u64) -> Result<u64> {
        let on_disk = self.reader.metadata().await.context(UnknownIOSnafu)?.len();
        Ok(min(on_disk.saturating_sub(offset), remaining))
    }

    /// Removes the file.
    pub(crate) fn close(self) -> std::io::Result<()> {
        drop(self.reader);
        self.path.close()
    }
}

/// Pulls `size` bytes from `source` into `writer`, `increment` bytes at a
/// time. Bytes are flushed before they are published.
pub(crate) async fn relay<R>(
    mut source: R,
    size: u64,
    increment: usize,
    mut writer: File,
    shared: Arc<RelayShared>,
) -> Result<u64>
where
    R: AsyncRead + Send + Unpin,
{
    let mut scratch = vec![0u8; increment];
    let mut copied = 0u64;
    while copied < size {
        let want = min(increment as u64, size - copied) as usize;
        let n = source
            .read(&mut scratch[..want])
            .await
            .context(UnknownIOSnafu)?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&scratch[..n])
            .await
            .context(UnknownIOSnafu)?;
        writer.flush().await.context(UnknownIOSnafu)?;
        copied += n as u64;
        shared.advance(n as u64);
        trace!("disk relay at {} of {}", copied, size);
    }
    Ok(copied)
}
