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


use std::sync::Arc;

use snafu::{ensure, ResultExt};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::RwLock,
};
use tracing::trace;

use super::RelayShared;
use crate::err::{InvalidArgumentSnafu, Result, UnknownIOSnafu};

/// A buffer sized for the whole value up front, only ever appended to.
pub(crate) struct MemoryBacking {
    buf: Arc<RwLock<Vec<u8>>>,
}

impl MemoryBacking {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buf: Arc::new(RwLock::new(Vec::with_capacity(capacity))),
        }
    }

    pub(crate) fn buffer(&self) -> Arc<RwLock<Vec<u8>>> { self.buf.clone() }

    /// Copies already relayed bytes starting at `offset` into `dst`.
    pub(crate) async fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        let guard = self.buf.read().await;
        let start = offset as usize;
        let end = start + dst.len();
        ensure!(
            end <= guard.len(),
            InvalidArgumentSnafu {
                reason: format!("[{start}, {end}) is beyond the {} relayed bytes", guard.len()),
            }
        );
        dst.copy_from_slice(&guard[start..end]);
        Ok(())
    }
}

/// Pulls `size` bytes from `source` into `buf`, `increment` bytes at a time.
/// Returns how many bytes were copied before the source ended.
pub(crate) async fn relay<R>(
    mut source: R,
    size: u64,
    increment: usize,
    buf: Arc<RwLock<Vec<u8>>>,
    shared: Arc<RelayShared>,
) -> Result<u64>
where
    R: AsyncRead + Send + Unpin,
{
    let mut scratch = vec![0u8; increment];
    let mut copied = 0u64;
    while copied < size {
        let want = std::cmp::min(increment as u64, size - copied) as usize;
        let n = source
            .read(&mut scratch[..want])
            .await
            .context(UnknownIOSnafu)?;
        if n == 0 {
            break;
        }
        buf.write().await.extend_from_slice(&scratch[..n]);
        copied += n as u64;
        shared.advance(n as u64);
        trace!("memory relay at {} of {}", copied, size);
    }
    Ok(copied)
}
