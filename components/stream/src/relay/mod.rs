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

//! A relay copies an upstream source into a backing store on a background
//! task, while the owner of the [RelayStream] reads what has been copied so
//! far.
//!
//! The producer is the only writer of the backing store and publishes its
//! progress through [RelayShared]. A reader asking for bytes past the
//! published offset waits on a [Notify], re-checking at least every retry
//! interval so a lost wake-up costs latency, never a hang.

mod disk;
mod memory;

use std::{
    cmp::min,
    fmt::{Debug, Formatter},
    future::Future,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use kasumi_common::MEMORY_RELAY_AVAILABLE_CAP;
use snafu::{ensure, OptionExt};
use tokio::{io::AsyncRead, sync::Notify, task::JoinHandle, time::Instant};
use tracing::{debug, debug_span, error, trace, warn, Instrument};

use crate::{
    config::RelayConfig,
    err::{ClosedSnafu, InvalidArgumentSnafu, Result, StreamClosedSnafu, WaitTimeoutSnafu},
    ChunkRead, ChunkSeek,
};

/// Progress published by the producer.
pub(crate) struct RelayShared {
    written: AtomicU64,
    done:    AtomicBool,
    failed:  AtomicBool,
    notify:  Notify,
}

impl RelayShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            written: AtomicU64::new(0),
            done:    AtomicBool::new(false),
            failed:  AtomicBool::new(false),
            notify:  Notify::new(),
        })
    }

    pub(crate) fn written(&self) -> u64 { self.written.load(Ordering::Acquire) }

    fn is_done(&self) -> bool { self.done.load(Ordering::Acquire) }

    /// Called by the producer once `n` more bytes are readable.
    pub(crate) fn advance(&self, n: u64) {
        self.written.fetch_add(n, Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    fn finish(&self, failed: bool) {
        if failed {
            self.failed.store(true, Ordering::Release);
        }
        self.done.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// Everything a reader needs to wait on the producer, borrowed apart from
/// the backing store.
struct Waiter<'a> {
    kind:           &'static str,
    size:           u64,
    shared:         &'a RelayShared,
    retry_interval: Duration,
    wait_timeout:   Option<Duration>,
}

impl Waiter<'_> {
    /// Waits until the producer has published `target` bytes.
    async fn wait_for(&self, target: u64) -> Result<()> {
        let target = min(target, self.size);
        let start = Instant::now();
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // register before checking, so an advance in between wakes us.
            notified.as_mut().enable();

            if self.shared.written() >= target {
                return Ok(());
            }
            if self.shared.is_done() {
                // the producer publishes its last advance before finishing.
                let written = self.shared.written();
                if written >= target {
                    return Ok(());
                }
                warn!(
                    "{} finished at {} of {} bytes, offset {} is unreachable",
                    self.kind, written, self.size, target
                );
                return StreamClosedSnafu {
                    requested: target,
                    written,
                }
                .fail();
            }

            let mut patience = self.retry_interval;
            if let Some(limit) = self.wait_timeout {
                let waited = start.elapsed();
                ensure!(
                    waited < limit,
                    WaitTimeoutSnafu {
                        requested: target,
                        waited,
                    }
                );
                patience = min(patience, limit - waited);
            }
            if tokio::time::timeout(patience, notified).await.is_err() {
                trace!(
                    requested = target,
                    written = self.shared.written(),
                    "re-checking relay progress"
                );
            }
        }
    }
}

/// A snapshot of the producer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayProgress {
    pub written: u64,
    pub size:    u64,
    /// The producer has stopped, by success or failure.
    pub done:    bool,
    /// The producer stopped before copying `size` bytes.
    pub failed:  bool,
}

enum Backing {
    Memory(memory::MemoryBacking),
    Disk(disk::DiskBacking),
}

/// A stream over bytes that are still being copied from an upstream source.
///
/// The relay supports a single read cursor. Fan-out to several readers
/// needs several relays.
pub struct RelayStream {
    kind:           &'static str,
    size:           u64,
    read_offset:    u64,
    shared:         Arc<RelayShared>,
    // None once closed.
    backing:        Option<Backing>,
    producer:       Option<JoinHandle<()>>,
    retry_interval: Duration,
    wait_timeout:   Option<Duration>,
}

impl Debug for RelayStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let progress = self.progress();
        write!(
            f,
            "RelayStream {{ kind: {}, size: {}, read_offset: {}, written: {}, done: {}, failed: {}, closed: {} }}",
            self.kind,
            self.size,
            self.read_offset,
            progress.written,
            progress.done,
            progress.failed,
            self.backing.is_none(),
        )
    }
}

impl RelayStream {
    /// Relays `size` bytes of `source` into a pre-allocated memory buffer.
    ///
    /// Must be called within a tokio runtime, the producer starts right away.
    pub fn memory<R>(source: R, size: u64, config: &RelayConfig) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self::check_config(config, config.memory_increment)?;
        let capacity = usize::try_from(size).ok().context(InvalidArgumentSnafu {
            reason: format!("{size} bytes do not fit in memory"),
        })?;
        let shared = RelayShared::new();
        let backing = memory::MemoryBacking::new(capacity);
        let producer = spawn_producer(
            "memory",
            size,
            shared.clone(),
            memory::relay(
                source,
                size,
                config.memory_increment,
                backing.buffer(),
                shared.clone(),
            ),
        );
        Ok(Self::assemble("memory relay", size, shared, Backing::Memory(backing), producer, config))
    }

    /// Relays `size` bytes of `source` into a temporary file, deleted when
    /// the relay is closed.
    ///
    /// Must be called within a tokio runtime, the producer starts right away.
    pub fn disk<R>(source: R, size: u64, config: &RelayConfig) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self::check_config(config, config.disk_increment)?;
        let shared = RelayShared::new();
        let (backing, writer) = disk::DiskBacking::new(config.temp_dir.as_deref())?;
        debug!("disk relay of {} bytes backed by {:?}", size, backing.path());
        let producer = spawn_producer(
            "disk",
            size,
            shared.clone(),
            disk::relay(source, size, config.disk_increment, writer, shared.clone()),
        );
        Ok(Self::assemble("disk relay", size, shared, Backing::Disk(backing), producer, config))
    }

    fn check_config(config: &RelayConfig, increment: usize) -> Result<()> {
        ensure!(
            increment > 0,
            InvalidArgumentSnafu {
                reason: "relay increment must be positive",
            }
        );
        ensure!(
            !config.retry_interval.is_zero(),
            InvalidArgumentSnafu {
                reason: "relay retry interval must be positive",
            }
        );
        Ok(())
    }

    fn assemble(
        kind: &'static str,
        size: u64,
        shared: Arc<RelayShared>,
        backing: Backing,
        producer: JoinHandle<()>,
        config: &RelayConfig,
    ) -> Self {
        Self {
            kind,
            size,
            read_offset: 0,
            shared,
            backing: Some(backing),
            producer: Some(producer),
            retry_interval: config.retry_interval,
            wait_timeout: config.wait_timeout,
        }
    }

    pub fn progress(&self) -> RelayProgress {
        RelayProgress {
            written: self.shared.written(),
            size:    self.size,
            done:    self.shared.is_done(),
            failed:  self.shared.failed.load(Ordering::Acquire),
        }
    }

    /// The backing file of a disk relay, until it is closed.
    pub fn temp_path(&self) -> Option<&Path> {
        match &self.backing {
            Some(Backing::Disk(disk)) => Some(disk.path()),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool { self.backing.is_none() }

    fn waiter(&self) -> Waiter<'_> {
        Waiter {
            kind:           self.kind,
            size:           self.size,
            shared:         &self.shared,
            retry_interval: self.retry_interval,
            wait_timeout:   self.wait_timeout,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        ensure!(self.backing.is_some(), ClosedSnafu { stream: self.kind });
        Ok(())
    }
}

fn spawn_producer<F>(
    kind: &'static str,
    size: u64,
    shared: Arc<RelayShared>,
    relay: F,
) -> JoinHandle<()>
where
    F: Future<Output = Result<u64>> + Send + 'static,
{
    tokio::spawn(
        async move {
            let start = Instant::now();
            match relay.await {
                Ok(copied) if copied == size => {
                    debug!("relayed {} bytes, cost: {:?}", copied, start.elapsed());
                    shared.finish(false);
                }
                Ok(copied) => {
                    warn!("source ended after {} of {} bytes", copied, size);
                    shared.finish(true);
                }
                Err(e) => {
                    error!(
                        "relay failed after {} of {} bytes: {}",
                        shared.written(),
                        size,
                        e
                    );
                    shared.finish(true);
                }
            }
        }
        .instrument(debug_span!("relay_producer", kind, size)),
    )
}

#[async_trait]
impl ChunkRead for RelayStream {
    fn kind(&self) -> &'static str { self.kind }

    fn len(&self) -> u64 { self.size }

    fn position(&self) -> u64 { self.read_offset }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        let n = min(buf.len() as u64, self.remaining()) as usize;
        if n == 0 {
            return Ok(0);
        }
        let offset = self.read_offset;
        let waiter = self.waiter();
        waiter.wait_for(offset + n as u64).await?;

        let dst = &mut buf[..n];
        match self.backing.as_mut() {
            Some(Backing::Memory(memory)) => memory.read_at(offset, dst).await?,
            Some(Backing::Disk(disk)) => disk.read_at(offset, dst).await?,
            None => return ClosedSnafu { stream: self.kind }.fail(),
        }
        self.read_offset += n as u64;
        Ok(n)
    }

    async fn skip(&mut self, n: u64) -> Result<u64> {
        self.ensure_open()?;
        let from = self.read_offset;
        let target = min(from.saturating_add(n), self.size);
        let waiter = self.waiter();
        waiter.wait_for(target).await?;
        self.read_offset = target;
        Ok(target - from)
    }

    async fn available(&mut self) -> Result<u64> {
        self.ensure_open()?;
        let remaining = self.remaining();
        let read_offset = self.read_offset;
        match self.backing.as_mut() {
            Some(Backing::Memory(_)) => {
                let produced = self.shared.written().saturating_sub(read_offset);
                Ok(min(produced, MEMORY_RELAY_AVAILABLE_CAP))
            }
            Some(Backing::Disk(disk)) => disk.available(read_offset, remaining).await,
            None => ClosedSnafu { stream: self.kind }.fail(),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(producer) = self.producer.take() {
            if !producer.is_finished() {
                debug!("{} closed at {}, interrupting the producer", self.kind, self.read_offset);
            }
            producer.abort();
            // the source and the writer side are dropped with the task.
            if let Err(e) = producer.await {
                if !e.is_cancelled() {
                    warn!("{} producer did not exit cleanly: {}", self.kind, e);
                }
            }
        }
        // nobody may wait on a stopped producer.
        if !self.shared.is_done() {
            self.shared.finish(self.shared.written() < self.size);
        }

        match self.backing.take() {
            Some(Backing::Disk(disk)) => {
                let path = disk.path().to_path_buf();
                if let Err(e) = disk.close() {
                    warn!("failed to remove relay file {:?}: {}", path, e);
                }
            }
            Some(Backing::Memory(memory)) => drop(memory),
            None => {}
        }
        Ok(())
    }
}

#[async_trait]
impl ChunkSeek for RelayStream {
    async fn seek(&mut self, offset: u64) -> Result<u64> {
        self.ensure_open()?;
        let target = min(offset, self.size);
        let waiter = self.waiter();
        waiter.wait_for(target).await?;
        self.read_offset = target;
        Ok(target)
    }
}

impl Drop for RelayStream {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use kasumi_utils::logger::install_fmt_log;
    use tokio::time::Instant;

    use super::*;
    use crate::test_util::{delayed_source, failing_source, pattern, stalled_source};

    fn fast_config() -> RelayConfig {
        RelayConfig::default().with_retry_interval(Duration::from_millis(50))
    }

    type Builder = fn(crate::test_util::TestSource, u64, &RelayConfig) -> Result<RelayStream>;

    fn builders() -> [(&'static str, Builder); 2] {
        [
            ("memory", |s, size, c| RelayStream::memory(s, size, c)),
            ("disk", |s, size, c| RelayStream::disk(s, size, c)),
        ]
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sequential_read_reproduces_source() {
        install_fmt_log();
        let data = pattern(200_000);

        for (name, build) in builders() {
            for increment in [7, 1000, 64 << 10] {
                let mut config = fast_config();
                config.memory_increment = increment;
                config.disk_increment = increment;
                let source = delayed_source(&data, 9_999, Duration::from_millis(1));
                let mut relay = build(source, data.len() as u64, &config).unwrap();

                let mut out = Vec::new();
                let mut buf = vec![0u8; 4096];
                loop {
                    let n = relay.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    out.extend_from_slice(&buf[..n]);
                }
                assert_eq!(out.len(), data.len(), "{name} with increment {increment}");
                assert!(out == data, "{name} with increment {increment} corrupted the bytes");
                assert_eq!(relay.read_byte().await.unwrap(), None);
                relay.close().await.unwrap();
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn skip_then_read_tail() {
        install_fmt_log();
        let data = pattern(1000);

        for (name, build) in builders() {
            let source = delayed_source(&data, 100, Duration::from_millis(20));
            let mut relay = build(source, 1000, &fast_config()).unwrap();

            assert_eq!(relay.skip(550).await.unwrap(), 550);
            let mut buf = vec![0u8; 450];
            assert_eq!(relay.read_full(&mut buf).await.unwrap(), 450);
            assert_eq!(&buf[..], &data[550..], "{name}");
            assert_eq!(relay.progress().written, 1000);
            assert_eq!(relay.read(&mut buf).await.unwrap(), 0);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn seek_never_exposes_earlier_bytes() {
        install_fmt_log();
        let data = pattern(4096);

        for (name, build) in builders() {
            let source = delayed_source(&data, 128, Duration::from_millis(2));
            let mut relay = build(source, 4096, &fast_config()).unwrap();

            assert_eq!(relay.seek(3000).await.unwrap(), 3000);
            assert!(relay.progress().written >= 3000);
            let mut buf = vec![0u8; 96];
            relay.read_full(&mut buf).await.unwrap();
            assert_eq!(&buf[..], &data[3000..3096], "{name}");

            // going back is fine, the bytes are already relayed.
            assert_eq!(relay.seek(10).await.unwrap(), 10);
            assert_eq!(relay.read_byte().await.unwrap(), Some(data[10]));
        }
    }

    #[tokio::test]
    async fn seek_past_the_end_clamps() {
        install_fmt_log();
        let data = pattern(300);
        for (_, build) in builders() {
            let source = delayed_source(&data, 100, Duration::from_millis(1));
            let mut relay = build(source, 300, &fast_config()).unwrap();
            assert_eq!(relay.seek(10_000).await.unwrap(), 300);
            assert_eq!(relay.skip(5).await.unwrap(), 0);
            let mut buf = [0u8; 8];
            assert_eq!(relay.read(&mut buf).await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn short_source_closes_waiters() {
        install_fmt_log();
        let data = pattern(500);
        for (name, build) in builders() {
            let source = delayed_source(&data, 100, Duration::from_millis(1));
            let mut relay = build(source, 1000, &fast_config()).unwrap();

            let mut buf = vec![0u8; 400];
            relay.read_full(&mut buf).await.unwrap();
            let err = relay.seek(900).await.unwrap_err();
            assert!(err.is_stream_closed(), "{name}: {err}");
            let progress = relay.progress();
            assert!(progress.done && progress.failed);
            assert_eq!(progress.written, 500);

            // what did arrive is still readable.
            assert_eq!(relay.seek(450).await.unwrap(), 450);
        }
    }

    #[tokio::test]
    async fn failing_source_closes_waiters() {
        install_fmt_log();
        let data = pattern(300);
        for (name, build) in builders() {
            let mut relay = build(failing_source(&data, 100), 1000, &fast_config()).unwrap();
            let mut buf = vec![0u8; 1000];
            let err = relay.read(&mut buf).await.unwrap_err();
            assert!(err.is_stream_closed(), "{name}: {err}");
            assert!(relay.progress().failed);

            let io_err: std::io::Error = err.into();
            assert_eq!(io_err.kind(), std::io::ErrorKind::UnexpectedEof);
        }
    }

    #[tokio::test]
    async fn stalled_source_times_out() {
        install_fmt_log();
        let data = pattern(100);
        let config = fast_config().with_wait_timeout(Duration::from_millis(200));
        for (name, build) in builders() {
            let mut relay = build(stalled_source(&data), 1000, &config).unwrap();
            let start = Instant::now();
            let err = relay.seek(500).await.unwrap_err();
            assert!(err.is_timeout(), "{name}: {err}");
            assert!(start.elapsed() < Duration::from_secs(5));
            assert!(!relay.progress().done);
            relay.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn close_is_idempotent_and_releases_backing() {
        install_fmt_log();
        let data = pattern(100);

        let mut relay = RelayStream::disk(stalled_source(&data), 1000, &fast_config()).unwrap();
        relay.seek(100).await.unwrap();
        let path = relay.temp_path().unwrap().to_path_buf();
        assert!(path.exists());

        // the producer is parked on the source, close must interrupt it.
        tokio::time::timeout(Duration::from_secs(5), relay.close())
            .await
            .unwrap()
            .unwrap();
        assert!(!path.exists());
        assert!(relay.is_closed());
        assert!(relay.progress().done);
        relay.close().await.unwrap();

        let mut buf = [0u8; 4];
        assert!(relay.read(&mut buf).await.unwrap_err().is_closed());
        assert!(relay.seek(0).await.unwrap_err().is_closed());

        let mut relay = RelayStream::memory(stalled_source(&data), 1000, &fast_config()).unwrap();
        relay.close().await.unwrap();
        relay.close().await.unwrap();
        assert!(relay.available().await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn available_bytes() {
        install_fmt_log();
        let data = pattern(200 << 10);
        let size = data.len() as u64;

        let source = delayed_source(&data, 50 << 10, Duration::from_millis(1));
        let mut relay = RelayStream::memory(source, size, &fast_config()).unwrap();
        relay.seek(size).await.unwrap();
        relay.seek(0).await.unwrap();
        assert_eq!(relay.available().await.unwrap(), MEMORY_RELAY_AVAILABLE_CAP);
        relay.seek(size - 10).await.unwrap();
        assert_eq!(relay.available().await.unwrap(), 10);

        let source = delayed_source(&data, 50 << 10, Duration::from_millis(1));
        let mut relay = RelayStream::disk(source, size, &fast_config()).unwrap();
        relay.seek(size).await.unwrap();
        relay.seek(1000).await.unwrap();
        assert_eq!(relay.available().await.unwrap(), size - 1000);
    }

    #[tokio::test]
    async fn mark_is_unsupported() {
        let data = pattern(10);
        let mut relay =
            RelayStream::memory(delayed_source(&data, 10, Duration::ZERO), 10, &fast_config())
                .unwrap();
        assert!(!relay.mark_supported());
        assert!(relay.mark().unwrap_err().is_unsupported());
        assert!(relay.reset().unwrap_err().is_unsupported());
    }

    #[tokio::test]
    async fn rejects_bad_config() {
        let data = pattern(10);
        let mut config = fast_config();
        config.disk_increment = 0;
        let err = RelayStream::disk(delayed_source(&data, 10, Duration::ZERO), 10, &config)
            .unwrap_err();
        assert!(err.is_invalid_argument());
    }
}
