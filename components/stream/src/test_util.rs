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


use std::{io, time::Duration};

use bytes::Bytes;
use futures::{stream, stream::BoxStream, StreamExt};
use tokio_util::io::StreamReader;

pub(crate) type TestSource = StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>;

/// Deterministic bytes that do not repeat on power of two boundaries.
pub(crate) fn pattern(len: usize) -> Vec<u8> { (0..len).map(|i| (i % 251) as u8).collect() }

fn pieces(data: &[u8], piece: usize) -> Vec<Bytes> {
    data.chunks(piece.max(1)).map(Bytes::copy_from_slice).collect()
}

/// Yields `data` in `piece` sized parts, sleeping `delay` before each.
pub(crate) fn delayed_source(data: &[u8], piece: usize, delay: Duration) -> TestSource {
    let s = stream::iter(pieces(data, piece))
        .then(move |b| async move {
            tokio::time::sleep(delay).await;
            Ok(b)
        })
        .boxed();
    StreamReader::new(s)
}

/// Yields `data` then fails.
pub(crate) fn failing_source(data: &[u8], piece: usize) -> TestSource {
    let s = stream::iter(pieces(data, piece).into_iter().map(Ok))
        .chain(stream::once(async {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "upstream went away"))
        }))
        .boxed();
    StreamReader::new(s)
}

/// Yields `data` then never makes progress again.
pub(crate) fn stalled_source(data: &[u8]) -> TestSource {
    let s = stream::iter(vec![Ok(Bytes::copy_from_slice(data))])
        .chain(stream::pending())
        .boxed();
    StreamReader::new(s)
}
