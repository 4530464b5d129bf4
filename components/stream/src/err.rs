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

use std::time::Duration;

use snafu::{Location, Snafu};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("invalid argument: {reason}"))]
    InvalidArgument {
        reason:   String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display(
        "stream closed before offset {requested} was produced, only {written} bytes arrived"
    ))]
    StreamClosed {
        requested: u64,
        written:   u64,
        #[snafu(implicit)]
        location:  Location,
    },

    #[snafu(display("gave up after {waited:?} waiting for offset {requested}"))]
    WaitTimeout {
        requested: u64,
        waited:    Duration,
        #[snafu(implicit)]
        location:  Location,
    },

    #[snafu(display("{operation} is not supported by {stream}"))]
    Unsupported {
        operation: &'static str,
        stream:    &'static str,
        #[snafu(implicit)]
        location:  Location,
    },

    #[snafu(display("{stream} is already closed"))]
    Closed {
        stream:   &'static str,
        #[snafu(implicit)]
        location: Location,
    },

    UnknownIO {
        #[snafu(implicit)]
        location: Location,
        source:   std::io::Error,
    },
}

impl Error {
    pub fn is_timeout(&self) -> bool { matches!(self, Error::WaitTimeout { .. }) }

    pub fn is_stream_closed(&self) -> bool { matches!(self, Error::StreamClosed { .. }) }

    pub fn is_unsupported(&self) -> bool { matches!(self, Error::Unsupported { .. }) }

    pub fn is_invalid_argument(&self) -> bool { matches!(self, Error::InvalidArgument { .. }) }

    pub fn is_closed(&self) -> bool { matches!(self, Error::Closed { .. }) }
}

/// Stream failures surface as plain I/O failures to callers speaking
/// `std::io`.
impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        use std::io::ErrorKind;

        let kind = match &e {
            Error::InvalidArgument { .. } => ErrorKind::InvalidInput,
            Error::StreamClosed { .. } => ErrorKind::UnexpectedEof,
            Error::WaitTimeout { .. } => ErrorKind::TimedOut,
            Error::Unsupported { .. } => ErrorKind::Unsupported,
            Error::Closed { .. } => ErrorKind::BrokenPipe,
            Error::UnknownIO { source, .. } => source.kind(),
        };
        std::io::Error::new(kind, e)
    }
}
