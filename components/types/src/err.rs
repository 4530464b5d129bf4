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

    #[snafu(display("invalid part key: {key}"))]
    InvalidPartKey {
        key:      String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("invalid hex digest: {hash}"))]
    InvalidHash {
        hash:     String,
        #[snafu(implicit)]
        location: Location,
        source:   hex::FromHexError,
    },

    #[snafu(display("corrupted metadata record: {reason}"))]
    CorruptedMetadata {
        reason:   String,
        #[snafu(implicit)]
        location: Location,
    },

    MetadataIo {
        #[snafu(implicit)]
        location: Location,
        source:   std::io::Error,
    },

    #[snafu(display("failed to encode or decode json"))]
    Json {
        #[snafu(implicit)]
        location: Location,
        source:   serde_json::Error,
    },
}

impl Error {
    pub fn is_invalid_argument(&self) -> bool { matches!(self, Error::InvalidArgument { .. }) }

    pub fn is_corrupted(&self) -> bool {
        matches!(
            self,
            Error::CorruptedMetadata { .. } | Error::MetadataIo { .. } | Error::Json { .. }
        )
    }
}
