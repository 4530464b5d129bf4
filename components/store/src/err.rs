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

    #[snafu(display("value {key} is corrupted: {reason}"))]
    Corrupted {
        key:      String,
        reason:   String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("OpenDAL operator failed"))]
    OpenDal {
        #[snafu(implicit)]
        location: Location,
        #[snafu(source)]
        error:    opendal::Error,
    },

    Metadata {
        #[snafu(implicit)]
        location: Location,
        source:   kasumi_types::err::Error,
    },
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::OpenDal { error, .. } if error.kind() == opendal::ErrorKind::NotFound)
    }

    pub fn is_invalid_argument(&self) -> bool {
        match self {
            Error::InvalidArgument { .. } => true,
            Error::Metadata { source, .. } => source.is_invalid_argument(),
            _ => false,
        }
    }

    pub fn is_corrupted(&self) -> bool {
        match self {
            Error::Corrupted { .. } => true,
            Error::Metadata { source, .. } => source.is_corrupted(),
            _ => false,
        }
    }
}
