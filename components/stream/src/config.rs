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

use std::{path::PathBuf, time::Duration};

use kasumi_common::{
    DISK_RELAY_INCREMENT, EXTERNAL_FILE_POLL_INTERVAL, EXTERNAL_FILE_WAIT_TIMEOUT,
    MEMORY_RELAY_INCREMENT, RELAY_RETRY_INTERVAL,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    /// A waiter re-checks the producer progress at least this often.
    pub retry_interval:   Duration,
    /// The longest a single read or seek waits for the producer. `None`
    /// waits for as long as the producer is alive.
    pub wait_timeout:     Option<Duration>,
    /// How many bytes the memory relay pulls from the source at once.
    pub memory_increment: usize,
    /// How many bytes the disk relay pulls from the source at once.
    pub disk_increment:   usize,
    /// Where the disk relay creates its temporary file, the OS temp dir by
    /// default.
    pub temp_dir:         Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            retry_interval:   RELAY_RETRY_INTERVAL,
            wait_timeout:     None,
            memory_increment: MEMORY_RELAY_INCREMENT,
            disk_increment:   DISK_RELAY_INCREMENT,
            temp_dir:         None,
        }
    }
}

impl RelayConfig {
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }

    pub fn with_temp_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExternalFileConfig {
    /// How often the file length is checked.
    pub poll_interval: Duration,
    /// After this long without enough bytes the data is presumed abandoned.
    pub wait_timeout:  Duration,
}

impl Default for ExternalFileConfig {
    fn default() -> Self {
        Self {
            poll_interval: EXTERNAL_FILE_POLL_INTERVAL,
            wait_timeout:  EXTERNAL_FILE_WAIT_TIMEOUT,
        }
    }
}
