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

use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::err::{JsonSnafu, Result};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExpireTimeUnit {
    Milliseconds,
    #[default]
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl ExpireTimeUnit {
    pub fn to_duration(self, value: u64) -> Duration {
        match self {
            ExpireTimeUnit::Milliseconds => Duration::from_millis(value),
            ExpireTimeUnit::Seconds => Duration::from_secs(value),
            ExpireTimeUnit::Minutes => Duration::from_secs(value.saturating_mul(60)),
            ExpireTimeUnit::Hours => Duration::from_secs(value.saturating_mul(3600)),
            ExpireTimeUnit::Days => Duration::from_secs(value.saturating_mul(24 * 3600)),
        }
    }
}

/// Options a chunk store driver is built with.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct DataStoreProperties {
    /// Keys are spread over the nodes instead of living on the local one.
    pub sharded:         bool,
    pub persistent:      bool,
    /// How many backup nodes hold a copy besides the primary.
    pub num_replicas:    u32,
    pub expirable:       bool,
    pub expire_timeunit: ExpireTimeUnit,
    pub expire_timeval:  u64,
}

impl DataStoreProperties {
    pub fn with_sharded(mut self, sharded: bool) -> Self {
        self.sharded = sharded;
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn with_num_replicas(mut self, num_replicas: u32) -> Self {
        self.num_replicas = num_replicas;
        self
    }

    pub fn with_expiry(mut self, unit: ExpireTimeUnit, value: u64) -> Self {
        self.expirable = true;
        self.expire_timeunit = unit;
        self.expire_timeval = value;
        self
    }

    /// How long an entry lives, `None` when entries never expire.
    pub fn expire_duration(&self) -> Option<Duration> {
        self.expirable
            .then(|| self.expire_timeunit.to_duration(self.expire_timeval))
    }

    pub fn to_json(&self) -> Result<String> { serde_json::to_string(self).context(JsonSnafu) }

    pub fn from_json(json: &str) -> Result<Self> { serde_json::from_str(json).context(JsonSnafu) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_keys() {
        let props = DataStoreProperties::default()
            .with_sharded(true)
            .with_num_replicas(2)
            .with_expiry(ExpireTimeUnit::Minutes, 5);
        let json = props.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["sharded"], true);
        assert_eq!(value["num_replicas"], 2);
        assert_eq!(value["expire_timeunit"], "MINUTES");
        assert_eq!(DataStoreProperties::from_json(&json).unwrap(), props);
        assert_eq!(props.expire_duration(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn missing_keys_use_defaults() {
        let props = DataStoreProperties::from_json(r#"{"persistent": true}"#).unwrap();
        assert!(props.persistent);
        assert!(!props.sharded);
        assert_eq!(props.num_replicas, 0);
        assert_eq!(props.expire_duration(), None);
    }
}
