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

/// Environment variable holding the tracing filter directive.
pub const KASUMI_LOG_ENV: &str = "KASUMI_LOG";

// The memory relay copies the upstream source in 64 KiB increments.
pub const MEMORY_RELAY_INCREMENT: usize = 64 << 10;
// The disk relay copies the upstream source in 16 KiB increments.
pub const DISK_RELAY_INCREMENT: usize = 16 << 10;
// `available` of a memory relay never reports more than this.
pub const MEMORY_RELAY_AVAILABLE_CAP: u64 = 64 << 10;
/// How often a relay waiter re-checks the producer progress even without
/// a wake-up.
pub const RELAY_RETRY_INTERVAL: Duration = Duration::from_secs(3);

pub const EXTERNAL_FILE_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const EXTERNAL_FILE_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

// Used when skipping over a forward-only source.
pub const SKIP_BUFFER_SIZE: usize = 16 << 10;

/// Separates the base key from the part number: `<key>:<part_no>`.
pub const PART_KEY_DELIMITER: char = ':';

pub type NodeId = i32;
/// Reserved node id meaning every node of the recipe can serve the chunk.
pub const ALL_NODES: NodeId = -1;

pub type FileOffset = u64;
pub type ChunkSize = u64;
pub type PartSize = u64;
pub type PartIndex = u64;
