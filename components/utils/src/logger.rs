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

use kasumi_common::KASUMI_LOG_ENV;
use snafu::{ResultExt, Whatever};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt, Layer};

/// Configuration for kasumi logging.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Whether to route logs to stdout, otherwise stderr.
    pub log_to_stdout: bool,
    pub with_ansi: bool,
    /// The default filter directive (in the sense of
    /// [tracing_subscriber::filter::EnvFilter]) to use for logs. Will be
    /// overridden by the `KASUMI_LOG` environment variable if set.
    pub default_filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_to_stdout: false,
            with_ansi: false,
            default_filter: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn init_tracing_subscriber(self) -> Result<(), Whatever> {
        let env_filter = create_env_filter(&self.default_filter);
        // Don't install anything if we'll never emit any logs.
        if env_filter.max_level_hint() == Some(LevelFilter::OFF) {
            return Ok(());
        }

        let fmt_layer = if self.log_to_stdout {
            tracing_subscriber::fmt::layer()
                .with_ansi(self.with_ansi)
                .with_writer(std::io::stdout)
                .with_filter(env_filter)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_ansi(self.with_ansi)
                .with_writer(std::io::stderr)
                .with_filter(env_filter)
                .boxed()
        };

        tracing_subscriber::registry()
            .with(fmt_layer)
            .try_init()
            .whatever_context("failed to install the tracing subscriber")?;
        tracing::debug!("logging started");
        Ok(())
    }
}

/// Create the filter from the KASUMI_LOG environment variable or the given
/// default directive if that variable is unset.
fn create_env_filter(filter: &str) -> EnvFilter {
    EnvFilter::try_from_env(KASUMI_LOG_ENV).unwrap_or_else(|_| EnvFilter::new(filter))
}

/// Installs a test-friendly fmt subscriber. Safe to call from every test.
pub fn install_fmt_log() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(create_env_filter("debug"))
        .with_test_writer()
        .try_init();
}
