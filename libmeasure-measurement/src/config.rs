// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use libmeasure_common::config::parse_env;
use std::env;
use std::fmt::Debug;
use tracing::warn;

pub const ENV_TOTAL_MEMORY: &str = "MEASURE_TOTAL_MEMORY";
pub const ENV_PAGE_SIZE: &str = "MEASURE_PAGE_SIZE";
pub const ENV_ENABLE_PROFILING: &str = "MEASURE_ENABLE_PROFILING";
pub const ENV_VERBOSE: &str = "MEASURE_VERBOSE";

pub const DEFAULT_TOTAL_MEMORY: usize = 16_384_000;
pub const DEFAULT_PAGE_SIZE: usize = 8192;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MeasurementConfig {
    /// Size of the arena every subsystem allocates from.
    pub total_memory: usize,
    /// Rounded up to a power of two when the arena is created.
    pub page_size: usize,
    pub enable_profiling: bool,
    /// Installs the stderr logger when the context is created.
    pub verbose: bool,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            total_memory: DEFAULT_TOTAL_MEMORY,
            page_size: DEFAULT_PAGE_SIZE,
            enable_profiling: true,
            verbose: false,
        }
    }
}

impl MeasurementConfig {
    /// Reads `MEASURE_*` variables, keeping the default for unset or
    /// unparsable ones.
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            total_memory: env_or_default(
                ENV_TOTAL_MEMORY,
                parse_env::bytes(ENV_TOTAL_MEMORY).and_then(|v| usize::try_from(v).ok()),
                default.total_memory,
            ),
            page_size: env_or_default(
                ENV_PAGE_SIZE,
                parse_env::bytes(ENV_PAGE_SIZE).and_then(|v| usize::try_from(v).ok()),
                default.page_size,
            ),
            enable_profiling: parse_env::bool(ENV_ENABLE_PROFILING)
                .unwrap_or(default.enable_profiling),
            verbose: parse_env::bool(ENV_VERBOSE).unwrap_or(default.verbose),
        }
    }
}

/// Returns `value`, or `default` with a warning if the variable was set to
/// something that did not parse.
pub fn env_or_default<T: Debug>(name: &str, value: Option<T>, default: T) -> T {
    match value {
        Some(value) => value,
        None => {
            if env::var_os(name).is_some_and(|v| !v.is_empty()) {
                warn!(name, ?default, "Ignoring invalid configuration value");
            }
            default
        }
    }
}
