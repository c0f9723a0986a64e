// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use libmeasure_common::config::parse_env;
use libmeasure_measurement::env_or_default;

pub const ENV_MAX_CALLPATH_DEPTH: &str = "MEASURE_PROFILING_MAX_CALLPATH_DEPTH";
pub const ENV_MAX_CALLPATH_NUM: &str = "MEASURE_PROFILING_MAX_CALLPATH_NUM";
pub const ENV_TASK_TABLE_SIZE: &str = "MEASURE_PROFILING_TASK_TABLE_SIZE";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProfileConfig {
    /// Frames deeper than this are absorbed by a collapse node.
    pub max_callpath_depth: u32,
    /// Once a location holds this many nodes, new frames collapse too.
    pub max_callpath_num: u64,
    /// Buckets of each location's task table. Zero is treated as one.
    pub task_table_size: u32,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            max_callpath_depth: 30,
            max_callpath_num: u64::MAX,
            task_table_size: 64,
        }
    }
}

impl ProfileConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            max_callpath_depth: env_or_default(
                ENV_MAX_CALLPATH_DEPTH,
                parse_env::int(ENV_MAX_CALLPATH_DEPTH),
                default.max_callpath_depth,
            ),
            max_callpath_num: env_or_default(
                ENV_MAX_CALLPATH_NUM,
                parse_env::int(ENV_MAX_CALLPATH_NUM),
                default.max_callpath_num,
            ),
            task_table_size: env_or_default(
                ENV_TASK_TABLE_SIZE,
                parse_env::int(ENV_TASK_TABLE_SIZE),
                default.task_table_size,
            ),
        }
    }
}
