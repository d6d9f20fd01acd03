// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::cpu::{CpuStats, CpuStatsReader};
use tracing::debug;

/// Reader for platforms without a host-wide tick source.
pub struct UnsupportedCpuStatsReader;

impl CpuStatsReader for UnsupportedCpuStatsReader {
    fn read(&self) -> Option<CpuStats> {
        debug!("CPU tick source is not supported on this platform");
        None
    }
}
