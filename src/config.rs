// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Settlement configuration, read from TOML.
//!
//! ```toml
//! currency = "usd"
//! processor_timeout_ms = 10000
//! conflict_retries = 1
//! log_level = "info"
//!
//! [platform_fee]
//! percent = "5"
//! fixed = 0
//! ```

use crate::error::ConfigError;
use crate::money::FeeSchedule;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// ISO currency code passed to the processor.
    pub currency: String,
    pub platform_fee: FeeSchedule,
    /// Upper bound on a single processor call.
    pub processor_timeout_ms: u64,
    /// Retries of a lost booking claim before reporting a conflict.
    pub conflict_retries: u32,
    pub log_level: String,
}

impl SettlementConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn processor_timeout(&self) -> Duration {
        Duration::from_millis(self.processor_timeout_ms)
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            currency: "usd".to_string(),
            platform_fee: FeeSchedule::default(),
            processor_timeout_ms: 10_000,
            conflict_retries: 1,
            log_level: "info".to_string(),
        }
    }
}
