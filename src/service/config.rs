// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

extern crate config as _;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

/// Largest body a 2-byte signed length header can declare.
pub const MAX_BODY_SIZE: usize = i16::MAX as usize;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    /// Number of pooled receive/send contexts, i.e. the accept side capacity.
    pub max_connection: usize,
    /// Size of each receive buffer sliced out of the pool slab.
    pub buffer_size: usize,
    /// Declared body lengths above this are treated as a corrupt stream.
    pub max_body_size: usize,
    /// Queue completed frames to a single logic task instead of dispatching
    /// them on the I/O task that resolved them.
    pub use_logic_thread: bool,
    /// Consecutive zero-length write completions tolerated before the
    /// transport is considered broken.
    pub max_zero_write_retries: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "0.0.0.0".to_string(),
            port: 25526,
            max_connection: 1000,
            buffer_size: 1440,
            max_body_size: MAX_BODY_SIZE,
            use_logic_thread: false,
            max_zero_write_retries: 16,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    /// Pulse interval announced to connectors in the start-heartbeat frame.
    pub send_interval_secs: u8,
    pub check_interval_secs: u64,
    /// A session whose last heartbeat is older than this gets disconnected.
    pub allowed_duration_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            enabled: false,
            send_interval_secs: 5,
            check_interval_secs: 10,
            allowed_duration_secs: 10,
        }
    }
}

impl HeartbeatConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
    pub fn allowed_duration(&self) -> Duration {
        Duration::from_secs(self.allowed_duration_secs)
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    pub network: NetworkConfig,
    pub heartbeat: HeartbeatConfig,
}

impl ServiceConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ServiceConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let service_config: ServiceConfig = config.try_deserialize()?;
        service_config.validate()?;

        Ok(service_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        let network = &self.network;
        if network.max_connection == 0 {
            return Err(AppError::InvalidValue(
                "network.max_connection must be greater than 0".to_string(),
            ));
        }
        if network.buffer_size == 0 {
            return Err(AppError::InvalidValue(
                "network.buffer_size must be greater than 0".to_string(),
            ));
        }
        if network.max_body_size == 0 || network.max_body_size > MAX_BODY_SIZE {
            return Err(AppError::InvalidValue(format!(
                "network.max_body_size must be within 1..={}",
                MAX_BODY_SIZE
            )));
        }
        if self.heartbeat.enabled && self.heartbeat.send_interval_secs == 0 {
            return Err(AppError::InvalidValue(
                "heartbeat.send_interval_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::Builder;

    use super::*;

    #[test]
    fn test_load_config_file() -> AppResult<()> {
        let mut file = Builder::new().suffix(".toml").tempfile()?;
        writeln!(
            file,
            r#"
[network]
ip = "127.0.0.1"
port = 9000
max_connection = 8
use_logic_thread = true

[heartbeat]
enabled = true
send_interval_secs = 3
"#
        )?;

        let config = ServiceConfig::set_up_config(file.path())?;
        assert_eq!(config.network.ip, "127.0.0.1");
        assert_eq!(config.network.port, 9000);
        assert_eq!(config.network.max_connection, 8);
        assert!(config.network.use_logic_thread);
        // unset fields fall back to defaults
        assert_eq!(config.network.buffer_size, 1440);
        assert!(config.heartbeat.enabled);
        assert_eq!(config.heartbeat.send_interval_secs, 3);
        assert_eq!(config.heartbeat.allowed_duration_secs, 10);
        Ok(())
    }

    #[test]
    fn test_reject_oversized_body_limit() -> AppResult<()> {
        let mut file = Builder::new().suffix(".toml").tempfile()?;
        writeln!(file, "[network]\nmax_body_size = 40000")?;

        let result = ServiceConfig::set_up_config(file.path());
        assert!(matches!(result, Err(AppError::InvalidValue(_))));
        Ok(())
    }

    #[test]
    fn test_missing_file() {
        let result = ServiceConfig::set_up_config("/nonexistent/sessionwire.toml");
        assert!(matches!(result, Err(AppError::ConfigFileError(_))));
    }
}
