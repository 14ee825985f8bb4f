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

use crate::network::SessionId;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("malformed protocol : {0}")]
    MalformedProtocol(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Accept error = {0}")]
    Accept(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// framing errors
    #[error("corrupt frame: {0}")]
    CorruptFrame(String),

    #[error("packet too large: {0}")]
    PacketTooLarge(String),

    /// session errors
    #[error("session {0} is not connected")]
    SessionClosed(SessionId),

    #[error("message handler fault: {0}")]
    HandlerFault(String),

    /// pool errors, these point at a capacity or programming mistake
    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("pool misuse: {0}")]
    PoolMisuse(String),
}
