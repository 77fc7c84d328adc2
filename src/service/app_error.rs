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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
#[error("engine error")]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("Accept error = {0}")]
    Accept(String),

    /// marker error
    Incomplete,

    /// protocol errors, these terminate the connection
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("frame of length {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// capacity errors, these reject the newcomer and leave existing
    /// connections untouched
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("duplicate peer: {0}")]
    DuplicatePeer(String),

    #[error("duplicate connection id: {0}")]
    DuplicateConnectionId(u64),

    /// dispatch errors, close policy is left to the caller
    #[error("unknown message id: {0}")]
    UnknownMessageId(u16),

    #[error("connection {0} is closing")]
    ConnectionClosing(u64),

    #[error("connect to {0} timed out")]
    ConnectTimeout(String),
}
