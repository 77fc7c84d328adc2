use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::network::FRAME_HEADER_SIZE;

use super::{AppError, AppResult};

/// One listen or connect endpoint.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EndpointConfig {
    pub ip: String,
    pub port: u16,
}

impl EndpointConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub listeners: Vec<EndpointConfig>,
    pub max_connection: usize,
    /// upper bound on a declared frame size, header included
    pub max_frame_size: usize,
    /// refuse a second inbound connection from an already-connected host
    pub reject_duplicate_peers: bool,
    /// close the connection when a frame carries an unregistered message id
    pub close_on_unknown_message: bool,
    pub connect_timeout_ms: u64,
    /// ceiling on bytes queued behind an in-flight send per connection
    pub send_queue_max_bytes: usize,
    /// read inactivity window in seconds, 0 disables the idle timeout
    pub idle_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            listeners: vec![EndpointConfig {
                ip: "0.0.0.0".to_string(),
                port: 9098,
            }],
            max_connection: 1024,
            max_frame_size: 16 * 1024,
            reject_duplicate_peers: false,
            close_on_unknown_message: false,
            connect_timeout_ms: 5000,
            send_queue_max_bytes: 4 * 1024 * 1024,
            idle_timeout_secs: 0,
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        if self.idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.idle_timeout_secs))
        }
    }
}

/// Options applied to every accepted/connected socket at construction.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SocketConfig {
    pub nodelay: bool,
    /// keep-alive idle time in seconds, 0 disables keep-alive probing
    pub keepalive_secs: u64,
    pub keepalive_interval_secs: u64,
    /// close linger in seconds
    pub linger_secs: Option<u64>,
    /// OS receive buffer size, 0 keeps the OS default
    pub recv_buffer_size: usize,
    /// OS send buffer size, 0 keeps the OS default
    pub send_buffer_size: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        SocketConfig {
            nodelay: true,
            keepalive_secs: 60,
            keepalive_interval_secs: 10,
            linger_secs: None,
            recv_buffer_size: 0,
            send_buffer_size: 0,
        }
    }
}

/// Sizing of the receive buffer pool.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PoolConfig {
    /// capacity of each pooled receive buffer
    pub buffer_capacity: usize,
    /// idle buffers the pool retains, excess returns are discarded
    pub max_retained: usize,
    /// buffers allocated up front
    pub preallocate: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            buffer_capacity: 16 * 1024,
            max_retained: 1024,
            preallocate: 64,
        }
    }
}

/// Sizing of the outbound worker queues.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct OutboundConfig {
    pub channel_capacity: usize,
    /// number of worker channels, 0 derives from the CPU count
    pub num_channels: i8,
    pub monitor_interval: u64,
    pub worker_check_timeout: u64,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        OutboundConfig {
            channel_capacity: 1024,
            num_channels: 0,
            monitor_interval: 5,
            worker_check_timeout: 200,
        }
    }
}

impl OutboundConfig {
    pub fn resolved_num_channels(&self) -> i8 {
        if self.num_channels > 0 {
            self.num_channels
        } else {
            num_cpus::get().min(i8::MAX as usize) as i8
        }
    }
}

/// Immutable engine configuration, loaded once at startup and passed by
/// value into the engine.
#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub network: NetworkConfig,
    pub socket: SocketConfig,
    pub pool: PoolConfig,
    pub outbound: OutboundConfig,
}

impl EngineConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<EngineConfig> {
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

        let engine_config: EngineConfig = config.try_deserialize()?;
        engine_config.validate()?;

        Ok(engine_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.network.max_connection == 0 {
            return Err(AppError::InvalidConfig(
                "network.max_connection must be at least 1".to_string(),
            ));
        }
        if self.network.max_frame_size < FRAME_HEADER_SIZE {
            return Err(AppError::InvalidConfig(format!(
                "network.max_frame_size must cover the {} byte header",
                FRAME_HEADER_SIZE
            )));
        }
        if self.network.max_frame_size > u16::MAX as usize {
            return Err(AppError::InvalidConfig(format!(
                "network.max_frame_size cannot exceed {}",
                u16::MAX
            )));
        }
        if self.network.max_frame_size > self.pool.buffer_capacity {
            // a frame must always fit a receive buffer, otherwise the
            // receive loop can never assemble it
            return Err(AppError::InvalidConfig(format!(
                "network.max_frame_size {} exceeds pool.buffer_capacity {}",
                self.network.max_frame_size, self.pool.buffer_capacity
            )));
        }
        if self.network.send_queue_max_bytes < self.network.max_frame_size {
            return Err(AppError::InvalidConfig(
                "network.send_queue_max_bytes must hold at least one frame".to_string(),
            ));
        }
        if self.outbound.channel_capacity == 0 {
            return Err(AppError::InvalidConfig(
                "outbound.channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.outbound.num_channels < 0 {
            return Err(AppError::InvalidConfig(
                "outbound.num_channels cannot be negative".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_frame_size_must_fit_receive_buffer() {
        let mut config = EngineConfig::default();
        config.network.max_frame_size = config.pool.buffer_capacity + 1;
        assert!(matches!(
            config.validate(),
            Err(AppError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_frame_size_bounds() {
        let mut config = EngineConfig::default();
        config.network.max_frame_size = FRAME_HEADER_SIZE - 1;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.network.max_frame_size = u16::MAX as usize + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_max_connection_is_rejected() {
        let mut config = EngineConfig::default();
        config.network.max_connection = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_num_channels_falls_back_to_cpu_count() {
        let outbound = OutboundConfig {
            num_channels: 0,
            ..OutboundConfig::default()
        };
        assert!(outbound.resolved_num_channels() >= 1);

        let outbound = OutboundConfig {
            num_channels: 3,
            ..OutboundConfig::default()
        };
        assert_eq!(outbound.resolved_num_channels(), 3);
    }
}
