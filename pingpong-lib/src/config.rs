use clap::ValueEnum;

use crate::error::{PingpongError, Result};

pub const MAX_NUM_CHANNELS: usize = 80;
pub const MIN_MSG_SIZE: usize = 1;
pub const MAX_MSG_SIZE: usize = 1 << 22;
pub const BUFFER_ALIGN: usize = 1 << 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TestMode {
    /// Two-sided send/receive.
    Msg,
    /// Two-sided send/receive matched on a fixed tag.
    Tagged,
    /// One-sided write and read.
    Rma,
    /// One-sided u64 atomic write and fetch-read.
    Atomic,
}

impl TestMode {
    pub fn one_sided(self) -> bool {
        matches!(self, TestMode::Rma | TestMode::Atomic)
    }

    pub fn tagged(self) -> bool {
        self == TestMode::Tagged
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExecutionModel {
    /// One thread drives every channel with shared progress.
    Single,
    /// One pinned thread per channel with dedicated progress.
    Multi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    OneWay,
    Bidirectional,
}

#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub mode: TestMode,
    pub num_channels: usize,
    /// `None` picks the mode default: bidirectional for two-sided modes.
    pub direction: Option<Direction>,
    /// Peer to connect to. `None` runs as the server.
    pub server_name: Option<String>,
    pub provider_name: Option<String>,
    pub execution: ExecutionModel,
    pub min_size: usize,
    pub max_size: usize,
    pub pin_threads: bool,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            mode: TestMode::Msg,
            num_channels: 1,
            direction: None,
            server_name: None,
            provider_name: None,
            execution: ExecutionModel::Multi,
            min_size: MIN_MSG_SIZE,
            max_size: MAX_MSG_SIZE,
            pin_threads: true,
        }
    }
}

impl BenchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_channels == 0 || self.num_channels > MAX_NUM_CHANNELS {
            return Err(PingpongError::Config(format!(
                "channel count {} not in 1..={MAX_NUM_CHANNELS}",
                self.num_channels
            )));
        }
        for (name, size) in [("min_size", self.min_size), ("max_size", self.max_size)] {
            if !size.is_power_of_two() || size > MAX_MSG_SIZE {
                return Err(PingpongError::Config(format!(
                    "{name} {size} must be a power of two no larger than {MAX_MSG_SIZE}"
                )));
            }
        }
        if self.min_size > self.max_size {
            return Err(PingpongError::Config(format!(
                "min_size {} exceeds max_size {}",
                self.min_size, self.max_size
            )));
        }
        if let Some(name) = &self.server_name {
            if name.is_empty() {
                return Err(PingpongError::Config("empty server name".into()));
            }
        }
        Ok(())
    }

    pub fn role(&self) -> Role {
        if self.server_name.is_some() { Role::Client } else { Role::Server }
    }

    pub fn bidirectional(&self) -> bool {
        match self.direction {
            Some(direction) => direction == Direction::Bidirectional,
            None => !self.mode.one_sided(),
        }
    }

    /// Capacity of every per-channel data buffer.
    pub fn buffer_capacity(&self) -> usize {
        self.max_size.max(BUFFER_ALIGN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_defaults_follow_mode() {
        let mut config = BenchConfig::default();
        assert!(config.bidirectional());
        config.mode = TestMode::Rma;
        assert!(!config.bidirectional());
        config.direction = Some(Direction::Bidirectional);
        assert!(config.bidirectional());
        config.mode = TestMode::Tagged;
        config.direction = Some(Direction::OneWay);
        assert!(!config.bidirectional());
    }

    #[test]
    fn role_follows_server_name() {
        let mut config = BenchConfig::default();
        assert_eq!(config.role(), Role::Server);
        config.server_name = Some("node1".into());
        assert_eq!(config.role(), Role::Client);
    }

    #[test]
    fn rejects_bad_bounds() {
        let ok = BenchConfig::default();
        ok.validate().unwrap();

        for config in [
            BenchConfig { num_channels: 0, ..ok.clone() },
            BenchConfig { num_channels: MAX_NUM_CHANNELS + 1, ..ok.clone() },
            BenchConfig { min_size: 3, ..ok.clone() },
            BenchConfig { max_size: MAX_MSG_SIZE << 1, ..ok.clone() },
            BenchConfig { min_size: 64, max_size: 8, ..ok.clone() },
            BenchConfig { server_name: Some(String::new()), ..ok.clone() },
        ] {
            assert!(matches!(config.validate(), Err(PingpongError::Config(_))), "{config:?}");
        }
    }

    #[test]
    fn small_sweeps_keep_aligned_buffers() {
        let config = BenchConfig { max_size: 4, ..BenchConfig::default() };
        assert_eq!(config.buffer_capacity(), BUFFER_ALIGN);
    }
}
