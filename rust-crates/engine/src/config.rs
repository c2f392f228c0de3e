use crate::snapshot::{
    Variant,
    Wei,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::time::Duration;

/// 0.01 ETH
pub const DEFAULT_JOIN_STAKE: Wei = 10_000_000_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("`{field}` must be greater than zero")]
    Zero { field: &'static str },
    #[error("`{field}` ({value} ms) must not be shorter than `{other}` ({other_value} ms)")]
    TooShort {
        field: &'static str,
        value: u64,
        other: &'static str,
        other_value: u64,
    },
}

/// Gas ceilings per contract call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GasLimits {
    pub join: u64,
    pub enter: u64,
    pub claim: u64,
    pub distribute: u64,
    pub reset: u64,
    pub draw: u64,
}

impl Default for GasLimits {
    fn default() -> Self {
        Self {
            join: 150_000,
            enter: 250_000,
            claim: 120_000,
            distribute: 300_000,
            reset: 100_000,
            draw: 500_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub variant: Variant,
    pub poll_interval_ms: u64,
    pub tick_interval_ms: u64,
    /// Pause after a transaction settles before re-reading the contract.
    pub settle_delay_ms: u64,
    pub read_timeout_ms: u64,
    pub confirmation_timeout_ms: u64,
    /// An in-flight build older than this stops absorbing new triggers.
    pub stale_build_after_ms: u64,
    pub join_stake: Wei,
    pub auto_act: bool,
    pub gas: GasLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            variant: Variant::Pool,
            poll_interval_ms: 1_000,
            tick_interval_ms: 1_000,
            settle_delay_ms: 1_500,
            read_timeout_ms: 10_000,
            confirmation_timeout_ms: 120_000,
            stale_build_after_ms: 30_000,
            join_stake: DEFAULT_JOIN_STAKE,
            auto_act: true,
            gas: GasLimits::default(),
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }

    pub fn stale_build_after(&self) -> Duration {
        Duration::from_millis(self.stale_build_after_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("poll_interval_ms", self.poll_interval_ms),
            ("tick_interval_ms", self.tick_interval_ms),
            ("read_timeout_ms", self.read_timeout_ms),
            ("confirmation_timeout_ms", self.confirmation_timeout_ms),
            ("stale_build_after_ms", self.stale_build_after_ms),
        ];
        if let Some((field, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero { field: *field });
        }
        if self.stale_build_after_ms < self.read_timeout_ms {
            return Err(ConfigError::TooShort {
                field: "stale_build_after_ms",
                value: self.stale_build_after_ms,
                other: "read_timeout_ms",
                other_value: self.read_timeout_ms,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    #[test]
    fn deserialize__partial_json__fills_remaining_fields_with_defaults() {
        // given
        let raw = r#"{ "variant": "lottery", "settle_delay_ms": 500, "gas": { "draw": 42 } }"#;

        // when
        let config: EngineConfig = serde_json::from_str(raw).unwrap();

        // then
        let expected = EngineConfig {
            variant: Variant::Lottery,
            settle_delay_ms: 500,
            gas: GasLimits {
                draw: 42,
                ..GasLimits::default()
            },
            ..EngineConfig::default()
        };
        assert_eq!(expected, config);
    }

    #[test]
    fn validate__zero_poll_interval__is_rejected() {
        let config = EngineConfig {
            poll_interval_ms: 0,
            ..EngineConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "poll_interval_ms"
            })
        );
    }

    #[test]
    fn validate__stale_window_shorter_than_read_timeout__is_rejected() {
        let config = EngineConfig {
            read_timeout_ms: 5_000,
            stale_build_after_ms: 1_000,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooShort { .. })
        ));
    }

    #[test]
    fn validate__defaults__pass() {
        assert_eq!(EngineConfig::default().validate(), Ok(()));
    }
}
