//! Allocation configuration.

use std::{env, error::Error, str::FromStr};
use strum::{Display, EnumString};

/// Which allocator to run.
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, PartialEq)]
pub enum Strategy {
    /// The greedy allocator: values stay in registers as long as possible.
    #[strum(serialize = "greedy")]
    Greedy,
    /// The conservative allocator: every value lives on the stack between instructions.
    #[strum(serialize = "spill")]
    SpillAll,
    /// The greedy allocator, falling back to the conservative allocator if the greedy allocator
    /// fails with a recoverable error.
    #[strum(serialize = "greedy-then-spill")]
    GreedyThenSpill,
}

#[derive(Clone, Debug)]
pub struct AllocConfig {
    pub strategy: Strategy,
    /// Check every allocation with the verifier before returning it.
    pub verify: bool,
}

impl Default for AllocConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Greedy,
            verify: cfg!(debug_assertions),
        }
    }
}

impl AllocConfig {
    /// Create a configuration from the environment variables `SSARA_ALLOCATOR` (one of `greedy`,
    /// `spill`, or `greedy-then-spill`) and `SSARA_VERIFY` (`0` or `1`). Unset variables take
    /// their [Default] values.
    pub fn from_env() -> Result<Self, Box<dyn Error>> {
        Self::from_values(
            env::var("SSARA_ALLOCATOR").ok().as_deref(),
            env::var("SSARA_VERIFY").ok().as_deref(),
        )
    }

    fn from_values(allocator: Option<&str>, verify: Option<&str>) -> Result<Self, Box<dyn Error>> {
        let mut config = Self::default();
        if let Some(s) = allocator {
            config.strategy = Strategy::from_str(s)
                .map_err(|_| format!("Invalid SSARA_ALLOCATOR value '{s}'"))?;
        }
        match verify {
            None => (),
            Some("0") => config.verify = false,
            Some("1") => config.verify = true,
            Some(s) => return Err(format!("Invalid SSARA_VERIFY value '{s}'").into()),
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_values() {
        let config = AllocConfig::from_values(None, None).unwrap();
        assert_eq!(config.strategy, Strategy::Greedy);
        assert_eq!(config.verify, cfg!(debug_assertions));

        let config = AllocConfig::from_values(Some("greedy-then-spill"), Some("0")).unwrap();
        assert_eq!(config.strategy, Strategy::GreedyThenSpill);
        assert!(!config.verify);
        assert_eq!(
            AllocConfig::from_values(Some("spill"), Some("1"))
                .unwrap()
                .strategy,
            Strategy::SpillAll
        );

        assert_eq!(
            AllocConfig::from_values(Some("linear"), None)
                .unwrap_err()
                .to_string(),
            "Invalid SSARA_ALLOCATOR value 'linear'"
        );
        assert!(AllocConfig::from_values(None, Some("yes")).is_err());
    }

    #[test]
    fn strategy_names() {
        assert_eq!(Strategy::SpillAll.to_string(), "spill");
        assert_eq!(
            "greedy".parse::<Strategy>().unwrap(),
            Strategy::Greedy
        );
    }
}
