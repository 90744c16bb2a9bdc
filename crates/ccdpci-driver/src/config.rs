//! Driver configuration
//!
//! Defaults reproduce the timing the boards were qualified with. Every field
//! can be overridden from `CCDPCI_*` environment variables.

use crate::error::{DriverError, Result};
use ccdpci_chip::pvcam;
use std::time::Duration;

/// How a busy-phase wait gives up the CPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum YieldStrategy {
    /// Spin on the CPU.
    #[default]
    Spin,
    /// Offer the CPU to the scheduler between checks.
    ThreadYield,
    /// Sleep even in the busy phase.
    Sleep,
}

impl std::str::FromStr for YieldStrategy {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "spin" => Ok(Self::Spin),
            "yield" | "thread-yield" => Ok(Self::ThreadYield),
            "sleep" => Ok(Self::Sleep),
            other => Err(DriverError::invalid_argument(format!(
                "unknown yield strategy '{other}'"
            ))),
        }
    }
}

/// Register and poll timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timing {
    /// Delay before every register access.
    pub settle: Duration,
    /// Busy-poll step.
    pub busy_step: Duration,
    /// Busy-poll window.
    pub busy_max: Duration,
    /// Sleep-poll step.
    pub sleep_step: Duration,
    /// Overall wait budget.
    pub overall_max: Duration,
    /// Busy-phase strategy.
    pub yield_strategy: YieldStrategy,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            settle: Duration::from_nanos(500),
            busy_step: Duration::from_micros(1),
            busy_max: Duration::from_millis(5),
            sleep_step: Duration::from_millis(10),
            overall_max: Duration::from_secs(1),
            yield_strategy: YieldStrategy::Spin,
        }
    }
}

/// PVCAM transport settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvcamConfig {
    /// Wait for each command acknowledge.
    pub command_timeout: Duration,
    /// Pages per scatter-gather block.
    pub block_pages: usize,
    /// Scatter-gather table entries, terminator included.
    pub table_entries: usize,
}

impl Default for PvcamConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_millis(pvcam::DEFAULT_TIMEOUT_MS),
            block_pages: pvcam::IMAGE_PAGES,
            table_entries: pvcam::TABLE_SIZE,
        }
    }
}

/// Reserved, physically contiguous memory the ARC image buffers come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageRegion {
    /// First bus address of the region.
    pub base: u64,
    /// Region length in bytes.
    pub size: u64,
}

impl std::str::FromStr for ImageRegion {
    type Err = DriverError;

    /// Parse `base:size`, each decimal or `0x` hex.
    fn from_str(s: &str) -> Result<Self> {
        let (base, size) = s
            .split_once(':')
            .ok_or_else(|| DriverError::invalid_argument(format!("expected base:size, got '{s}'")))?;
        Ok(Self {
            base: parse_u64(base)?,
            size: parse_u64(size)?,
        })
    }
}

/// Top-level driver configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Register and poll timing.
    pub timing: Timing,
    /// PVCAM transport settings.
    pub pvcam: PvcamConfig,
    /// Host page size.
    pub page_size: usize,
    /// Where ARC image buffers are carved from, if anywhere.
    pub image_region: Option<ImageRegion>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            timing: Timing::default(),
            pvcam: PvcamConfig::default(),
            page_size: 4096,
            image_region: None,
        }
    }
}

impl DriverConfig {
    /// Scatter-gather block size in bytes.
    pub const fn block_size(&self) -> usize {
        self.page_size * self.pvcam.block_pages
    }

    /// Defaults with overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.page_size = rustix::param::page_size();
        Ok(config)
    }

    /// Defaults with overrides from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is present but cannot be parsed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = lookup("CCDPCI_SETTLE_NS") {
            config.timing.settle = Duration::from_nanos(parse_u64(&v)?);
        }
        if let Some(v) = lookup("CCDPCI_BUSY_US") {
            config.timing.busy_max = Duration::from_micros(parse_u64(&v)?);
        }
        if let Some(v) = lookup("CCDPCI_TIMEOUT_MS") {
            config.timing.overall_max = Duration::from_millis(parse_u64(&v)?);
        }
        if let Some(v) = lookup("CCDPCI_YIELD") {
            config.timing.yield_strategy = v.parse()?;
        }
        if let Some(v) = lookup("CCDPCI_PVCAM_TIMEOUT_MS") {
            config.pvcam.command_timeout = Duration::from_millis(parse_u64(&v)?);
        }
        if let Some(v) = lookup("CCDPCI_IMAGE_REGION") {
            config.image_region = Some(v.parse()?);
        }

        tracing::debug!("Driver config: {config:?}");
        Ok(config)
    }
}

fn parse_u64(s: &str) -> Result<u64> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| DriverError::invalid_argument(format!("'{s}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_board_constants() {
        let c = DriverConfig::default();
        assert_eq!(c.block_size(), 16_384);
        assert_eq!(c.pvcam.table_entries, 8192);
        assert_eq!(c.pvcam.command_timeout, Duration::from_millis(2000));
        assert!(c.timing.settle > Duration::ZERO);
        assert!(c.timing.busy_max < c.timing.overall_max);
    }

    #[test]
    fn lookup_overrides_fields() {
        let vars: HashMap<&str, &str> = [
            ("CCDPCI_TIMEOUT_MS", "250"),
            ("CCDPCI_YIELD", "yield"),
            ("CCDPCI_IMAGE_REGION", "0x3000_0000:0x100000"),
        ]
        .into_iter()
        .collect();
        let err = DriverConfig::from_lookup(|k| vars.get(k).map(ToString::to_string));
        // underscores are not accepted in hex
        assert!(err.is_err());

        let vars: HashMap<&str, &str> = [
            ("CCDPCI_TIMEOUT_MS", "250"),
            ("CCDPCI_YIELD", "yield"),
            ("CCDPCI_IMAGE_REGION", "0x30000000:1048576"),
        ]
        .into_iter()
        .collect();
        let c = DriverConfig::from_lookup(|k| vars.get(k).map(ToString::to_string)).unwrap();
        assert_eq!(c.timing.overall_max, Duration::from_millis(250));
        assert_eq!(c.timing.yield_strategy, YieldStrategy::ThreadYield);
        assert_eq!(
            c.image_region,
            Some(ImageRegion {
                base: 0x3000_0000,
                size: 1 << 20
            })
        );
    }
}
