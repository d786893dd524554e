//! Adaptive concurrency control.
//!
//! The number of simultaneous outbound requests is derived from memory
//! pressure: the configured limit when resources are ample, halved under
//! moderate pressure, and strictly sequential under heavy pressure. The
//! limit never exceeds [`HARD_CEILING`].

use std::sync::Arc;

/// Hard ceiling on concurrent outbound requests.
pub const HARD_CEILING: usize = 10;

/// Memory-pressure reading as a used/total ratio in `0.0..=1.0`.
///
/// Injectable so tests (and platforms without a usable signal) can supply
/// their own. The default source reads `/proc/meminfo` on Linux and falls
/// back to a conservative mid-range reading elsewhere.
pub trait PressureSource: Send + Sync {
    /// Current memory pressure ratio.
    fn pressure(&self) -> f64;
}

/// Reads memory pressure from the platform, conservatively.
pub struct SystemPressure;

impl PressureSource for SystemPressure {
    fn pressure(&self) -> f64 {
        read_meminfo_pressure().unwrap_or(0.75)
    }
}

#[cfg(target_os = "linux")]
fn read_meminfo_pressure() -> Option<f64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total = None;
    let mut available = None;
    for line in meminfo.lines() {
        let mut parts = line.split_whitespace();
        match parts.next()? {
            "MemTotal:" => total = parts.next()?.parse::<f64>().ok(),
            "MemAvailable:" => available = parts.next()?.parse::<f64>().ok(),
            _ => {}
        }
        if total.is_some() && available.is_some() {
            break;
        }
    }
    let (total, available) = (total?, available?);
    if total <= 0.0 {
        return None;
    }
    Some(((total - available) / total).clamp(0.0, 1.0))
}

#[cfg(not(target_os = "linux"))]
fn read_meminfo_pressure() -> Option<f64> {
    None
}

/// A fixed pressure reading, for tests.
pub struct FixedPressure(pub f64);

impl PressureSource for FixedPressure {
    fn pressure(&self) -> f64 {
        self.0
    }
}

/// Computes the current request concurrency limit.
pub struct ConcurrencyController {
    configured: usize,
    source: Arc<dyn PressureSource>,
}

impl ConcurrencyController {
    /// Creates a controller for the configured limit with the system
    /// pressure source.
    #[must_use]
    pub fn new(configured: usize) -> Self {
        Self::with_source(configured, Arc::new(SystemPressure))
    }

    /// Creates a controller with an injected pressure source.
    #[must_use]
    pub fn with_source(configured: usize, source: Arc<dyn PressureSource>) -> Self {
        Self {
            configured: configured.clamp(1, HARD_CEILING),
            source,
        }
    }

    /// The limit to apply right now.
    #[must_use]
    pub fn current_limit(&self) -> usize {
        let pressure = self.source.pressure();
        let limit = if pressure < 0.70 {
            self.configured
        } else if pressure < 0.85 {
            (self.configured / 2).max(1)
        } else {
            1
        };
        limit.min(HARD_CEILING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ample_memory_uses_configured_limit() {
        let c = ConcurrencyController::with_source(5, Arc::new(FixedPressure(0.4)));
        assert_eq!(c.current_limit(), 5);
    }

    #[test]
    fn moderate_pressure_halves_the_limit() {
        let c = ConcurrencyController::with_source(8, Arc::new(FixedPressure(0.8)));
        assert_eq!(c.current_limit(), 4);
    }

    #[test]
    fn heavy_pressure_goes_sequential() {
        let c = ConcurrencyController::with_source(8, Arc::new(FixedPressure(0.95)));
        assert_eq!(c.current_limit(), 1);
    }

    #[test]
    fn configured_limit_is_clamped_to_ceiling() {
        let c = ConcurrencyController::with_source(64, Arc::new(FixedPressure(0.0)));
        assert_eq!(c.current_limit(), HARD_CEILING);
    }

    #[test]
    fn limit_never_drops_below_one() {
        let c = ConcurrencyController::with_source(1, Arc::new(FixedPressure(0.8)));
        assert_eq!(c.current_limit(), 1);
    }
}
