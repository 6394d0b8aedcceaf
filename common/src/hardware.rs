use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Mutex,
};

use crate::{config::CurrentSenseConfig, error::HardwareError};

/// Physical side of one relay: an output level and optionally a current sensor.
///
/// Implementations must be callable from any execution context; countdown
/// expiry actuates from the timer context.
pub trait RelayHardware: Send + Sync {
    fn set_state(&self, on: bool) -> Result<(), HardwareError>;

    fn state(&self) -> bool;

    /// Amperes drawn through the relay, `None` when no sensing channel is wired.
    fn read_current(&self) -> Option<Result<f32, HardwareError>> {
        None
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Acs712 {
    config: CurrentSenseConfig,
}

impl Acs712 {
    pub fn new(config: CurrentSenseConfig) -> Self {
        Self { config }
    }

    pub fn amps(&self, millivolts: f32) -> f32 {
        let amps = (millivolts - self.config.zero_offset_mv) / self.config.sensitivity_mv_per_amp;
        let amps = amps.abs();
        if amps < self.config.noise_floor_amps {
            0.0
        } else {
            amps
        }
    }

    pub fn amps_from_samples(&self, samples_mv: &[f32]) -> f32 {
        if samples_mv.is_empty() {
            return 0.0;
        }
        let mean = samples_mv.iter().sum::<f32>() / samples_mv.len() as f32;
        self.amps(mean)
    }

    pub fn samples(&self) -> usize {
        usize::from(self.config.samples.max(1))
    }
}

/// In-memory relay used by the host build and tests.
#[derive(Debug, Default)]
pub struct SimulatedRelay {
    on: AtomicBool,
    actuations: AtomicU32,
    fail_writes: AtomicBool,
    current_amps: Mutex<Option<f32>>,
    history: Mutex<Vec<bool>>,
}

impl SimulatedRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_current_sensor(amps_when_on: f32) -> Self {
        let relay = Self::default();
        if let Ok(mut current) = relay.current_amps.lock() {
            *current = Some(amps_when_on);
        }
        relay
    }

    pub fn actuation_count(&self) -> u32 {
        self.actuations.load(Ordering::SeqCst)
    }

    pub fn history(&self) -> Vec<bool> {
        self.history
            .lock()
            .map(|history| history.clone())
            .unwrap_or_default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }
}

impl RelayHardware for SimulatedRelay {
    fn set_state(&self, on: bool) -> Result<(), HardwareError> {
        self.actuations.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut history) = self.history.lock() {
            history.push(on);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(HardwareError::Gpio {
                pin: -1,
                reason: "simulated write failure".to_string(),
            });
        }
        self.on.store(on, Ordering::SeqCst);
        Ok(())
    }

    fn state(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }

    fn read_current(&self) -> Option<Result<f32, HardwareError>> {
        let amps = (*self.current_amps.lock().ok()?)?;
        Some(Ok(if self.state() { amps } else { 0.0 }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acs712_converts_around_zero_offset() {
        let sensor = Acs712::new(CurrentSenseConfig::default());

        assert_eq!(sensor.amps(1_650.0), 0.0);
        assert!((sensor.amps(1_650.0 + 244.0) - 2.0).abs() < 1e-4);
        // Reverse current reads as magnitude.
        assert!((sensor.amps(1_650.0 - 122.0) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn acs712_suppresses_noise_floor() {
        let sensor = Acs712::new(CurrentSenseConfig::default());
        assert_eq!(sensor.amps(1_655.0), 0.0);
        assert_eq!(sensor.amps_from_samples(&[]), 0.0);
        assert!((sensor.amps_from_samples(&[1_772.0, 1_772.0]) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn simulated_relay_records_history_and_failures() {
        let relay = SimulatedRelay::new();
        relay.set_state(true).unwrap();
        relay.set_failing(true);
        assert!(relay.set_state(false).is_err());

        assert!(relay.state());
        assert_eq!(relay.history(), vec![true, false]);
        assert_eq!(relay.actuation_count(), 2);
    }

    #[test]
    fn simulated_current_only_flows_when_on() {
        let relay = SimulatedRelay::with_current_sensor(1.5);
        assert_eq!(relay.read_current(), Some(Ok(0.0)));
        relay.set_state(true).unwrap();
        assert_eq!(relay.read_current(), Some(Ok(1.5)));
        assert_eq!(SimulatedRelay::new().read_current(), None);
    }
}
