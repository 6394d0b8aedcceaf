use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::PanelError;

pub const MAX_RELAYS: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimerConfig {
    pub duration_secs: u32,
    pub tick_period_ms: u64,
    pub refresh_interval_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            // The full-scale build runs 30 * 60.
            duration_secs: 10,
            tick_period_ms: 1_000,
            refresh_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayConfig {
    pub name: String,
    pub tag: String,
    #[serde(default)]
    pub gpio_pin: Option<i32>,
    #[serde(default)]
    pub led_pin: Option<i32>,
    #[serde(default)]
    pub adc_channel: Option<u8>,
    #[serde(default = "default_active_low")]
    pub active_low: bool,
}

fn default_active_low() -> bool {
    true
}

impl RelayConfig {
    pub fn new(index: usize, gpio_pin: Option<i32>) -> Self {
        Self {
            name: format!("Relay {index}"),
            tag: format!("relay_{index}_ui"),
            gpio_pin,
            led_pin: None,
            adc_channel: None,
            active_low: true,
        }
    }

    pub fn has_hardware(&self) -> bool {
        self.gpio_pin.is_some_and(|pin| pin >= 0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CurrentSenseConfig {
    pub zero_offset_mv: f32,
    pub sensitivity_mv_per_amp: f32,
    pub noise_floor_amps: f32,
    pub samples: u8,
}

impl Default for CurrentSenseConfig {
    fn default() -> Self {
        // ACS712-05B behind a 5V -> 3.3V divider.
        Self {
            zero_offset_mv: 1_650.0,
            sensitivity_mv_per_amp: 122.0,
            noise_floor_amps: 0.08,
            samples: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub http_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            http_port: 80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelConfig {
    #[serde(default)]
    pub timer: TimerConfig,
    pub relays: Vec<RelayConfig>,
    #[serde(default)]
    pub current_sense: CurrentSenseConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            timer: TimerConfig::default(),
            relays: (1..=6)
                .map(|index| RelayConfig::new(index, Some(34 + index as i32)))
                .collect(),
            current_sense: CurrentSenseConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl TimerConfig {
    pub fn sanitize(&mut self) {
        if self.duration_secs == 0 {
            self.duration_secs = Self::default().duration_secs;
        }
        self.tick_period_ms = self.tick_period_ms.clamp(10, 60_000);
        self.refresh_interval_ms = self.refresh_interval_ms.clamp(10, 1_000);
    }
}

impl CurrentSenseConfig {
    pub fn sanitize(&mut self) {
        if !self.sensitivity_mv_per_amp.is_finite() || self.sensitivity_mv_per_amp <= 0.0 {
            self.sensitivity_mv_per_amp = Self::default().sensitivity_mv_per_amp;
        }
        if !self.zero_offset_mv.is_finite() {
            self.zero_offset_mv = Self::default().zero_offset_mv;
        }
        if !self.noise_floor_amps.is_finite() || self.noise_floor_amps < 0.0 {
            self.noise_floor_amps = 0.0;
        }
        self.samples = self.samples.max(1);
    }
}

impl PanelConfig {
    pub fn sanitize(&mut self) {
        self.timer.sanitize();
        self.current_sense.sanitize();

        for (index, relay) in self.relays.iter_mut().enumerate() {
            if relay.name.trim().is_empty() {
                relay.name = "RELAY".to_string();
            }
            if relay.tag.trim().is_empty() {
                relay.tag = format!("relay_{}_ui", index + 1);
            }
            if relay.gpio_pin.is_some_and(|pin| pin < 0) {
                relay.gpio_pin = None;
            }
            if relay.led_pin.is_some_and(|pin| pin < 0) {
                relay.led_pin = None;
            }
            if relay.adc_channel.is_some_and(|channel| channel > 9) {
                relay.adc_channel = None;
            }
        }
    }

    pub fn validate(&self) -> Result<(), PanelError> {
        if self.relays.is_empty() {
            return Err(PanelError::InvalidArgument(
                "at least one relay must be configured".to_string(),
            ));
        }
        if self.relays.len() > MAX_RELAYS {
            return Err(PanelError::InvalidArgument(format!(
                "{} relays configured, at most {MAX_RELAYS} supported",
                self.relays.len()
            )));
        }

        let mut pins = HashSet::new();
        for relay in &self.relays {
            for pin in [relay.gpio_pin, relay.led_pin].into_iter().flatten() {
                if !pins.insert(pin) {
                    return Err(PanelError::InvalidArgument(format!(
                        "gpio {pin} assigned more than once ({})",
                        relay.name
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = PanelConfig::default();
        assert_eq!(config.relays.len(), 6);
        assert_eq!(config.relays[0].gpio_pin, Some(35));
        assert_eq!(config.relays[5].gpio_pin, Some(40));
        assert_eq!(config.timer.duration_secs, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn duplicate_pins_are_rejected() {
        let mut config = PanelConfig::default();
        config.relays[1].gpio_pin = Some(35);

        assert!(matches!(
            config.validate(),
            Err(PanelError::InvalidArgument(_))
        ));
    }

    #[test]
    fn empty_and_oversized_relay_lists_are_rejected() {
        let mut config = PanelConfig::default();
        config.relays.clear();
        assert!(config.validate().is_err());

        config.relays = (1..=MAX_RELAYS + 1)
            .map(|index| RelayConfig::new(index, None))
            .collect();
        assert!(config.validate().is_err());
    }

    #[test]
    fn sanitize_repairs_out_of_range_values() {
        let mut config = PanelConfig::default();
        config.timer.duration_secs = 0;
        config.timer.refresh_interval_ms = 0;
        config.relays[0].name = "  ".to_string();
        config.relays[0].gpio_pin = Some(-1);
        config.relays[0].adc_channel = Some(12);
        config.current_sense.sensitivity_mv_per_amp = -3.0;

        config.sanitize();

        assert_eq!(config.timer.duration_secs, 10);
        assert_eq!(config.timer.refresh_interval_ms, 10);
        assert_eq!(config.relays[0].name, "RELAY");
        assert_eq!(config.relays[0].gpio_pin, None);
        assert_eq!(config.relays[0].adc_channel, None);
        assert!(!config.relays[0].has_hardware());
        assert_eq!(config.current_sense.sensitivity_mv_per_amp, 122.0);
    }

    #[test]
    fn relay_config_defaults_to_active_low_when_omitted() {
        let relay: RelayConfig =
            serde_json::from_str(r#"{"name":"Lamp","tag":"lamp_ui","gpio_pin":5}"#).unwrap();
        assert!(relay.active_low);
        assert_eq!(relay.led_pin, None);
    }
}
