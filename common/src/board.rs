use serde::{Deserialize, Serialize};

use crate::error::HalError;

/// One configured LED output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedSlot {
    pub pin: u8,
    /// Level that turns the LED on.
    pub active_high: bool,
    pub pwm_enabled: bool,
    pub pwm_frequency_hz: u32,
    pub pwm_resolution_bits: u8,
}

/// One configured relay output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelaySlot {
    pub pin: u8,
    pub active_high: bool,
    /// Mechanical settling time observed after every state change.
    pub switch_delay_ms: u64,
}

/// One configured servo output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServoSlot {
    pub pin: u8,
    pub pwm_frequency_hz: u32,
    pub min_pulse_us: u32,
    pub max_pulse_us: u32,
    pub max_angle: f32,
}

/// One general-purpose PWM channel with runtime-settable frequency and duty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PwmSlot {
    pub pin: u8,
    pub channel: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    /// DHT-class combined temperature/humidity sensor.
    TemperatureHumidity,
    Rain,
}

impl SensorKind {
    /// Minimum period between two physical reads; reads inside the window
    /// are served from cache.
    pub fn min_period_ms(self) -> u64 {
        match self {
            // DHT-class sensors cap at one read every two seconds.
            Self::TemperatureHumidity => 2_000,
            Self::Rain => 500,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TemperatureHumidity => "temperature_humidity",
            Self::Rain => "rain",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSlot {
    pub kind: SensorKind,
    pub bus_pin: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    pub cpu_freq_mhz: u32,
    pub flash_size_kb: u32,
    pub psram_size_kb: u32,
    pub watchdog_timeout_s: u32,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            cpu_freq_mhz: 160,
            flash_size_kb: 4 * 1024,
            psram_size_kb: 0,
            watchdog_timeout_s: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayConfig {
    pub width: u16,
    pub height: u16,
    pub sda_pin: u8,
    pub scl_pin: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    pub pin: u8,
}

/// Compile-time selected, runtime-immutable description of a concrete board:
/// its capability counts and per-instance parameters. Slot indices are
/// 1-based in the external protocol and 0-based internally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardDescriptor {
    pub name: String,
    pub chip: String,
    pub hardware_version: String,
    pub manufacturer: String,
    pub has_wifi: bool,
    pub has_ethernet: bool,
    pub leds: Vec<LedSlot>,
    pub relays: Vec<RelaySlot>,
    pub servos: Vec<ServoSlot>,
    pub pwms: Vec<PwmSlot>,
    pub sensors: Vec<SensorSlot>,
    pub buttons: Vec<u8>,
    pub system: SystemConfig,
    pub display: Option<DisplayConfig>,
    pub audio: Option<AudioConfig>,
}

impl BoardDescriptor {
    /// The reference four-LED controller board the command table is sized
    /// for: 4 LEDs, 2 relays, 2 servos, 2 PWM channels, DHT + rain sensors.
    pub fn aiot_board_v1() -> Self {
        Self {
            name: "AIoT-Controller".to_string(),
            chip: "esp32s3".to_string(),
            hardware_version: "1.2".to_string(),
            manufacturer: "AIoT Labs".to_string(),
            has_wifi: true,
            has_ethernet: false,
            leds: vec![
                LedSlot {
                    pin: 48,
                    active_high: true,
                    pwm_enabled: true,
                    pwm_frequency_hz: 5_000,
                    pwm_resolution_bits: 8,
                },
                LedSlot {
                    pin: 47,
                    active_high: true,
                    pwm_enabled: true,
                    pwm_frequency_hz: 5_000,
                    pwm_resolution_bits: 8,
                },
                LedSlot {
                    pin: 21,
                    active_high: true,
                    pwm_enabled: false,
                    pwm_frequency_hz: 0,
                    pwm_resolution_bits: 0,
                },
                LedSlot {
                    pin: 14,
                    active_high: false,
                    pwm_enabled: false,
                    pwm_frequency_hz: 0,
                    pwm_resolution_bits: 0,
                },
            ],
            relays: vec![
                RelaySlot {
                    pin: 10,
                    active_high: true,
                    switch_delay_ms: 10,
                },
                RelaySlot {
                    pin: 11,
                    active_high: true,
                    switch_delay_ms: 10,
                },
            ],
            servos: vec![
                ServoSlot {
                    pin: 12,
                    pwm_frequency_hz: 50,
                    min_pulse_us: 500,
                    max_pulse_us: 2_500,
                    max_angle: 180.0,
                },
                ServoSlot {
                    pin: 13,
                    pwm_frequency_hz: 50,
                    min_pulse_us: 500,
                    max_pulse_us: 2_500,
                    max_angle: 180.0,
                },
            ],
            pwms: vec![PwmSlot { pin: 4, channel: 1 }, PwmSlot { pin: 5, channel: 2 }],
            sensors: vec![
                SensorSlot {
                    kind: SensorKind::TemperatureHumidity,
                    bus_pin: 6,
                },
                SensorSlot {
                    kind: SensorKind::Rain,
                    bus_pin: 7,
                },
            ],
            buttons: vec![0],
            system: SystemConfig::default(),
            display: None,
            audio: None,
        }
    }

    /// Every pin may appear in at most one active descriptor.
    pub fn validate(&self) -> Result<(), HalError> {
        let mut seen: Vec<u8> = Vec::new();
        let mut claim = |pin: u8, what: &str| -> Result<(), HalError> {
            if seen.contains(&pin) {
                return Err(HalError::invalid(format!(
                    "pin {pin} claimed twice (second claim: {what})"
                )));
            }
            seen.push(pin);
            Ok(())
        };

        for (i, led) in self.leds.iter().enumerate() {
            claim(led.pin, &format!("led {}", i + 1))?;
            if led.pwm_enabled && (led.pwm_resolution_bits == 0 || led.pwm_frequency_hz == 0) {
                return Err(HalError::invalid(format!(
                    "led {} enables pwm without frequency/resolution",
                    i + 1
                )));
            }
        }
        for (i, relay) in self.relays.iter().enumerate() {
            claim(relay.pin, &format!("relay {}", i + 1))?;
        }
        for (i, servo) in self.servos.iter().enumerate() {
            claim(servo.pin, &format!("servo {}", i + 1))?;
            if servo.pwm_frequency_hz == 0 || servo.pwm_frequency_hz > 1_000_000 {
                return Err(HalError::invalid(format!(
                    "servo {} pwm frequency {} outside 1..=1000000 Hz",
                    i + 1,
                    servo.pwm_frequency_hz
                )));
            }
            if servo.max_pulse_us <= servo.min_pulse_us {
                return Err(HalError::invalid(format!(
                    "servo {} pulse range is empty",
                    i + 1
                )));
            }
            if servo.max_angle <= 0.0 {
                return Err(HalError::invalid(format!(
                    "servo {} max_angle must be positive",
                    i + 1
                )));
            }
        }
        for (i, pwm) in self.pwms.iter().enumerate() {
            claim(pwm.pin, &format!("pwm {}", i + 1))?;
        }
        for (i, sensor) in self.sensors.iter().enumerate() {
            claim(sensor.bus_pin, &format!("sensor {}", i + 1))?;
        }
        for (i, button) in self.buttons.iter().enumerate() {
            claim(*button, &format!("button {}", i + 1))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_board_is_valid() {
        let board = BoardDescriptor::aiot_board_v1();
        board.validate().unwrap();
        assert_eq!(board.leds.len(), 4);
        assert_eq!(board.relays.len(), 2);
        assert_eq!(board.servos.len(), 2);
        assert_eq!(board.pwms.len(), 2);
    }

    #[test]
    fn duplicate_pin_is_rejected() {
        let mut board = BoardDescriptor::aiot_board_v1();
        board.relays[1].pin = board.leds[0].pin;
        let err = board.validate().unwrap_err();
        assert_eq!(err.name(), "INVALID_PARAMETER");
    }

    #[test]
    fn pwm_led_requires_resolution() {
        let mut board = BoardDescriptor::aiot_board_v1();
        board.leds[0].pwm_resolution_bits = 0;
        assert!(board.validate().is_err());
    }

    #[test]
    fn zero_servo_frequency_is_rejected() {
        let mut board = BoardDescriptor::aiot_board_v1();
        board.servos[0].pwm_frequency_hz = 0;
        let err = board.validate().unwrap_err();
        assert_eq!(err.name(), "INVALID_PARAMETER");

        board.servos[0].pwm_frequency_hz = 2_000_000;
        assert!(board.validate().is_err());
    }

    #[test]
    fn dht_cooldown_is_two_seconds() {
        assert_eq!(SensorKind::TemperatureHumidity.min_period_ms(), 2_000);
    }
}
