use std::collections::HashMap;

use crate::bal::{
    self, BoardHal, LED_ONOFF_THRESHOLD, SERVO_PWM_RESOLUTION_BITS,
};
use crate::board::{BoardDescriptor, SensorKind, SystemConfig};
use crate::error::HalError;
use crate::telemetry::SensorCache;

/// PWM resolution used for the general-purpose PWM channels.
pub const PWM_CHANNEL_RESOLUTION_BITS: u8 = 10;

/// The hardware seam under the slot drivers. The esp target drives real
/// GPIO/LEDC peripherals; the host target and tests use [`SoftGpio`].
pub trait GpioBackend: Send {
    fn set_level(&mut self, pin: u8, high: bool);
    fn set_pwm(&mut self, pin: u8, frequency_hz: u32, resolution_bits: u8, duty: u32);
    fn delay_ms(&mut self, ms: u64);
    fn sample_sensor(&mut self, kind: SensorKind, bus_pin: u8) -> Result<f32, HalError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PinState {
    Level(bool),
    Pwm {
        frequency_hz: u32,
        resolution_bits: u8,
        duty: u32,
    },
}

/// In-memory pin registry. Relay settling delays really sleep so callers
/// observe the same timing contract as on hardware.
#[derive(Debug, Default)]
pub struct SoftGpio {
    pins: HashMap<u8, PinState>,
    tick: u64,
}

impl SoftGpio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pin(&self, pin: u8) -> Option<PinState> {
        self.pins.get(&pin).copied()
    }
}

impl GpioBackend for SoftGpio {
    fn set_level(&mut self, pin: u8, high: bool) {
        let _ = self.pins.insert(pin, PinState::Level(high));
    }

    fn set_pwm(&mut self, pin: u8, frequency_hz: u32, resolution_bits: u8, duty: u32) {
        let _ = self.pins.insert(
            pin,
            PinState::Pwm {
                frequency_hz,
                resolution_bits,
                duty,
            },
        );
    }

    fn delay_ms(&mut self, ms: u64) {
        std::thread::sleep(std::time::Duration::from_millis(ms));
    }

    fn sample_sensor(&mut self, kind: SensorKind, _bus_pin: u8) -> Result<f32, HalError> {
        // Synthesized readings stand in for the bit-banged drivers on the
        // host target.
        self.tick = self.tick.wrapping_add(1);
        Ok(match kind {
            SensorKind::TemperatureHumidity => 21.0 + ((self.tick % 8) as f32 * 0.2),
            SensorKind::Rain => ((self.tick % 5) as f32) * 10.0,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAssignment {
    pub channel: u8,
    pub pin: u8,
}

/// Concrete board behind [`BoardHal`], generic over the hardware backend.
/// PWM channels are assigned deterministically from slot index order (LEDs
/// with PWM first, then servos, then PWM slots) so that the same descriptor
/// observes the same hardware resources on every boot.
pub struct SimBoard<G: GpioBackend> {
    descriptor: BoardDescriptor,
    backend: G,
    channels: Vec<ChannelAssignment>,
    sensor_caches: Vec<SensorCache>,
}

impl<G: GpioBackend> SimBoard<G> {
    pub fn new(descriptor: BoardDescriptor, backend: G) -> Result<Self, HalError> {
        descriptor.validate()?;

        let mut channels = Vec::new();
        let mut next = 0_u8;
        for led in &descriptor.leds {
            if led.pwm_enabled {
                channels.push(ChannelAssignment {
                    channel: next,
                    pin: led.pin,
                });
                next += 1;
            }
        }
        for servo in &descriptor.servos {
            channels.push(ChannelAssignment {
                channel: next,
                pin: servo.pin,
            });
            next += 1;
        }
        for pwm in &descriptor.pwms {
            channels.push(ChannelAssignment {
                channel: next,
                pin: pwm.pin,
            });
            next += 1;
        }

        let sensor_caches = descriptor
            .sensors
            .iter()
            .map(|slot| SensorCache::new(slot.kind.min_period_ms()))
            .collect();

        Ok(Self {
            descriptor,
            backend,
            channels,
            sensor_caches,
        })
    }

    pub fn backend(&self) -> &G {
        &self.backend
    }

    pub fn channel_map(&self) -> &[ChannelAssignment] {
        &self.channels
    }
}

impl<G: GpioBackend> BoardHal for SimBoard<G> {
    fn led_control(&mut self, index: usize, on: bool) -> Result<(), HalError> {
        let i = bal::slot_index(index, self.descriptor.leds.len(), "led")?;
        let slot = self.descriptor.leds[i].clone();

        if slot.pwm_enabled {
            let full = (1_u32 << slot.pwm_resolution_bits) - 1;
            let logical = if on { full } else { 0 };
            let duty = if slot.active_high { logical } else { full - logical };
            self.backend
                .set_pwm(slot.pin, slot.pwm_frequency_hz, slot.pwm_resolution_bits, duty);
        } else {
            let level = on == slot.active_high;
            self.backend.set_level(slot.pin, level);
        }
        Ok(())
    }

    fn led_brightness(&mut self, index: usize, level: u8) -> Result<(), HalError> {
        let i = bal::slot_index(index, self.descriptor.leds.len(), "led")?;
        let slot = self.descriptor.leds[i].clone();

        if !slot.pwm_enabled {
            return self.led_control(index, level >= LED_ONOFF_THRESHOLD);
        }

        let full = (1_u32 << slot.pwm_resolution_bits) - 1;
        let logical = bal::led_duty(level, slot.pwm_resolution_bits);
        let duty = if slot.active_high { logical } else { full - logical };
        self.backend
            .set_pwm(slot.pin, slot.pwm_frequency_hz, slot.pwm_resolution_bits, duty);
        Ok(())
    }

    fn relay_control(&mut self, index: usize, on: bool) -> Result<(), HalError> {
        let i = bal::slot_index(index, self.descriptor.relays.len(), "relay")?;
        let slot = self.descriptor.relays[i].clone();

        self.backend.set_level(slot.pin, on == slot.active_high);
        // Callers must see the mechanical settling before the call returns.
        self.backend.delay_ms(slot.switch_delay_ms);
        Ok(())
    }

    fn servo_set_angle(&mut self, index: usize, angle: f32) -> Result<(), HalError> {
        let i = bal::slot_index(index, self.descriptor.servos.len(), "servo")?;
        if !angle.is_finite() || angle < 0.0 {
            return Err(HalError::invalid(format!("servo angle {angle} is negative")));
        }
        let slot = self.descriptor.servos[i].clone();

        let pulse_us = bal::servo_pulse_us(&slot, angle);
        let duty = bal::servo_duty(pulse_us, slot.pwm_frequency_hz);
        self.backend.set_pwm(
            slot.pin,
            slot.pwm_frequency_hz,
            SERVO_PWM_RESOLUTION_BITS,
            duty,
        );
        Ok(())
    }

    fn pwm_set(
        &mut self,
        channel: usize,
        frequency_hz: u32,
        duty_pct: f32,
    ) -> Result<(), HalError> {
        let i = bal::slot_index(channel, self.descriptor.pwms.len(), "pwm channel")?;
        bal::validate_pwm(frequency_hz, duty_pct)?;
        let slot = self.descriptor.pwms[i].clone();

        let full = (1_u32 << PWM_CHANNEL_RESOLUTION_BITS) - 1;
        let duty = ((duty_pct / 100.0) * full as f32).round() as u32;
        self.backend
            .set_pwm(slot.pin, frequency_hz, PWM_CHANNEL_RESOLUTION_BITS, duty);
        Ok(())
    }

    fn sensor_read(&mut self, id: usize, now_ms: u64) -> Result<f32, HalError> {
        let i = bal::slot_index(id, self.descriptor.sensors.len(), "sensor")?;
        let slot = self.descriptor.sensors[i].clone();
        let backend = &mut self.backend;
        self.sensor_caches[i]
            .read_through(now_ms, || backend.sample_sensor(slot.kind, slot.bus_pin))
    }

    fn board_info(&self) -> &BoardDescriptor {
        &self.descriptor
    }
}

impl<G: GpioBackend> SimBoard<G> {
    pub fn hw_config(&self) -> &SystemConfig {
        &self.descriptor.system
    }
}
