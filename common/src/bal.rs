use crate::board::{BoardDescriptor, ServoSlot};
use crate::error::HalError;

/// PWM resolution used for servo outputs on every board.
pub const SERVO_PWM_RESOLUTION_BITS: u8 = 13;

/// Brightness values at or above this threshold count as "on" for LEDs
/// without PWM support.
pub const LED_ONOFF_THRESHOLD: u8 = 128;

/// The single polymorphic surface between the control plane and a concrete
/// board. Indices are 1-based; out-of-range indices yield `InvalidParameter`
/// and capabilities the board lacks yield `NotSupported`. Implementations
/// must never panic on bad input.
pub trait BoardHal: Send {
    fn led_control(&mut self, index: usize, on: bool) -> Result<(), HalError>;
    fn led_brightness(&mut self, index: usize, level: u8) -> Result<(), HalError>;
    fn relay_control(&mut self, index: usize, on: bool) -> Result<(), HalError>;
    fn servo_set_angle(&mut self, index: usize, angle: f32) -> Result<(), HalError>;
    fn pwm_set(&mut self, channel: usize, frequency_hz: u32, duty_pct: f32)
        -> Result<(), HalError>;
    fn sensor_read(&mut self, id: usize, now_ms: u64) -> Result<f32, HalError>;
    fn board_info(&self) -> &BoardDescriptor;
}

/// Resolves a 1-based protocol index against a capability count.
pub fn slot_index(index: usize, count: usize, what: &str) -> Result<usize, HalError> {
    if count == 0 {
        return Err(HalError::NotSupported(format!("board has no {what}s")));
    }
    if index == 0 || index > count {
        return Err(HalError::invalid(format!(
            "{what} index {index} out of range 1..={count}"
        )));
    }
    Ok(index - 1)
}

/// Linear scale of an 8-bit brightness into the slot's PWM resolution.
/// 255 maps exactly onto full scale.
pub fn led_duty(level: u8, resolution_bits: u8) -> u32 {
    let full = (1_u32 << resolution_bits) - 1;
    ((level as u64 * full as u64) / 255) as u32
}

/// Angle to pulse width. Angles above `max_angle` clamp; `angle = 0`
/// produces exactly `min_pulse_us`.
pub fn servo_pulse_us(slot: &ServoSlot, angle: f32) -> u32 {
    let angle = angle.clamp(0.0, slot.max_angle);
    let span = (slot.max_pulse_us - slot.min_pulse_us) as f32;
    slot.min_pulse_us + (angle / slot.max_angle * span).round() as u32
}

/// Pulse width to PWM duty ticks at the servo's fixed 13-bit resolution:
/// `pulse_us / (1_000_000 / frequency) * (2^13 - 1)`.
pub fn servo_duty(pulse_us: u32, frequency_hz: u32) -> u32 {
    let full = (1_u32 << SERVO_PWM_RESOLUTION_BITS) - 1;
    let period_us = 1_000_000 / frequency_hz;
    ((pulse_us as u64 * full as u64) / period_us as u64) as u32
}

pub const PWM_FREQ_MIN_HZ: u32 = 1;
pub const PWM_FREQ_MAX_HZ: u32 = 40_000;

pub fn validate_pwm(frequency_hz: u32, duty_pct: f32) -> Result<(), HalError> {
    if !(PWM_FREQ_MIN_HZ..=PWM_FREQ_MAX_HZ).contains(&frequency_hz) {
        return Err(HalError::invalid(format!(
            "pwm frequency {frequency_hz} outside {PWM_FREQ_MIN_HZ}..={PWM_FREQ_MAX_HZ} Hz"
        )));
    }
    if !duty_pct.is_finite() || !(0.0..=100.0).contains(&duty_pct) {
        return Err(HalError::invalid(format!(
            "pwm duty {duty_pct} outside 0.0..=100.0 %"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::BoardDescriptor;

    fn servo() -> ServoSlot {
        BoardDescriptor::aiot_board_v1().servos[0].clone()
    }

    #[test]
    fn slot_index_is_one_based() {
        assert_eq!(slot_index(1, 4, "led").unwrap(), 0);
        assert_eq!(slot_index(4, 4, "led").unwrap(), 3);
        assert!(matches!(
            slot_index(0, 4, "led"),
            Err(HalError::InvalidParameter(_))
        ));
        assert!(matches!(
            slot_index(5, 4, "led"),
            Err(HalError::InvalidParameter(_))
        ));
        assert!(matches!(
            slot_index(1, 0, "servo"),
            Err(HalError::NotSupported(_))
        ));
    }

    #[test]
    fn led_duty_scales_linearly() {
        assert_eq!(led_duty(0, 8), 0);
        assert_eq!(led_duty(255, 8), 255);
        assert_eq!(led_duty(255, 13), 8_191);
        assert_eq!(led_duty(200, 8), 200);
        // 200/255 of a 13-bit full scale
        assert_eq!(led_duty(200, 13), (200_u64 * 8_191 / 255) as u32);
    }

    #[test]
    fn servo_zero_angle_is_min_pulse() {
        let slot = servo();
        assert_eq!(servo_pulse_us(&slot, 0.0), slot.min_pulse_us);
    }

    #[test]
    fn servo_angle_clamps_to_max() {
        let slot = servo();
        let clamped = servo_pulse_us(&slot, 275.0);
        assert_eq!(clamped, slot.max_pulse_us);
        assert_eq!(clamped, servo_pulse_us(&slot, slot.max_angle));
    }

    #[test]
    fn servo_pulse_is_affine() {
        let slot = servo();
        let mid = servo_pulse_us(&slot, slot.max_angle / 2.0);
        assert_eq!(mid, (slot.min_pulse_us + slot.max_pulse_us) / 2);
    }

    #[test]
    fn servo_duty_uses_13_bits() {
        // 1500us pulse in a 20ms period: 1500/20000 of 8191 ticks.
        let duty = servo_duty(1_500, 50);
        assert_eq!(duty, (1_500_u64 * 8_191 / 20_000) as u32);
    }

    #[test]
    fn pwm_bounds_are_enforced() {
        assert!(validate_pwm(1, 0.0).is_ok());
        assert!(validate_pwm(40_000, 100.0).is_ok());
        assert!(validate_pwm(0, 50.0).is_err());
        assert!(validate_pwm(40_001, 50.0).is_err());
        assert!(validate_pwm(1_000, -0.1).is_err());
        assert!(validate_pwm(1_000, 100.1).is_err());
        assert!(validate_pwm(1_000, f32::NAN).is_err());
    }
}
