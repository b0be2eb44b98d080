//! Command-plane message decoding and dispatch into the board HAL.

use serde::Serialize;
use serde_json::Value;

use crate::bal::BoardHal;
use crate::error::HalError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LedAction {
    On,
    Off,
    Brightness(u8),
}

/// A decoded command message. `device_id` fields carry the wire protocol's
/// 1-based peripheral index, not the backend device identity.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Led {
        device_id: usize,
        action: LedAction,
    },
    Relay {
        device_id: usize,
        on: bool,
    },
    Servo {
        device_id: usize,
        angle: f32,
    },
    Pwm {
        channel: usize,
        frequency_hz: u32,
        duty_pct: f32,
    },
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Led { .. } => "led",
            Self::Relay { .. } => "relay",
            Self::Servo { .. } => "servo",
            Self::Pwm { .. } => "pwm",
        }
    }

    /// Index echoed back in the result message.
    pub fn target(&self) -> usize {
        match self {
            Self::Led { device_id, .. }
            | Self::Relay { device_id, .. }
            | Self::Servo { device_id, .. } => *device_id,
            Self::Pwm { channel, .. } => *channel,
        }
    }

    /// Whether executing this command needs an out-of-range clamp. Used by
    /// the dispatcher to log a warning before dispatch.
    pub fn clamp_note(&self) -> Option<String> {
        match self {
            Self::Servo { angle, .. } if *angle > 180.0 => {
                Some(format!("servo angle {angle} above 180, clamping"))
            }
            _ => None,
        }
    }

    pub fn execute(&self, hal: &mut dyn BoardHal) -> Result<(), HalError> {
        match *self {
            Self::Led {
                device_id,
                action: LedAction::On,
            } => hal.led_control(device_id, true),
            Self::Led {
                device_id,
                action: LedAction::Off,
            } => hal.led_control(device_id, false),
            Self::Led {
                device_id,
                action: LedAction::Brightness(level),
            } => hal.led_brightness(device_id, level),
            Self::Relay { device_id, on } => hal.relay_control(device_id, on),
            Self::Servo { device_id, angle } => hal.servo_set_angle(device_id, angle),
            Self::Pwm {
                channel,
                frequency_hz,
                duty_pct,
            } => hal.pwm_set(channel, frequency_hz, duty_pct),
        }
    }
}

fn field<'a>(object: &'a Value, name: &str) -> Result<&'a Value, HalError> {
    object
        .get(name)
        .ok_or_else(|| HalError::invalid(format!("missing field `{name}`")))
}

fn index_field(object: &Value, name: &str) -> Result<usize, HalError> {
    field(object, name)?
        .as_u64()
        .map(|value| value as usize)
        .ok_or_else(|| HalError::invalid(format!("field `{name}` must be a non-negative integer")))
}

fn number_field(object: &Value, name: &str) -> Result<f64, HalError> {
    let value = field(object, name)?
        .as_f64()
        .ok_or_else(|| HalError::invalid(format!("field `{name}` must be a number")))?;
    if !value.is_finite() {
        return Err(HalError::invalid(format!("field `{name}` is not finite")));
    }
    Ok(value)
}

fn str_field<'a>(object: &'a Value, name: &str) -> Result<&'a str, HalError> {
    field(object, name)?
        .as_str()
        .ok_or_else(|| HalError::invalid(format!("field `{name}` must be a string")))
}

fn on_off(raw: &str, name: &str) -> Result<bool, HalError> {
    match raw {
        "on" => Ok(true),
        "off" => Ok(false),
        other => Err(HalError::invalid(format!(
            "field `{name}` must be `on` or `off`, got `{other}`"
        ))),
    }
}

/// Decodes one command payload. Unknown `cmd` values map to `NotFound`,
/// everything else that is wrong maps to `InvalidParameter`.
pub fn decode(payload: &[u8]) -> Result<Command, HalError> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|err| HalError::invalid(format!("payload is not valid json: {err}")))?;
    if !value.is_object() {
        return Err(HalError::invalid("payload must be a json object"));
    }

    let cmd = str_field(&value, "cmd")?;
    match cmd {
        "led" => {
            let device_id = index_field(&value, "device_id")?;
            let action = match str_field(&value, "action")? {
                "on" => LedAction::On,
                "off" => LedAction::Off,
                "brightness" => {
                    let raw = index_field(&value, "brightness")?;
                    let level = u8::try_from(raw).map_err(|_| {
                        HalError::invalid(format!("brightness {raw} outside 0..=255"))
                    })?;
                    LedAction::Brightness(level)
                }
                other => {
                    return Err(HalError::invalid(format!("unknown led action `{other}`")));
                }
            };
            Ok(Command::Led { device_id, action })
        }
        "relay" => Ok(Command::Relay {
            device_id: index_field(&value, "device_id")?,
            on: on_off(str_field(&value, "action")?, "action")?,
        }),
        "servo" => {
            let angle = number_field(&value, "angle")? as f32;
            if angle < 0.0 {
                return Err(HalError::invalid(format!("servo angle {angle} is negative")));
            }
            Ok(Command::Servo {
                device_id: index_field(&value, "device_id")?,
                angle,
            })
        }
        "pwm" => {
            let frequency = index_field(&value, "frequency")?;
            let frequency_hz = u32::try_from(frequency)
                .map_err(|_| HalError::invalid(format!("frequency {frequency} out of range")))?;
            Ok(Command::Pwm {
                channel: index_field(&value, "channel")?,
                frequency_hz,
                duty_pct: number_field(&value, "duty_cycle")? as f32,
            })
        }
        other => Err(HalError::not_found(format!("unknown command `{other}`"))),
    }
}

/// Best-effort result published on the result topic after each dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    pub kind: String,
    pub device_id: usize,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    pub fn from_outcome(command: &Command, outcome: &Result<(), HalError>) -> Self {
        Self {
            kind: command.kind().to_string(),
            device_id: command.target(),
            success: outcome.is_ok(),
            error: outcome.as_ref().err().map(|err| err.name().to_string()),
        }
    }

    /// Failure result for a payload that would not decode. Returns `None`
    /// when the payload does not carry enough to address a result (`cmd`
    /// plus a `device_id` or `channel`); such messages are only logged.
    pub fn from_decode_failure(payload: &[u8], err: &HalError) -> Option<Self> {
        let value: Value = serde_json::from_slice(payload).ok()?;
        let kind = value.get("cmd")?.as_str()?.to_string();
        let device_id = value
            .get("device_id")
            .or_else(|| value.get("channel"))?
            .as_u64()? as usize;
        Some(Self {
            kind,
            device_id,
            success: false,
            error: Some(err.name().to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::BoardDescriptor;
    use crate::drivers::{SimBoard, SoftGpio};
    use pretty_assertions::assert_eq;

    fn board() -> SimBoard<SoftGpio> {
        SimBoard::new(BoardDescriptor::aiot_board_v1(), SoftGpio::new()).unwrap()
    }

    #[test]
    fn led_brightness_decodes() {
        let command =
            decode(br#"{"cmd":"led","device_id":1,"action":"brightness","brightness":200}"#)
                .unwrap();
        assert_eq!(
            command,
            Command::Led {
                device_id: 1,
                action: LedAction::Brightness(200)
            }
        );
    }

    #[test]
    fn relay_action_decodes() {
        let command = decode(br#"{"cmd":"relay","device_id":2,"action":"off"}"#).unwrap();
        assert_eq!(
            command,
            Command::Relay {
                device_id: 2,
                on: false
            }
        );

        let command = decode(br#"{"cmd":"relay","device_id":1,"action":"on"}"#).unwrap();
        assert_eq!(
            command,
            Command::Relay {
                device_id: 1,
                on: true
            }
        );
    }

    #[test]
    fn relay_without_action_field_is_invalid() {
        let err = decode(br#"{"cmd":"relay","device_id":2,"state":"off"}"#).unwrap_err();
        assert!(matches!(err, HalError::InvalidParameter(_)));
    }

    #[test]
    fn unknown_cmd_is_not_found() {
        let err = decode(br#"{"cmd":"blink","device_id":1}"#).unwrap_err();
        assert!(matches!(err, HalError::NotFound(_)));
    }

    #[test]
    fn missing_field_is_invalid() {
        let err = decode(br#"{"cmd":"led","device_id":1}"#).unwrap_err();
        assert!(matches!(err, HalError::InvalidParameter(_)));

        let err = decode(br#"{"device_id":1}"#).unwrap_err();
        assert!(matches!(err, HalError::InvalidParameter(_)));
    }

    #[test]
    fn brightness_out_of_range_is_invalid() {
        let err = decode(br#"{"cmd":"led","device_id":1,"action":"brightness","brightness":300}"#)
            .unwrap_err();
        assert!(matches!(err, HalError::InvalidParameter(_)));
    }

    #[test]
    fn negative_servo_angle_is_invalid() {
        let err = decode(br#"{"cmd":"servo","device_id":1,"angle":-5}"#).unwrap_err();
        assert!(matches!(err, HalError::InvalidParameter(_)));
    }

    #[test]
    fn garbage_payload_is_invalid() {
        assert!(matches!(
            decode(b"not json"),
            Err(HalError::InvalidParameter(_))
        ));
        assert!(matches!(
            decode(b"[1,2,3]"),
            Err(HalError::InvalidParameter(_))
        ));
    }

    #[test]
    fn oversized_servo_angle_decodes_and_notes_clamp() {
        let command = decode(br#"{"cmd":"servo","device_id":1,"angle":275}"#).unwrap();
        assert!(command.clamp_note().is_some());
        let mut hal = board();
        assert!(command.execute(&mut hal).is_ok());
    }

    #[test]
    fn pwm_command_executes_through_hal() {
        let command =
            decode(br#"{"cmd":"pwm","channel":1,"frequency":1000,"duty_cycle":50.0}"#).unwrap();
        let mut hal = board();
        assert!(command.execute(&mut hal).is_ok());
    }

    #[test]
    fn pwm_out_of_range_channel_fails_at_execute() {
        let command =
            decode(br#"{"cmd":"pwm","channel":3,"frequency":1000,"duty_cycle":50}"#).unwrap();
        let mut hal = board();
        let outcome = command.execute(&mut hal);
        assert!(matches!(outcome, Err(HalError::InvalidParameter(_))));

        let result = CommandResult::from_outcome(&command, &outcome);
        assert_eq!(result.kind, "pwm");
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("INVALID_PARAMETER"));
    }

    #[test]
    fn decode_failure_still_yields_addressable_result() {
        let payload = br#"{"cmd":"led","device_id":1}"#;
        let err = decode(payload).unwrap_err();
        let result = CommandResult::from_decode_failure(payload, &err).unwrap();
        assert_eq!(result.kind, "led");
        assert_eq!(result.device_id, 1);
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("INVALID_PARAMETER"));

        let payload = br#"{"cmd":"blink","device_id":2}"#;
        let err = decode(payload).unwrap_err();
        let result = CommandResult::from_decode_failure(payload, &err).unwrap();
        assert_eq!(result.kind, "blink");
        assert_eq!(result.error.as_deref(), Some("NOT_FOUND"));
    }

    #[test]
    fn unaddressable_decode_failure_yields_no_result() {
        let err = decode(b"not json").unwrap_err();
        assert!(CommandResult::from_decode_failure(b"not json", &err).is_none());

        let payload = br#"{"device_id":1}"#;
        let err = decode(payload).unwrap_err();
        assert!(CommandResult::from_decode_failure(payload, &err).is_none());
    }

    #[test]
    fn result_serializes_without_error_on_success() {
        let command = decode(br#"{"cmd":"led","device_id":1,"action":"on"}"#).unwrap();
        let result = CommandResult::from_outcome(&command, &Ok(()));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["kind"], "led");
        assert_eq!(json["device_id"], 1);
        assert_eq!(json["success"], true);
        assert!(json.get("error").is_none());
    }
}
