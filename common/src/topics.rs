//! Device-scoped MQTT topics, derived from the backend-issued device UUID.

pub const TOPIC_ROOT: &str = "aiot";

pub fn command_topic(device_uuid: &str) -> String {
    format!("{TOPIC_ROOT}/device/{device_uuid}/cmnd")
}

pub fn result_topic(device_uuid: &str) -> String {
    format!("{TOPIC_ROOT}/device/{device_uuid}/result")
}

pub fn sensor_topic(device_uuid: &str) -> String {
    format!("{TOPIC_ROOT}/device/{device_uuid}/sensor")
}

pub fn heartbeat_topic(device_uuid: &str) -> String {
    format!("{TOPIC_ROOT}/device/{device_uuid}/heartbeat")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn topics_are_scoped_by_uuid() {
        assert_eq!(command_topic("U1"), "aiot/device/U1/cmnd");
        assert_eq!(result_topic("U1"), "aiot/device/U1/result");
        assert_eq!(sensor_topic("U1"), "aiot/device/U1/sensor");
        assert_eq!(heartbeat_topic("U1"), "aiot/device/U1/heartbeat");
    }
}
