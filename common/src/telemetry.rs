use serde::Serialize;

use crate::error::HalError;

/// Per-sensor read-through cache. Cheap sensors still have minimum sampling
/// periods (the DHT cannot be polled faster than every 2 s), so reads inside
/// the cooldown window return the last good value instead of touching the
/// bus again.
#[derive(Debug, Clone)]
pub struct SensorCache {
    min_period_ms: u64,
    last_sample_ms: Option<u64>,
    last_value: Option<f32>,
}

impl SensorCache {
    pub fn new(min_period_ms: u64) -> Self {
        Self {
            min_period_ms,
            last_sample_ms: None,
            last_value: None,
        }
    }

    /// Returns the cached value when the cooldown has not elapsed, otherwise
    /// samples through `f` and caches the result. A failed sample does not
    /// overwrite the cache, but the error is surfaced to the caller.
    pub fn read_through<F>(&mut self, now_ms: u64, f: F) -> Result<f32, HalError>
    where
        F: FnOnce() -> Result<f32, HalError>,
    {
        if let (Some(last_ms), Some(value)) = (self.last_sample_ms, self.last_value) {
            if now_ms.saturating_sub(last_ms) < self.min_period_ms {
                return Ok(value);
            }
        }

        let value = f()?;
        self.last_sample_ms = Some(now_ms);
        self.last_value = Some(value);
        Ok(value)
    }
}

/// One reading inside a telemetry report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    pub sensor: String,
    pub index: usize,
    pub value: f32,
}

/// Periodic sensor snapshot published on the telemetry topic. Sensors that
/// failed to read are simply absent from `readings`.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryReport {
    pub device_id: String,
    pub uptime_ms: u64,
    pub readings: Vec<SensorReading>,
}

/// Monotonically increasing heartbeat counter.
#[derive(Debug, Default)]
pub struct Heartbeat {
    seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartbeatPayload {
    pub seq: u64,
    pub uptime_ms: u64,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the counter and yields the payload for this beat.
    pub fn beat(&mut self, uptime_ms: u64) -> HeartbeatPayload {
        self.seq += 1;
        HeartbeatPayload {
            seq: self.seq,
            uptime_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cache_samples_on_first_read() {
        let mut cache = SensorCache::new(2_000);
        let value = cache.read_through(0, || Ok(21.0)).unwrap();
        assert_eq!(value, 21.0);
    }

    #[test]
    fn cache_holds_value_inside_cooldown() {
        let mut cache = SensorCache::new(2_000);
        cache.read_through(0, || Ok(21.0)).unwrap();
        let value = cache
            .read_through(1_999, || panic!("sampled inside cooldown"))
            .unwrap();
        assert_eq!(value, 21.0);
    }

    #[test]
    fn cache_resamples_after_cooldown() {
        let mut cache = SensorCache::new(2_000);
        cache.read_through(0, || Ok(21.0)).unwrap();
        let value = cache.read_through(2_000, || Ok(22.4)).unwrap();
        assert_eq!(value, 22.4);
    }

    #[test]
    fn failed_sample_keeps_previous_cache() {
        let mut cache = SensorCache::new(2_000);
        cache.read_through(0, || Ok(21.0)).unwrap();
        let err = cache.read_through(3_000, || Err(HalError::Timeout("dht".into())));
        assert!(err.is_err());
        // The stale value is still served inside a fresh window measured
        // from the last good sample.
        let value = cache.read_through(1_500, || Ok(99.0)).unwrap();
        assert_eq!(value, 21.0);
    }

    #[test]
    fn heartbeat_sequence_increments() {
        let mut heartbeat = Heartbeat::new();
        assert_eq!(
            heartbeat.beat(10),
            HeartbeatPayload {
                seq: 1,
                uptime_ms: 10
            }
        );
        assert_eq!(
            heartbeat.beat(20),
            HeartbeatPayload {
                seq: 2,
                uptime_ms: 20
            }
        );
    }

    #[test]
    fn telemetry_report_serializes() {
        let report = TelemetryReport {
            device_id: "AIOT_246F28ABCDEF".to_string(),
            uptime_ms: 1_234,
            readings: vec![SensorReading {
                sensor: "temperature_humidity".to_string(),
                index: 1,
                value: 21.5,
            }],
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["device_id"], "AIOT_246F28ABCDEF");
        assert_eq!(json["readings"][0]["sensor"], "temperature_humidity");
    }
}
