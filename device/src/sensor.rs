use common::{Result, SensorReading, TimestampUnit};
use rand::Rng;

/// Virtual pins reported by the firmware and the range each one wanders in.
const DEFAULT_CHANNELS: [(&str, f64, f64); 6] = [
    ("V0", 0.0, 14.0),
    ("V1", 15.0, 40.0),
    ("V2", 20.0, 90.0),
    ("V3", 0.0, 100.0),
    ("V4", 900.0, 1100.0),
    ("V5", 0.0, 5.0),
];

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    pub name: String,
    pub min: f64,
    pub max: f64,
}

/// Produces random readings in place of real sensor hardware.
#[derive(Debug, Clone)]
pub struct SimulatedSensor {
    channels: Vec<ChannelSpec>,
    unit: TimestampUnit,
}

impl SimulatedSensor {
    pub fn new(unit: TimestampUnit) -> Self {
        let channels = DEFAULT_CHANNELS
            .iter()
            .map(|(name, min, max)| ChannelSpec {
                name: name.to_string(),
                min: *min,
                max: *max,
            })
            .collect();

        Self { channels, unit }
    }

    pub fn with_channels(channels: Vec<ChannelSpec>, unit: TimestampUnit) -> Self {
        Self { channels, unit }
    }

    pub fn channels(&self) -> &[ChannelSpec] {
        &self.channels
    }

    pub fn read(&self) -> Result<SensorReading> {
        let mut rng = rand::thread_rng();
        let values: Vec<(String, f64)> = self
            .channels
            .iter()
            .map(|channel| {
                let value = if channel.max > channel.min {
                    rng.gen_range(channel.min..channel.max)
                } else {
                    channel.min
                };
                (channel.name.clone(), value)
            })
            .collect();

        SensorReading::stamped_now(values, self.unit)
    }
}
