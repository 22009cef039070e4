//! Per-channel meter readings delivered to host callbacks.

/// Levels for a single audio channel.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ChannelLevel {
    pub magnitude: f32,
    pub peak: f32,
    pub input_peak: f32,
}

/// One reading of a meter: a (magnitude, peak, input peak) triple per channel.
///
/// The three vectors always have the same length. The channel count comes
/// from each reply and may change between readings when the attached
/// source changes its layout.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MeterLevels {
    pub magnitude: Vec<f32>,
    pub peak: Vec<f32>,
    pub input_peak: Vec<f32>,
}

impl MeterLevels {
    /// Create a reading with `channels` zeroed entries.
    pub fn with_channels(channels: usize) -> Self {
        Self {
            magnitude: vec![0.0; channels],
            peak: vec![0.0; channels],
            input_peak: vec![0.0; channels],
        }
    }

    pub fn channels(&self) -> usize {
        self.magnitude.len()
    }

    pub fn is_empty(&self) -> bool {
        self.magnitude.is_empty()
    }

    pub fn channel(&self, index: usize) -> Option<ChannelLevel> {
        Some(ChannelLevel {
            magnitude: *self.magnitude.get(index)?,
            peak: *self.peak.get(index)?,
            input_peak: *self.input_peak.get(index)?,
        })
    }

    pub fn set_channel(&mut self, index: usize, level: ChannelLevel) {
        self.magnitude[index] = level.magnitude;
        self.peak[index] = level.peak;
        self.input_peak[index] = level.input_peak;
    }

    pub fn iter(&self) -> impl Iterator<Item = ChannelLevel> + '_ {
        (0..self.channels()).filter_map(move |i| self.channel(i))
    }
}

impl FromIterator<ChannelLevel> for MeterLevels {
    fn from_iter<I: IntoIterator<Item = ChannelLevel>>(iter: I) -> Self {
        let mut levels = MeterLevels::default();
        for level in iter {
            levels.magnitude.push(level.magnitude);
            levels.peak.push(level.peak);
            levels.input_peak.push(level.input_peak);
        }
        levels
    }
}
