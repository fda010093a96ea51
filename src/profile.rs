//! Per-model hardware constants.
//!
//! A [`HardwareProfile`] is picked at setup by matching the revision string
//! the device reports against the prefixes in a [`ProfileTable`].

use crate::calibration::AnalogCalibration;

#[derive(Debug, Clone, PartialEq)]
pub struct HardwareProfile {
    /// Waveform generator clock period in seconds.
    pub awg_clock_period: f64,
    pub awg_wavetable_size: usize,
    pub awg_sample_buffer_size: usize,
    pub awg_minimum_clock: u32,
    pub awg_maximum_voltage: f64,
    /// Converter mapping used until a stored or fitted calibration replaces it.
    pub default_calibration: AnalogCalibration,
    pub analog_min: f64,
    pub analog_max: f64,
    /// Capture sample clock period in seconds.
    pub capture_clock_period: f64,
    pub capture_buffer_size: usize,
    /// Duration of one tick of the trigger timeout register.
    pub trigger_timeout_tick: f64,
    pub trigger_low: f64,
    pub trigger_high: f64,
}

impl HardwareProfile {
    /// BitScope Micro (BS05).
    pub fn bitscope_micro() -> Self {
        Self {
            awg_clock_period: 25e-9,
            awg_wavetable_size: 1024,
            awg_sample_buffer_size: 1024,
            awg_minimum_clock: 33,
            awg_maximum_voltage: 3.3,
            default_calibration: AnalogCalibration {
                low: [
                    0.433_070_405_046_725_23,
                    0.060_970_272_170_312_846,
                    -0.003_718_607_255_847_648_7,
                ],
                high: [
                    0.375_752_410_290_614_07,
                    -0.003_930_849_794_232_968_6,
                    0.060_955_881_466_731_247,
                ],
            },
            analog_min: -5.7,
            analog_max: 8.0,
            capture_clock_period: 25e-9,
            capture_buffer_size: 12 * 1024,
            trigger_timeout_tick: 6.4e-6,
            trigger_low: -7.517,
            trigger_high: 10.816,
        }
    }
}

impl Default for HardwareProfile {
    fn default() -> Self {
        Self::bitscope_micro()
    }
}

#[derive(Debug, Clone)]
pub struct ProfileEntry {
    pub prefix: String,
    pub name: String,
    pub profile: HardwareProfile,
}

/// Revision prefix to profile mapping, searched in insertion order.
#[derive(Debug, Clone, Default)]
pub struct ProfileTable {
    entries: Vec<ProfileEntry>,
}

impl ProfileTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every model this crate knows about.
    pub fn builtin() -> Self {
        Self::empty().with_profile("BS0005", "BitScope Micro", HardwareProfile::bitscope_micro())
    }

    pub fn with_profile(
        mut self,
        prefix: impl Into<String>,
        name: impl Into<String>,
        profile: HardwareProfile,
    ) -> Self {
        self.entries.push(ProfileEntry {
            prefix: prefix.into(),
            name: name.into(),
            profile,
        });
        self
    }

    pub fn lookup(&self, revision: &str) -> Option<&ProfileEntry> {
        self.entries
            .iter()
            .find(|entry| revision.starts_with(entry.prefix.as_str()))
    }

    pub fn entries(&self) -> &[ProfileEntry] {
        &self.entries
    }
}
