//! Waveform generator planning.
//!
//! The generator plays `size` samples of a buffer at one sample every
//! `clock` generator ticks, with the wavetable translated into the buffer
//! `nwaves` times. [`GeneratorPlan::search`] picks the integer clock and
//! buffer fill that best approximate a target frequency.

use std::str::FromStr;

use crate::command::{Command, KitchenSinkB, Register, Transaction};
use crate::profile::HardwareProfile;

#[derive(Debug, thiserror::Error)]
pub enum GeneratorConfigError {
    #[error("No solution to required frequency/min_samples/max_error")]
    NoSolution,

    #[error("Wavetable data must be {expected} samples, got {actual}")]
    WavetableSize { expected: usize, actual: usize },

    #[error("Unknown waveform '{0}'")]
    UnknownWaveform(String),

    #[error("Invalid generator frequency {0}")]
    InvalidFrequency(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waveform {
    Sine,
    Triangle,
    Sawtooth,
    Exponential,
    Square,
}

impl Waveform {
    /// Synthesizer mode that builds this shape in the wavetable.
    pub fn synth_mode(self) -> u32 {
        match self {
            Waveform::Sine => 0,
            Waveform::Triangle | Waveform::Sawtooth => 1,
            Waveform::Exponential => 2,
            Waveform::Square => 3,
        }
    }
}

impl FromStr for Waveform {
    type Err = GeneratorConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sine" => Ok(Waveform::Sine),
            "triangle" => Ok(Waveform::Triangle),
            "sawtooth" => Ok(Waveform::Sawtooth),
            "exponential" => Ok(Waveform::Exponential),
            "square" => Ok(Waveform::Square),
            _ => Err(GeneratorConfigError::UnknownWaveform(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WaveSource {
    Shape(Waveform),
    /// One period of samples, exactly the profile's wavetable size.
    Table(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorRequest {
    pub frequency: f64,
    pub source: WaveSource,
    /// Duty ratio for synthesized shapes.
    pub ratio: f64,
    /// Peak-to-peak voltage, the profile maximum when unset.
    pub vpp: Option<f64>,
    pub offset: f64,
    pub min_samples: usize,
    pub max_error: f64,
}

impl GeneratorRequest {
    pub fn new(frequency: f64) -> Self {
        Self {
            frequency,
            source: WaveSource::Shape(Waveform::Sine),
            ratio: 0.5,
            vpp: None,
            offset: 0.0,
            min_samples: 50,
            max_error: 1e-4,
        }
    }

    pub fn with_waveform(mut self, waveform: Waveform) -> Self {
        self.source = WaveSource::Shape(waveform);
        self
    }

    pub fn with_wavetable(mut self, table: Vec<u8>) -> Self {
        self.source = WaveSource::Table(table);
        self
    }

    pub fn with_ratio(mut self, ratio: f64) -> Self {
        self.ratio = ratio;
        self
    }

    pub fn with_vpp(mut self, vpp: f64) -> Self {
        self.vpp = Some(vpp);
        self
    }

    pub fn with_offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_min_samples(mut self, min_samples: usize) -> Self {
        self.min_samples = min_samples;
        self
    }

    pub fn with_max_error(mut self, max_error: f64) -> Self {
        self.max_error = max_error;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeneratorPlan {
    /// Generator ticks per buffer sample.
    pub clock: u32,
    /// Buffer samples played before wrapping.
    pub size: usize,
    /// Whole periods in the buffer.
    pub nwaves: usize,
    /// Buffer samples per period.
    pub width: f64,
    /// Frequency the plan actually produces.
    pub frequency: f64,
}

impl GeneratorPlan {
    /// Best clock/buffer fill for `frequency`.
    ///
    /// Candidates within `max_error` are ranked by exactness first, then by
    /// samples per period.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn search(
        frequency: f64,
        min_samples: usize,
        max_error: f64,
        profile: &HardwareProfile,
    ) -> Result<Self, GeneratorConfigError> {
        if !frequency.is_finite() || frequency <= 0.0 {
            return Err(GeneratorConfigError::InvalidFrequency(frequency));
        }
        let buffer = profile.awg_sample_buffer_size as f64;
        let max_clock = (1.0 / frequency / min_samples.max(1) as f64 / profile.awg_clock_period)
            .round()
            .min(f64::from(u32::MAX)) as u32;

        let mut best: Option<(bool, Self)> = None;
        for clock in profile.awg_minimum_clock.max(1)..=max_clock {
            let width = 1.0 / frequency / (f64::from(clock) * profile.awg_clock_period);
            if width > buffer {
                continue;
            }
            let nwaves = (buffer / width) as usize;
            let size = (nwaves as f64 * width).round() as usize;
            let width = size as f64 / nwaves as f64;
            let actual = 1.0 / (width * f64::from(clock) * profile.awg_clock_period);
            let error = (frequency - actual).abs() / frequency;
            let exact = error == 0.0;
            if !(error < max_error || exact) {
                continue;
            }
            let candidate = Self {
                clock,
                size,
                nwaves,
                width,
                frequency: actual,
            };
            if best
                .as_ref()
                .is_none_or(|(best_exact, plan)| candidate.outranks(exact, plan, *best_exact))
            {
                best = Some((exact, candidate));
            }
        }

        let (_, plan) = best.ok_or(GeneratorConfigError::NoSolution)?;
        log::debug!(
            "Generator plan for {} Hz: clock {}, {} samples, {} waves, {} Hz",
            frequency,
            plan.clock,
            plan.size,
            plan.nwaves,
            plan.frequency
        );
        Ok(plan)
    }

    fn outranks(&self, exact: bool, other: &Self, other_exact: bool) -> bool {
        (exact, self.width, self.size, self.nwaves, self.clock)
            .partial_cmp(&(other_exact, other.width, other.size, other.nwaves, other.clock))
            .is_some_and(std::cmp::Ordering::is_gt)
    }

    /// Validate the request and plan it.
    pub fn for_request(
        request: &GeneratorRequest,
        profile: &HardwareProfile,
    ) -> Result<Self, GeneratorConfigError> {
        if let WaveSource::Table(table) = &request.source {
            if table.len() != profile.awg_wavetable_size {
                return Err(GeneratorConfigError::WavetableSize {
                    expected: profile.awg_wavetable_size,
                    actual: table.len(),
                });
            }
        }
        Self::search(
            request.frequency,
            request.min_samples,
            request.max_error,
            profile,
        )
    }

    /// Load the wavetable, translate it into the sample buffer and start
    /// the generator.
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn transaction(&self, request: &GeneratorRequest, profile: &HardwareProfile) -> Transaction {
        let max_voltage = profile.awg_maximum_voltage;
        let vpp = request.vpp.unwrap_or(max_voltage);

        let tx = match &request.source {
            WaveSource::Shape(waveform) => Transaction::new()
                .set(Register::Cmd, 0u32)
                .set(Register::Mode, waveform.synth_mode())
                .set(Register::Ratio, request.ratio)
                .issue(Command::SynthesizeWavetable),
            WaveSource::Table(table) => Transaction::new()
                .set(Register::Cmd, 0u32)
                .set(Register::Mode, 1u32)
                .set(Register::Address, 0u32)
                .set(Register::Size, 1u32)
                .write_wavetable(table.clone()),
        };

        tx.set(Register::Cmd, 0u32)
            .set(Register::Mode, 0u32)
            .set(Register::Level, vpp / max_voltage)
            .set(Register::Offset, 2.0 * request.offset / max_voltage)
            .set(
                Register::Ratio,
                (self.nwaves * profile.awg_wavetable_size) as f64 / self.size as f64,
            )
            .set(Register::Index, 0u32)
            .set(Register::Address, 0u32)
            .set(Register::Size, self.size as u32)
            .issue(Command::TranslateWavetable)
            .set(Register::Cmd, 2u32)
            .set(Register::Mode, 0u32)
            .set(Register::Clock, self.clock)
            .set(Register::Modulo, self.size as u32)
            .set(Register::Mark, 10u32)
            .set(Register::Space, 1u32)
            .set(Register::Rest, 0x7f00u32)
            .set(Register::WaveOption, 0x8004u32)
            .issue(Command::ControlWaveformGenerator)
            .set(Register::KitchenSinkB, KitchenSinkB::WAVEFORM_GENERATOR_ENABLE)
            .issue(Command::ConfigureDeviceHardware)
            .issue(Command::Raw(b'.'))
    }
}

pub fn stop_transaction() -> Transaction {
    Transaction::new()
        .set(Register::Cmd, 1u32)
        .set(Register::Mode, 0u32)
        .issue(Command::ControlWaveformGenerator)
        .set(Register::KitchenSinkB, KitchenSinkB::empty())
        .issue(Command::ConfigureDeviceHardware)
}

/// Ask for the whole wavetable; the device answers with raw bytes.
#[allow(clippy::cast_possible_truncation)]
pub fn read_wavetable_transaction(profile: &HardwareProfile) -> Transaction {
    Transaction::new()
        .set(Register::Address, 0u32)
        .set(Register::Size, profile.awg_wavetable_size as u32)
        .issue(Command::ReadWavetable)
}
