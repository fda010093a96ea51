//! Capture planning and sample decoding.
//!
//! [`CapturePlan::new`] turns a [`CaptureRequest`] into everything the
//! device needs for one triggered trace: the timing regime, the register
//! transactions, and the decoder for the dumped samples. Planning does no
//! I/O, so configuration errors surface before anything is sent.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use polars::prelude::*;

use crate::calibration::AnalogCalibration;
use crate::command::{
    BufferMode, Command, DumpMode, KitchenSinkB, Register, TraceMode, Transaction,
};
use crate::profile::HardwareProfile;
use crate::trigger_config::{Trigger, TriggerSettings, TriggerType};

const NATIVE_BUFFER_WIDTH: usize = 6 * 1024;
const RAW_BUFFER_WIDTH: usize = 12 * 1024;
/// Fastest tick count the analog-shot trace is accurate at.
const SHOT_MAX_TICKS: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum CaptureConfigError {
    #[error("Unsupported clock period: {ticks} ticks")]
    UnsupportedClockPeriod { ticks: i64 },

    #[error("Trigger channel {channel} is not being captured")]
    InvalidTriggerChannel { channel: Channel },

    #[error("No channels requested")]
    NoChannels,

    #[error("{total} samples do not fit the {buffer} sample buffer")]
    TooManySamples { total: usize, buffer: usize },

    #[error("Unknown channel '{0}'")]
    UnknownChannel(String),

    #[error("Unknown trigger type '{0}'")]
    UnknownTriggerType(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    A,
    B,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::A => "A",
            Channel::B => "B",
        }
    }

    fn enable_bit(self) -> u32 {
        match self {
            Channel::A => 1,
            Channel::B => 2,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = CaptureConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" | "a" => Ok(Channel::A),
            "B" | "b" => Ok(Channel::B),
            _ => Err(CaptureConfigError::UnknownChannel(s.to_string())),
        }
    }
}

/// Parse a channel list such as `"AB"`.
pub fn parse_channels(s: &str) -> Result<Vec<Channel>, CaptureConfigError> {
    s.chars().map(|c| c.to_string().parse()).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    pub channels: Vec<Channel>,
    pub trigger: Trigger,
    /// Length of the capture in seconds.
    pub period: f64,
    pub nsamples: usize,
    /// Trigger timeout in seconds, five periods when unset.
    pub timeout: Option<f64>,
    pub low: Option<f64>,
    pub high: Option<f64>,
    /// Skip the analog calibration and return normalized samples.
    pub raw: bool,
}

impl Default for CaptureRequest {
    fn default() -> Self {
        Self {
            channels: vec![Channel::A],
            trigger: Trigger::default(),
            period: 1e-3,
            nsamples: 1000,
            timeout: None,
            low: None,
            high: None,
            raw: false,
        }
    }
}

impl CaptureRequest {
    pub fn new(channels: &[Channel]) -> Self {
        let mut unique = Vec::with_capacity(channels.len());
        for channel in channels {
            if !unique.contains(channel) {
                unique.push(*channel);
            }
        }
        Self {
            channels: unique,
            ..Self::default()
        }
    }

    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn with_trigger_level(mut self, level: f64) -> Self {
        self.trigger.level = level;
        self
    }

    pub fn with_trigger_type(mut self, trigger_type: TriggerType) -> Self {
        self.trigger.trigger_type = trigger_type;
        self
    }

    pub fn with_period(mut self, period: f64, nsamples: usize) -> Self {
        self.period = period;
        self.nsamples = nsamples;
        self
    }

    pub fn with_timeout(mut self, timeout: f64) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_range(mut self, low: f64, high: f64) -> Self {
        self.low = Some(low);
        self.high = Some(high);
        self
    }

    pub fn raw(mut self) -> Self {
        self.raw = true;
        self
    }
}

/// Capture timing regimes, by tick count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingRegime {
    /// 40..65536 ticks, 16-bit samples.
    Macro,
    /// 15..40 ticks.
    Analog,
    /// 8..15 ticks.
    AnalogFast,
    /// 2..8 ticks, run at no more than 5 ticks.
    AnalogShot,
}

impl TimingRegime {
    pub fn for_ticks(ticks: i64) -> Option<Self> {
        match ticks {
            40..=65535 => Some(TimingRegime::Macro),
            15..=39 => Some(TimingRegime::Analog),
            8..=14 => Some(TimingRegime::AnalogFast),
            2..=7 => Some(TimingRegime::AnalogShot),
            _ => None,
        }
    }

    /// Bytes per dumped sample.
    pub fn sample_width(self) -> usize {
        match self {
            TimingRegime::Macro => 2,
            _ => 1,
        }
    }

    /// Samples the capture buffer holds in this regime.
    pub fn buffer_width(self) -> usize {
        match self {
            TimingRegime::Macro => NATIVE_BUFFER_WIDTH,
            _ => RAW_BUFFER_WIDTH,
        }
    }

    pub fn dump_mode(self) -> DumpMode {
        match self {
            TimingRegime::Macro => DumpMode::Native,
            _ => DumpMode::Raw,
        }
    }

    pub fn trace_mode(self, dual: bool) -> TraceMode {
        match (self, dual) {
            (TimingRegime::Macro, false) => TraceMode::Macro,
            (TimingRegime::Macro, true) => TraceMode::MacroChop,
            (TimingRegime::Analog, false) => TraceMode::Analog,
            (TimingRegime::Analog, true) => TraceMode::AnalogChop,
            (TimingRegime::AnalogFast, false) => TraceMode::AnalogFast,
            (TimingRegime::AnalogFast, true) => TraceMode::AnalogFastChop,
            (TimingRegime::AnalogShot, false) => TraceMode::AnalogShot,
            (TimingRegime::AnalogShot, true) => TraceMode::AnalogShotChop,
        }
    }

    pub fn buffer_mode(self, dual: bool) -> BufferMode {
        match (self, dual) {
            (TimingRegime::Macro, false) => BufferMode::Macro,
            (TimingRegime::Macro, true) => BufferMode::MacroChop,
            (_, false) => BufferMode::Single,
            (_, true) => BufferMode::Chop,
        }
    }
}

/// Register configuration and decoder for one capture.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturePlan {
    /// Captured channels sorted by name, which is also the dump order.
    pub channels: Vec<Channel>,
    pub multiplier: usize,
    pub regime: TimingRegime,
    pub ticks: u32,
    /// Samples per channel.
    pub nsamples: usize,
    pub low: f64,
    pub high: f64,
    pub raw: bool,
    pub trigger: TriggerSettings,
    pub converter_lo: f64,
    pub converter_hi: f64,
    /// Trigger timeout in device ticks.
    pub timeout: u32,
}

impl CapturePlan {
    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn new(
        request: &CaptureRequest,
        profile: &HardwareProfile,
        calibration: &AnalogCalibration,
    ) -> Result<Self, CaptureConfigError> {
        let mut channels = request.channels.clone();
        channels.sort();
        channels.dedup();
        if channels.is_empty() {
            return Err(CaptureConfigError::NoChannels);
        }
        let multiplier = channels.len();

        let ticks = (request.period
            / request.nsamples as f64
            / multiplier as f64
            / profile.capture_clock_period)
            .floor() as i64;
        let regime = TimingRegime::for_ticks(ticks)
            .ok_or(CaptureConfigError::UnsupportedClockPeriod { ticks })?;
        let mut ticks = ticks as u32;
        if regime == TimingRegime::AnalogShot {
            ticks = ticks.min(SHOT_MAX_TICKS);
        }

        let nsamples = (request.period
            / f64::from(ticks)
            / multiplier as f64
            / profile.capture_clock_period)
            .round() as usize;
        let total = nsamples * multiplier;
        if total > regime.buffer_width() {
            return Err(CaptureConfigError::TooManySamples {
                total,
                buffer: regime.buffer_width(),
            });
        }

        let (default_low, default_high) = if request.raw {
            (0.0, 1.0)
        } else {
            (profile.analog_min, profile.analog_max)
        };
        let low = request.low.unwrap_or(default_low);
        let high = request.high.unwrap_or(default_high);

        let trigger = TriggerSettings::encode(&request.trigger, &request.channels, request.raw, profile)?;

        let (converter_lo, converter_hi) = if request.raw {
            (low, high)
        } else {
            (calibration.converter_lo(low, high), calibration.converter_hi(low, high))
        };

        let timeout = (request.timeout.unwrap_or(request.period * 5.0) / profile.trigger_timeout_tick)
            .round() as u32;

        log::debug!(
            "Capture plan: {:?} regime, {} ticks, {} samples x {}",
            regime,
            ticks,
            nsamples,
            multiplier
        );

        Ok(Self {
            channels,
            multiplier,
            regime,
            ticks,
            nsamples,
            low,
            high,
            raw: request.raw,
            trigger,
            converter_lo,
            converter_hi,
            timeout,
        })
    }

    fn is_dual(&self) -> bool {
        self.multiplier == 2
    }

    /// Samples over all channels.
    pub fn total_samples(&self) -> usize {
        self.nsamples * self.multiplier
    }

    pub fn sample_width(&self) -> usize {
        self.regime.sample_width()
    }

    /// Bytes dumped per channel.
    pub fn dump_len(&self) -> usize {
        self.nsamples * self.sample_width()
    }

    pub fn analog_enable(&self) -> u32 {
        self.channels
            .iter()
            .fold(0, |mask, channel| mask | channel.enable_bit())
    }

    /// Configure the hardware and start the triggered trace.
    #[allow(clippy::cast_possible_truncation)]
    pub fn arm_transaction(&self) -> Transaction {
        let half = (self.total_samples() / 2) as u32;
        Transaction::new()
            .set(Register::TraceMode, self.regime.trace_mode(self.is_dual()))
            .set(Register::ClockTicks, self.ticks)
            .set(Register::ClockScale, 1u32)
            .set(Register::TraceIntro, half)
            .set(Register::TraceOutro, half)
            .set(Register::TraceDelay, 0u32)
            .set(Register::Timeout, self.timeout)
            .set(Register::TriggerMask, 0x7fu32)
            .set(Register::TriggerLogic, 0x80u32)
            .set(Register::TriggerLevel, self.trigger.level)
            .set(Register::TriggerIntro, self.trigger.intro)
            .set(Register::TriggerOutro, 4u32)
            .set(Register::SpockOption, self.trigger.spock_option)
            .set(Register::Prelude, 0u32)
            .set(Register::ConverterLo, self.converter_lo)
            .set(Register::ConverterHi, self.converter_hi)
            .set(Register::KitchenSinkA, self.trigger.kitchen_sink_a)
            .set(
                Register::KitchenSinkB,
                KitchenSinkB::ANALOG_FILTER_ENABLE | KitchenSinkB::WAVEFORM_GENERATOR_ENABLE,
            )
            .set(Register::AnalogEnable, self.analog_enable())
            .set(Register::BufferMode, self.regime.buffer_mode(self.is_dual()))
            .set(Register::SampleAddress, 0u32)
            .issue(Command::ProgramSpockRegisters)
            .issue(Command::ConfigureDeviceHardware)
            .issue(Command::TriggeredTrace)
    }

    /// Buffer address of the first sample to dump.
    ///
    /// `reply_address` is the write address the device reports once the
    /// trace is complete; the dump window ends there.
    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    pub fn dump_address(&self, reply_address: u64) -> u32 {
        let address = (reply_address / self.multiplier as u64) as i64;
        let start = (address - self.nsamples as i64) * self.multiplier as i64;
        start.rem_euclid(self.regime.buffer_width() as i64) as u32
    }

    /// Dump `nsamples` of the `dump_channel`-th captured channel.
    #[allow(clippy::cast_possible_truncation)]
    pub fn dump_transaction(&self, dump_channel: usize, sample_address: u32) -> Transaction {
        Transaction::new()
            .set(Register::SampleAddress, sample_address)
            .set(Register::DumpMode, self.regime.dump_mode())
            .set(Register::DumpChan, dump_channel as u32)
            .set(Register::DumpCount, self.nsamples as u32)
            .set(Register::DumpRepeat, 1u32)
            .set(Register::DumpSend, 1u32)
            .set(Register::DumpSkip, 0u32)
            .issue(Command::ProgramSpockRegisters)
            .issue(Command::AnalogDumpBinary)
    }

    pub fn decode(&self, data: &[u8]) -> Vec<f64> {
        let window = (!self.raw).then_some((self.low, self.high));
        decode_samples(data, self.sample_width(), window)
    }
}

/// Convert dumped bytes to samples.
///
/// 16-bit samples are big-endian signed and 8-bit samples unsigned; both are
/// normalized to `[0, 1)` and then mapped into `window` when one is given.
pub fn decode_samples(data: &[u8], sample_width: usize, window: Option<(f64, f64)>) -> Vec<f64> {
    let normalized: Box<dyn Iterator<Item = f64> + '_> = if sample_width == 2 {
        Box::new(
            data.chunks_exact(2)
                .map(|c| f64::from(i16::from_be_bytes([c[0], c[1]])) / 65536.0 + 0.5),
        )
    } else {
        Box::new(data.iter().map(|&b| f64::from(b) / 256.0))
    };
    match window {
        Some((low, high)) => normalized.map(|v| v * (high - low) + low).collect(),
        None => normalized.collect(),
    }
}

/// Device timestamps of the trace that produced a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureTiming {
    /// When the trigger was armed, if the device reported it.
    pub start: Option<u64>,
    pub end: u64,
}

/// Captured samples per channel, ordered by channel name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Traces {
    traces: BTreeMap<Channel, Vec<f64>>,
}

impl Traces {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, channel: Channel, samples: Vec<f64>) {
        self.traces.insert(channel, samples);
    }

    pub fn get(&self, channel: Channel) -> Option<&[f64]> {
        self.traces.get(&channel).map(Vec::as_slice)
    }

    pub fn channels(&self) -> impl Iterator<Item = Channel> + '_ {
        self.traces.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Channel, &[f64])> {
        self.traces.iter().map(|(c, v)| (*c, v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    /// Every sample of every channel, channel A first.
    pub fn into_samples(self) -> Vec<f64> {
        self.traces.into_values().flatten().collect()
    }

    pub fn into_inner(self) -> BTreeMap<Channel, Vec<f64>> {
        self.traces
    }

    /// One column per channel, named after the channel.
    pub fn to_dataframe(&self) -> Result<DataFrame, PolarsError> {
        let columns: Vec<Column> = self
            .traces
            .iter()
            .map(|(channel, samples)| Series::new(channel.as_str().into(), samples.as_slice()).into())
            .collect();
        DataFrame::new(columns)
    }
}
