//! Interface to the BitScope virtual machine command layer.
//!
//! The register encoding, command bytes and reply framing belong to the
//! command layer implementation. This crate only speaks in terms of named
//! [`Register`]s, [`Command`] primitives and [`Transaction`]s, and relies on
//! a [`CommandLayer`] to put them on the wire.

use async_trait::async_trait;
use bitflags::bitflags;

use crate::scope::ScopeError;
use crate::serial_stream::{Device, SerialStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Register {
    TraceMode,
    ClockTicks,
    ClockScale,
    TraceIntro,
    TraceOutro,
    TraceDelay,
    Timeout,
    TriggerMask,
    TriggerLogic,
    TriggerLevel,
    TriggerIntro,
    TriggerOutro,
    SpockOption,
    Prelude,
    ConverterLo,
    ConverterHi,
    KitchenSinkA,
    KitchenSinkB,
    AnalogEnable,
    BufferMode,
    SampleAddress,
    DumpMode,
    DumpChan,
    DumpCount,
    DumpRepeat,
    DumpSend,
    DumpSkip,
    // Waveform generator
    Cmd,
    Mode,
    Ratio,
    Level,
    Offset,
    Index,
    Address,
    Size,
    Clock,
    Modulo,
    Mark,
    Space,
    Rest,
    WaveOption,
    EepromAddress,
    EepromData,
}

/// Value written to a register.
///
/// `Fraction` registers hold a value normalized to the register's full
/// scale; the command layer converts it to the register's fixed-point width.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegisterValue {
    Int(u32),
    Fraction(f64),
}

impl From<u32> for RegisterValue {
    fn from(value: u32) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for RegisterValue {
    fn from(value: f64) -> Self {
        Self::Fraction(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceMode {
    Analog = 0,
    AnalogChop = 2,
    AnalogFast = 4,
    AnalogFastChop = 6,
    AnalogShot = 11,
    AnalogShotChop = 16,
    Macro = 18,
    MacroChop = 19,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    Single = 0,
    Chop = 1,
    Macro = 4,
    MacroChop = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpMode {
    Raw = 0,
    Native = 5,
}

macro_rules! register_enum {
    ($($ty:ty),*) => {
        $(impl From<$ty> for RegisterValue {
            fn from(value: $ty) -> Self {
                Self::Int(value as u32)
            }
        })*
    };
}

register_enum!(TraceMode, BufferMode, DumpMode);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SpockOption: u8 {
        const TRIGGER_HARDWARE_COMPARATOR = 0x01;
        const TRIGGER_SWAP = 0x02;
        const TRIGGER_SOURCE_B = 0x04;
        const TRIGGER_INVERT = 0x40;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KitchenSinkA: u8 {
        const CHANNEL_B_COMPARATOR_ENABLE = 0x40;
        const CHANNEL_A_COMPARATOR_ENABLE = 0x80;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KitchenSinkB: u8 {
        const WAVEFORM_GENERATOR_ENABLE = 0x40;
        const ANALOG_FILTER_ENABLE = 0x80;
    }
}

impl SpockOption {
    /// Channel A is selected when the source bit is clear.
    pub const TRIGGER_SOURCE_A: Self = Self::empty();
}

macro_rules! register_flags {
    ($($ty:ty),*) => {
        $(impl From<$ty> for RegisterValue {
            fn from(value: $ty) -> Self {
                Self::Int(u32::from(value.bits()))
            }
        })*
    };
}

register_flags!(SpockOption, KitchenSinkA, KitchenSinkB);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ProgramSpockRegisters,
    ConfigureDeviceHardware,
    TriggeredTrace,
    AnalogDumpBinary,
    SynthesizeWavetable,
    TranslateWavetable,
    ControlWaveformGenerator,
    ReadWavetable,
    ReadEeprom,
    WriteEeprom,
    GetRevision,
    Reset,
    /// A bare command byte with no named primitive.
    Raw(u8),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Set(Register, RegisterValue),
    Issue(Command),
    WriteWavetable(Vec<u8>),
}

/// Register writes and commands sent to the device as one unit.
///
/// Steps are kept in the order they were added.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transaction {
    steps: Vec<Step>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, register: Register, value: impl Into<RegisterValue>) -> Self {
        self.steps.push(Step::Set(register, value.into()));
        self
    }

    pub fn issue(mut self, command: Command) -> Self {
        self.steps.push(Step::Issue(command));
        self
    }

    pub fn write_wavetable(mut self, table: Vec<u8>) -> Self {
        self.steps.push(Step::WriteWavetable(table));
        self
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Last value the transaction writes to `register`.
    pub fn register(&self, register: Register) -> Option<RegisterValue> {
        self.steps.iter().rev().find_map(|step| match step {
            Step::Set(r, value) if *r == register => Some(*value),
            _ => None,
        })
    }

    pub fn commands(&self) -> impl Iterator<Item = Command> + '_ {
        self.steps.iter().filter_map(|step| match step {
            Step::Issue(command) => Some(*command),
            _ => None,
        })
    }
}

/// Encodes transactions for the device and reads its replies.
///
/// Binary sample dumps are not replies: after an
/// [`Command::AnalogDumpBinary`] the caller reads the raw bytes straight off
/// the stream.
#[async_trait]
pub trait CommandLayer<T: Device>: Send {
    /// Put the transaction on the wire and wait until it has been sent.
    async fn execute(
        &mut self,
        stream: &mut SerialStream<T>,
        transaction: Transaction,
    ) -> Result<(), ScopeError>;

    /// Read `count` ASCII reply tokens.
    async fn read_replies(
        &mut self,
        stream: &mut SerialStream<T>,
        count: usize,
    ) -> Result<Vec<String>, ScopeError>;
}

/// Parse a hexadecimal reply token.
pub fn parse_hex(token: &str) -> Result<u64, ScopeError> {
    let digits = token.trim();
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(digits);
    u64::from_str_radix(digits, 16)
        .map_err(|_| ScopeError::Protocol(format!("expected a hexadecimal reply, got {token:?}")))
}

/// Token `index` of a reply batch.
pub fn reply(replies: &[String], index: usize) -> Result<&str, ScopeError> {
    replies.get(index).map(String::as_str).ok_or_else(|| {
        ScopeError::Protocol(format!(
            "expected at least {} reply tokens, got {}",
            index + 1,
            replies.len()
        ))
    })
}
