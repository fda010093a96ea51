//! In-memory BitScope for tests.
//!
//! [`SimulatedBitScope`] is a [`CommandLayer`] that owns the device end of a
//! `tokio::io::duplex` pipe. Transactions travel through the [`SerialStream`]
//! as text, are applied to a register file, and the device answers through
//! the pipe the way the hardware would: `\r` terminated hex reply tokens and
//! raw sample dumps.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::calibration::AnalogCalibration;
use crate::command::{Command, CommandLayer, DumpMode, Register, RegisterValue, Step, Transaction};
use crate::profile::HardwareProfile;
use crate::scope::{Result, Scope, ScopeError};
use crate::serial_stream::{SerialStream, StreamError};

const PIPE_CAPACITY: usize = 64 * 1024;
const EEPROM_SIZE: usize = 512;
const REPLY_TERMINATOR: u8 = b'\r';

pub struct SimulatedBitScope {
    host: Option<DuplexStream>,
    device: DuplexStream,
    revision: String,
    registers: BTreeMap<Register, RegisterValue>,
    eeprom: Vec<u8>,
    wavetable: Vec<u8>,
    generator_running: bool,
    generator_powered: bool,
    /// Generator output wired to both analog inputs.
    loopback: bool,
    front_end: AnalogCalibration,
    timestamp: u64,
    transactions: Vec<Transaction>,
    dumped_channels: Vec<u32>,
}

impl SimulatedBitScope {
    pub fn new() -> Self {
        let (host, device) = tokio::io::duplex(PIPE_CAPACITY);
        let profile = HardwareProfile::bitscope_micro();
        Self {
            host: Some(host),
            device,
            revision: "BS000501".to_string(),
            registers: BTreeMap::new(),
            eeprom: vec![0xFF; EEPROM_SIZE],
            wavetable: vec![0; profile.awg_wavetable_size],
            generator_running: false,
            generator_powered: false,
            loopback: true,
            front_end: profile.default_calibration,
            timestamp: 0x1000,
            transactions: Vec::new(),
            dumped_channels: Vec::new(),
        }
    }

    pub fn with_revision(mut self, revision: &str) -> Self {
        self.revision = revision.to_string();
        self
    }

    pub fn with_eeprom(mut self, eeprom: Vec<u8>) -> Self {
        self.eeprom = eeprom;
        self
    }

    pub fn without_generator_loopback(mut self) -> Self {
        self.loopback = false;
        self
    }

    /// Host side stream and the command layer driving the device.
    pub fn into_parts(mut self) -> (SerialStream<DuplexStream>, Self) {
        let host = self.host.take().expect("host end is only taken here");
        (SerialStream::new(host, "sim"), self)
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn eeprom(&self) -> &[u8] {
        &self.eeprom
    }

    pub fn generator_enabled(&self) -> bool {
        self.generator_running && self.generator_powered
    }

    /// `DumpChan` of every analog dump so far.
    pub fn dumped_channels(&self) -> Vec<u32> {
        self.dumped_channels.clone()
    }

    fn int(&self, register: Register) -> u32 {
        match self.registers.get(&register) {
            Some(RegisterValue::Int(v)) => *v,
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            Some(RegisterValue::Fraction(f)) => *f as u32,
            None => 0,
        }
    }

    fn fraction(&self, register: Register) -> f64 {
        match self.registers.get(&register) {
            Some(RegisterValue::Int(v)) => f64::from(*v),
            Some(RegisterValue::Fraction(f)) => *f,
            None => 0.0,
        }
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.device
            .write_all(data)
            .await
            .map_err(|e| ScopeError::Stream(StreamError::Io(e)))
    }

    async fn send_replies(&mut self, tokens: &[String]) -> Result<()> {
        let mut data = Vec::new();
        for token in tokens {
            data.extend_from_slice(token.as_bytes());
            data.push(REPLY_TERMINATOR);
        }
        self.send(&data).await
    }

    /// Voltage window the converter registers select on the real front end.
    fn converter_window(&self) -> (f64, f64) {
        let lo = self.fraction(Register::ConverterLo) - self.front_end.low[0];
        let hi = self.fraction(Register::ConverterHi) - self.front_end.high[0];
        let [_, a, b] = self.front_end.low;
        let [_, c, d] = self.front_end.high;
        let det = a * d - b * c;
        ((lo * d - b * hi) / det, (a * hi - c * lo) / det)
    }

    /// Normalized level of sample `i` when the generator drives the inputs.
    #[allow(clippy::cast_precision_loss)]
    fn looped_back_level(&self, i: usize, count: usize) -> f64 {
        if !self.loopback {
            return 0.5;
        }
        let (low, high) = self.converter_window();
        let volts = if i < count / 2 { 0.0 } else { 3.3 };
        (volts - low) / (high - low)
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    fn dump(&self, channel: u32, count: usize, native: bool) -> Vec<u8> {
        let mut data = Vec::with_capacity(count * 2);
        for i in 0..count {
            if self.generator_enabled() {
                let level = self.looped_back_level(i, count);
                if native {
                    let code = ((level - 0.5) * 65536.0)
                        .round()
                        .clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16;
                    data.extend_from_slice(&code.to_be_bytes());
                } else {
                    data.push((level * 256.0).floor().clamp(0.0, 255.0) as u8);
                }
            } else if native {
                let code = (i + 1000 * channel as usize) as i16;
                data.extend_from_slice(&code.to_be_bytes());
            } else {
                data.push(((i + 64 * channel as usize) % 256) as u8);
            }
        }
        data
    }

    fn synthesize(&mut self) {
        let mode = self.int(Register::Mode);
        let len = self.wavetable.len();
        for (i, sample) in self.wavetable.iter_mut().enumerate() {
            *sample = match mode {
                3 => {
                    if i < len / 2 {
                        0
                    } else {
                        255
                    }
                }
                _ => (i * 256 / len) as u8,
            };
        }
    }

    async fn issue(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Reset => self.registers.clear(),
            Command::GetRevision => {
                let revision = self.revision.clone();
                self.send_replies(&["V".to_string(), revision]).await?;
            }
            Command::ReadEeprom | Command::WriteEeprom => {
                let address = self.int(Register::EepromAddress) as usize % EEPROM_SIZE;
                if command == Command::WriteEeprom {
                    self.eeprom[address] = self.int(Register::EepromData) as u8;
                }
                let value = self.eeprom[address];
                self.send_replies(&[format!("{address:x}"), format!("{value:02x}")])
                    .await?;
            }
            Command::TriggeredTrace => {
                let armed = self.timestamp;
                self.timestamp += 0x400;
                let done = self.timestamp;
                let address = self.int(Register::TraceIntro) + self.int(Register::TraceOutro);
                self.send_replies(&[
                    "2".to_string(),
                    format!("{armed:x}"),
                    "3".to_string(),
                    format!("{done:x}"),
                    format!("{address:x}"),
                ])
                .await?;
            }
            Command::AnalogDumpBinary => {
                let channel = self.int(Register::DumpChan);
                let count = self.int(Register::DumpCount) as usize;
                let native = self.int(Register::DumpMode) == DumpMode::Native as u32;
                self.dumped_channels.push(channel);
                let data = self.dump(channel, count, native);
                self.send(&data).await?;
            }
            Command::SynthesizeWavetable => self.synthesize(),
            Command::ControlWaveformGenerator => match self.int(Register::Cmd) {
                1 => self.generator_running = false,
                2 => self.generator_running = true,
                _ => {}
            },
            Command::ConfigureDeviceHardware => {
                self.generator_powered = self.int(Register::KitchenSinkB) & 0x40 != 0;
            }
            Command::ReadWavetable => {
                let size = (self.int(Register::Size) as usize).min(self.wavetable.len());
                let table = self.wavetable[..size].to_vec();
                self.send(&table).await?;
            }
            Command::ProgramSpockRegisters | Command::TranslateWavetable | Command::Raw(_) => {}
        }
        Ok(())
    }
}

#[async_trait]
impl CommandLayer<DuplexStream> for SimulatedBitScope {
    async fn execute(
        &mut self,
        stream: &mut SerialStream<DuplexStream>,
        transaction: Transaction,
    ) -> Result<()> {
        let encoded: String = transaction
            .steps()
            .iter()
            .map(|step| format!("{step:?}\n"))
            .collect();
        stream.write(encoded.as_bytes()).await?;
        stream.drain().await?;

        let mut received = vec![0u8; encoded.len()];
        self.device
            .read_exact(&mut received)
            .await
            .map_err(|e| ScopeError::Stream(StreamError::Io(e)))?;
        assert_eq!(received, encoded.as_bytes());

        for step in transaction.steps() {
            match step {
                Step::Set(register, value) => {
                    self.registers.insert(*register, *value);
                }
                Step::Issue(command) => self.issue(*command).await?,
                Step::WriteWavetable(table) => self.wavetable.clone_from(table),
            }
        }
        self.transactions.push(transaction);
        Ok(())
    }

    async fn read_replies(
        &mut self,
        stream: &mut SerialStream<DuplexStream>,
        count: usize,
    ) -> Result<Vec<String>> {
        let mut replies = Vec::with_capacity(count);
        let mut token = Vec::new();
        while replies.len() < count {
            // One byte at a time so a following binary dump stays unread.
            let byte = stream.read(Some(1)).await?;
            match byte.first() {
                Some(&REPLY_TERMINATOR) => {
                    replies.push(String::from_utf8_lossy(&token).into_owned());
                    token.clear();
                }
                Some(&b) => token.push(b),
                None => {}
            }
        }
        Ok(replies)
    }
}

pub async fn connected(sim: SimulatedBitScope) -> Scope<DuplexStream, SimulatedBitScope> {
    let (stream, vm) = sim.into_parts();
    Scope::connect(stream, vm, HardwareProfile::bitscope_micro())
        .await
        .unwrap()
}

pub async fn simulated_scope() -> Scope<DuplexStream, SimulatedBitScope> {
    connected(SimulatedBitScope::new()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replies_travel_through_stream() {
        let (mut stream, mut sim) = SimulatedBitScope::new().into_parts();
        sim.execute(&mut stream, Transaction::new().issue(Command::GetRevision))
            .await
            .unwrap();
        let replies = sim.read_replies(&mut stream, 2).await.unwrap();
        assert_eq!(replies, vec!["V".to_string(), "BS000501".to_string()]);
        assert_eq!(stream.pending_output(), 0);
    }

    #[test]
    fn test_converter_window_inverts_front_end() {
        let mut sim = SimulatedBitScope::new();
        let front_end = sim.front_end;
        sim.registers.insert(
            Register::ConverterLo,
            RegisterValue::Fraction(front_end.converter_lo(-2.0, 6.0)),
        );
        sim.registers.insert(
            Register::ConverterHi,
            RegisterValue::Fraction(front_end.converter_hi(-2.0, 6.0)),
        );
        let (low, high) = sim.converter_window();
        assert!((low + 2.0).abs() < 1e-9);
        assert!((high - 6.0).abs() < 1e-9);
    }
}
