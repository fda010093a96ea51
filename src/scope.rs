use polars::prelude::PolarsError;

use crate::calibration::{
    calibration_grid, estimate_window, fit_calibration, grid_frame, AnalogCalibration,
    CalibrationError, CalibrationOutcome, GridPoint,
};
use crate::capture::{CaptureConfigError, CapturePlan, CaptureRequest, CaptureTiming, Channel, Traces};
use crate::command::{parse_hex, reply, Command, CommandLayer, Register, Transaction};
use crate::connector::{Connector, ConnectorError, DeviceFilter, SerialSettings};
use crate::params::{CalibrationRecord, EEPROM_BASE, RECORD_LEN};
use crate::profile::{HardwareProfile, ProfileTable};
use crate::serial_stream::{Device, SerialStream, StreamError};
use crate::trigger_config::Trigger;
use crate::waveform::{
    read_wavetable_transaction, stop_transaction, GeneratorConfigError, GeneratorPlan,
    GeneratorRequest, Waveform,
};

/// Trace reply code sent when the trigger is armed.
const TRACE_ARMED: u64 = 2;

#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Capture configuration error: {0}")]
    CaptureConfig(#[from] CaptureConfigError),

    #[error("Generator configuration error: {0}")]
    GeneratorConfig(#[from] GeneratorConfigError),

    #[error("Calibration error: {0}")]
    Calibration(#[from] CalibrationError),

    #[error("Connection error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("Unexpected reply from device: {0}")]
    Protocol(String),

    #[error("Failure to build data frame: {0}")]
    Polars(#[from] PolarsError),
}

pub type Result<T> = std::result::Result<T, ScopeError>;

/// A connected BitScope.
///
/// Operations must be awaited one at a time; each one owns the stream until
/// it completes.
pub struct Scope<T: Device, C: CommandLayer<T>> {
    stream: SerialStream<T>,
    vm: C,
    profiles: ProfileTable,
    profile: HardwareProfile,
    profile_name: Option<String>,
    calibration: AnalogCalibration,
    revision: Option<String>,
}

impl<T: Device, C: CommandLayer<T>> std::fmt::Debug for Scope<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("stream", &self.stream)
            .field("revision", &self.revision)
            .field("profile", &self.profile_name)
            .finish_non_exhaustive()
    }
}

impl<T: Device, C: CommandLayer<T>> Scope<T, C> {
    /// Wrap an open stream without talking to the device.
    ///
    /// `defaults` stays in effect when [`Scope::setup`] does not recognize
    /// the device revision.
    pub fn new(stream: SerialStream<T>, vm: C, defaults: HardwareProfile) -> Self {
        Self {
            stream,
            vm,
            profiles: ProfileTable::builtin(),
            calibration: defaults.default_calibration,
            profile: defaults,
            profile_name: None,
            revision: None,
        }
    }

    /// Open a session: reset the device, identify it and load its
    /// stored calibration.
    pub async fn connect(stream: SerialStream<T>, vm: C, defaults: HardwareProfile) -> Result<Self> {
        Self::connect_with_profiles(stream, vm, defaults, ProfileTable::builtin()).await
    }

    pub async fn connect_with_profiles(
        stream: SerialStream<T>,
        vm: C,
        defaults: HardwareProfile,
        profiles: ProfileTable,
    ) -> Result<Self> {
        let mut scope = Self::new(stream, vm, defaults);
        scope.profiles = profiles;
        scope.setup().await?;
        Ok(scope)
    }

    pub async fn setup(&mut self) -> Result<()> {
        log::debug!("Resetting {}", self.stream.name());
        self.vm
            .execute(&mut self.stream, Transaction::new().issue(Command::Reset))
            .await?;
        self.vm
            .execute(&mut self.stream, Transaction::new().issue(Command::GetRevision))
            .await?;
        let replies = self.vm.read_replies(&mut self.stream, 2).await?;
        let revision = reply(&replies, 1)?.to_string();
        log::info!("BitScope revision: {}", revision);

        match self.profiles.lookup(&revision) {
            Some(entry) => {
                log::info!("Using {} hardware profile", entry.name);
                self.profile = entry.profile.clone();
                self.profile_name = Some(entry.name.clone());
                self.calibration = self.profile.default_calibration;
            }
            None => log::warn!("Unknown revision {}, keeping default profile", revision),
        }
        self.revision = Some(revision);

        self.load_params().await?;
        Ok(())
    }

    /// Apply the calibration stored in the EEPROM, if there is one.
    ///
    /// Returns whether a record was found.
    pub async fn load_params(&mut self) -> Result<bool> {
        let mut bytes = [0u8; RECORD_LEN];
        for (address, byte) in (EEPROM_BASE..).zip(bytes.iter_mut()) {
            *byte = self.read_eeprom(address).await?;
        }
        let record = CalibrationRecord::from_bytes(&bytes);
        if !record.is_valid() {
            log::debug!("No calibration record (version {:#06x})", record.version);
            return Ok(false);
        }
        self.calibration = record.calibration();
        log::info!(
            "Loading params low={:?} high={:?}",
            self.calibration.low,
            self.calibration.high
        );
        Ok(true)
    }

    /// Store the current calibration in the EEPROM.
    pub async fn save_params(&mut self) -> Result<()> {
        let record = CalibrationRecord::from_calibration(&self.calibration);
        for (address, byte) in (EEPROM_BASE..).zip(record.to_bytes()) {
            self.write_eeprom(address, byte).await?;
        }
        log::info!("Saved calibration to EEPROM");
        Ok(())
    }

    pub async fn read_eeprom(&mut self, address: u16) -> Result<u8> {
        let tx = Transaction::new()
            .set(Register::EepromAddress, u32::from(address))
            .issue(Command::ReadEeprom);
        self.vm.execute(&mut self.stream, tx).await?;
        self.eeprom_reply().await
    }

    /// Write one byte and return the value the device acknowledges.
    pub async fn write_eeprom(&mut self, address: u16, byte: u8) -> Result<u8> {
        let tx = Transaction::new()
            .set(Register::EepromAddress, u32::from(address))
            .set(Register::EepromData, u32::from(byte))
            .issue(Command::WriteEeprom);
        self.vm.execute(&mut self.stream, tx).await?;
        self.eeprom_reply().await
    }

    async fn eeprom_reply(&mut self) -> Result<u8> {
        let replies = self.vm.read_replies(&mut self.stream, 2).await?;
        let value = parse_hex(reply(&replies, 1)?)?;
        u8::try_from(value)
            .map_err(|_| ScopeError::Protocol(format!("EEPROM byte out of range: {value:#x}")))
    }

    pub async fn capture(&mut self, request: &CaptureRequest) -> Result<Traces> {
        Ok(self.capture_timed(request).await?.0)
    }

    /// Capture and also report the device timestamps of the trace.
    pub async fn capture_timed(
        &mut self,
        request: &CaptureRequest,
    ) -> Result<(Traces, CaptureTiming)> {
        let plan = CapturePlan::new(request, &self.profile, &self.calibration)?;
        self.vm
            .execute(&mut self.stream, plan.arm_transaction())
            .await?;

        let mut start = None;
        let end = loop {
            let replies = self.vm.read_replies(&mut self.stream, 2).await?;
            let code = parse_hex(reply(&replies, 0)?)?;
            let timestamp = parse_hex(reply(&replies, 1)?)?;
            if code == TRACE_ARMED {
                log::debug!("Trace armed at {}", timestamp);
                start = Some(timestamp);
            } else {
                log::debug!("Trace complete at {} (code {})", timestamp, code);
                break timestamp;
            }
        };
        let replies = self.vm.read_replies(&mut self.stream, 1).await?;
        let address = plan.dump_address(parse_hex(reply(&replies, 0)?)?);

        let mut traces = Traces::new();
        for (dump_channel, channel) in plan.channels.iter().enumerate() {
            self.vm
                .execute(&mut self.stream, plan.dump_transaction(dump_channel, address))
                .await?;
            let data = self.stream.read_exactly(plan.dump_len()).await?;
            traces.insert(*channel, plan.decode(&data));
        }
        Ok((traces, CaptureTiming { start, end }))
    }

    /// Start the generator and return the frequency it actually runs at.
    pub async fn start_generator(&mut self, request: &GeneratorRequest) -> Result<f64> {
        let plan = GeneratorPlan::for_request(request, &self.profile)?;
        log::info!(
            "Starting generator at {} Hz (requested {} Hz)",
            plan.frequency,
            request.frequency
        );
        self.vm
            .execute(&mut self.stream, plan.transaction(request, &self.profile))
            .await?;
        Ok(plan.frequency)
    }

    pub async fn stop_generator(&mut self) -> Result<()> {
        log::debug!("Stopping generator");
        self.vm.execute(&mut self.stream, stop_transaction()).await
    }

    /// Read back the generator wavetable.
    pub async fn read_wavetable(&mut self) -> Result<Vec<u8>> {
        self.vm
            .execute(&mut self.stream, read_wavetable_transaction(&self.profile))
            .await?;
        Ok(self.stream.read_exactly(self.profile.awg_wavetable_size).await?)
    }

    /// Refit the analog calibration over an `n` x `n` grid.
    ///
    /// The generator output must be wired to the captured channels. The
    /// new coefficients are only kept in the session; call
    /// [`Scope::save_params`] to store them.
    pub async fn calibrate(&mut self, channels: &[Channel], n: usize) -> Result<CalibrationOutcome> {
        if n * n < 3 {
            return Err(CalibrationError::GridTooSmall { n }.into());
        }
        self.start_generator(&GeneratorRequest::new(1000.0).with_waveform(Waveform::Square))
            .await?;
        let measured = self.measure_grid(channels, n).await;
        let stopped = self.stop_generator().await;
        let points = measured?;
        stopped?;

        let grid = grid_frame(&points).map_err(CalibrationError::from)?;
        let (calibration, outcome) = fit_calibration(&self.calibration, &grid)?;
        self.calibration = calibration;
        Ok(outcome)
    }

    /// Capture the reference square wave at every grid window.
    async fn measure_grid(&mut self, channels: &[Channel], n: usize) -> Result<Vec<GridPoint>> {
        let mut points = Vec::with_capacity(n * n);
        for (low, high) in calibration_grid(n) {
            let request = CaptureRequest::new(channels)
                .with_trigger(Trigger::start_capturing_when(0.5).rising_edge())
                .with_period(1e-3, 1000)
                .with_range(low, high)
                .raw();
            let mut samples = self.capture(&request).await?.into_samples();
            match estimate_window(&mut samples) {
                Some((analog_low, analog_high)) => {
                    log::debug!(
                        "Grid point low={:.4} high={:.4}: {:.4} V .. {:.4} V",
                        low,
                        high,
                        analog_low,
                        analog_high
                    );
                    points.push(GridPoint {
                        low,
                        high,
                        analog_low,
                        analog_high,
                    });
                }
                None => log::warn!("No reference signal at low={} high={}, skipping", low, high),
            }
        }
        Ok(points)
    }

    /// Release the device. Harmless to call twice.
    pub fn close(&mut self) {
        self.stream.close();
    }

    pub fn stream(&self) -> &SerialStream<T> {
        &self.stream
    }

    pub fn command_layer(&self) -> &C {
        &self.vm
    }

    pub fn command_layer_mut(&mut self) -> &mut C {
        &mut self.vm
    }

    pub fn profile(&self) -> &HardwareProfile {
        &self.profile
    }

    /// Name of the profile picked by [`Scope::setup`], if any matched.
    pub fn profile_name(&self) -> Option<&str> {
        self.profile_name.as_deref()
    }

    pub fn calibration(&self) -> &AnalogCalibration {
        &self.calibration
    }

    pub fn set_calibration(&mut self, calibration: AnalogCalibration) {
        self.calibration = calibration;
    }

    pub fn revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }
}

impl<C: CommandLayer<tokio_serial::SerialStream>> Scope<tokio_serial::SerialStream, C> {
    /// Connect to the first serial port matching `filter`.
    pub async fn connect_matching(
        filter: &DeviceFilter,
        settings: &SerialSettings,
        vm: C,
        defaults: HardwareProfile,
    ) -> Result<Self> {
        let stream = Connector::open_matching(filter, settings)?;
        Self::connect(stream, vm, defaults).await
    }
}
