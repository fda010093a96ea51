//! # BitScope RS
//!
//! An async Rust library for capturing signals with BitScope mixed-signal
//! oscilloscopes and driving their arbitrary waveform generator.
//!
//! The library turns capture, generator and calibration requests into
//! register transactions for the BitScope virtual machine, and decodes the
//! returned sample dumps into calibrated voltages. The wire encoding of
//! registers and commands is supplied by a [`CommandLayer`] implementation.
//!
//! ## Features
//!
//! - **Non-blocking transport**: [`SerialStream`] buffers writes with backpressure and parks reads on device readiness
//! - **Capture planning**: timing regime, trigger and converter window selection done before any I/O
//! - **Waveform planning**: integer clock and buffer fill search for a target frequency
//! - **Calibration**: least squares refit of the analog front end against the built-in generator
//! - **Persistent calibration**: versioned record stored in the device EEPROM
//! - **DataFrame output**: captured traces convert to `polars` frames
//!
//! ## Examples
//!
//! ### Capturing both channels
//!
//! ```rust,no_run
//! use bitscope_rs::{
//!     Channel, CommandLayer, Connector, CaptureRequest, DeviceFilter, HardwareProfile, Scope,
//!     SerialSettings, Trigger,
//! };
//!
//! # async fn run<C: CommandLayer<tokio_serial::SerialStream>>(vm: C) -> bitscope_rs::Result<()> {
//! let stream = Connector::open_matching(&DeviceFilter::any(), &SerialSettings::default())?;
//! let mut scope = Scope::connect(stream, vm, HardwareProfile::bitscope_micro()).await?;
//!
//! let request = CaptureRequest::new(&[Channel::A, Channel::B])
//!     .with_trigger(Trigger::start_capturing_when(1.5).on_channel(Channel::A).rising_edge())
//!     .with_period(1e-3, 1000);
//! let traces = scope.capture(&request).await?;
//! println!("{}", traces.to_dataframe()?);
//! # Ok(())
//! # }
//! ```
//!
//! ### Planning a generator frequency
//!
//! ```rust
//! use bitscope_rs::{GeneratorPlan, HardwareProfile};
//!
//! let plan = GeneratorPlan::search(1000.0, 50, 0.0, &HardwareProfile::bitscope_micro()).unwrap();
//! assert_eq!(plan.frequency, 1000.0);
//! ```

pub mod calibration;
pub mod capture;
pub mod command;
pub mod connector;
pub mod params;
pub mod profile;
pub mod scope;
pub mod serial_stream;
pub mod trigger_config;
pub mod waveform;

#[cfg(test)]
mod sim;

// Re-export the main types for convenience
pub use calibration::{AnalogCalibration, CalibrationError, CalibrationOutcome};

pub use capture::{
    CaptureConfigError, CapturePlan, CaptureRequest, CaptureTiming, Channel, Traces,
};

pub use command::{Command, CommandLayer, Register, RegisterValue, Transaction};

pub use connector::{BitScopeDevice, Connector, ConnectorError, DeviceFilter, SerialSettings};

pub use params::CalibrationRecord;

pub use profile::{HardwareProfile, ProfileTable};

pub use scope::{Result, Scope, ScopeError};

pub use serial_stream::{SerialStream, StreamError};

pub use trigger_config::{Trigger, TriggerType};

pub use waveform::{GeneratorConfigError, GeneratorPlan, GeneratorRequest, Waveform};
