//! Siglent SDS oscilloscope acquisition driver.
//!
//! This crate drives SDS-family digital storage oscilloscopes over an SCPI
//! command channel (typically tunnelled through USBTMC) and emits calibrated
//! waveform data on a session bus. The connection and the data consumer are
//! both injected capabilities: the engine talks to the scope through
//! [`scpi::ScpiLink`] and publishes through [`session::SessionSink`], so the
//! same core runs against real hardware or the bundled [`sim::SimulatedScope`].
//!
//! # Driving the engine
//!
//! The engine is cooperative and owns no threads. After
//! [`AcquisitionEngine::start_acquisition`], call [`AcquisitionEngine::tick`]
//! from an event loop (on I/O readiness or a ~10 ms timer) until it reports
//! [`TickStatus::Done`]; each call performs one bounded unit of work.

pub mod config;
pub mod errors;
pub mod logging;
pub mod models;
pub mod scpi;
pub mod session;
pub mod siglent;
pub mod sim;

pub use errors::{AcquisitionError, Result, TransportError};
pub use models::{Model, ScopeFamily};
pub use session::{AnalogPacket, ChannelId, LogicPacket, SessionSink};
pub use siglent::{AcquisitionEngine, DataSource, TickStatus};
