//! # v1net Core
//!
//! Shared types and utilities for the v1net cortical network simulator.
//!
//! ## Contents
//!
//! | Item | Purpose |
//! |------|---------|
//! | `Time`, `Voltage`, `Conductance`, `Rate` | Scalar units (ms, mV, leak-relative, Hz) |
//! | `TimeSeries` | Recorded trace of a single variable |
//! | `SimulationParams` | Duration, step, recording interval, seed |
//! | `IntegrationMethod` | Euler or exponential Euler state update |
//!
//! ## Conventions
//!
//! 1. Time is in milliseconds, rates in Hz
//! 2. Membrane potentials are measured relative to rest
//! 3. Conductances are in units of the leak conductance

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Common errors
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Numerical error: {0}")]
    Numerical(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Time point (ms)
pub type Time = f64;

/// Membrane potential relative to rest (mV)
pub type Voltage = f64;

/// Synaptic conductance in units of the leak conductance
pub type Conductance = f64;

/// Firing rate (Hz)
pub type Rate = f64;

/// Time series data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Time points
    pub time: Vec<Time>,
    /// Values at each time point
    pub values: Vec<f64>,
    /// Variable name
    pub name: String,
    /// Units
    pub units: Option<String>,
}

impl TimeSeries {
    pub fn new(name: &str) -> Self {
        Self {
            time: Vec::new(),
            values: Vec::new(),
            name: name.to_string(),
            units: None,
        }
    }

    pub fn with_units(mut self, units: &str) -> Self {
        self.units = Some(units.to_string());
        self
    }

    pub fn push(&mut self, t: Time, v: f64) {
        self.time.push(t);
        self.values.push(v);
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Span between first and last sample
    pub fn span(&self) -> Time {
        match (self.time.first(), self.time.last()) {
            (Some(first), Some(last)) => last - first,
            _ => 0.0,
        }
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }
}

/// Simulation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationParams {
    /// Simulated duration (ms)
    pub duration: Time,
    /// Integration time step (ms)
    pub dt: Time,
    /// Record state every n steps
    pub record_every: usize,
    /// Seed for weights and Poisson input
    pub seed: u64,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            duration: 30_000.0,
            dt: 0.1,
            record_every: 1,
            seed: 2013,
        }
    }
}

impl SimulationParams {
    /// Number of integration steps covering `duration`
    pub fn n_steps(&self) -> usize {
        (self.duration / self.dt).round() as usize
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.dt.is_finite() && self.dt > 0.0) {
            return Err(CoreError::InvalidParameter(format!(
                "dt must be positive, got {}",
                self.dt
            )));
        }
        if !(self.duration.is_finite() && self.duration > 0.0) {
            return Err(CoreError::InvalidParameter(format!(
                "duration must be positive, got {}",
                self.duration
            )));
        }
        if self.dt > self.duration {
            return Err(CoreError::InvalidParameter(format!(
                "dt ({}) exceeds duration ({})",
                self.dt, self.duration
            )));
        }
        if self.record_every == 0 {
            return Err(CoreError::InvalidParameter(
                "record_every must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Integration methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IntegrationMethod {
    /// Forward Euler (Brian's default for this model)
    #[default]
    Euler,
    /// Exact update of a state that is linear with frozen coefficients
    ExponentialEuler,
}

impl IntegrationMethod {
    pub const ALL: [IntegrationMethod; 2] = [IntegrationMethod::Euler, IntegrationMethod::ExponentialEuler];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Euler => "euler",
            Self::ExponentialEuler => "exponential-euler",
        }
    }
}

impl std::str::FromStr for IntegrationMethod {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "euler" => Ok(Self::Euler),
            "exponential-euler" | "exp-euler" => Ok(Self::ExponentialEuler),
            other => Err(CoreError::InvalidParameter(format!(
                "Unknown integration method: {}",
                other
            ))),
        }
    }
}

/// Fails with [`CoreError::Numerical`] if any value is NaN or infinite
pub fn check_finite<'a>(values: impl IntoIterator<Item = &'a f64>, t: Time) -> Result<()> {
    match values.into_iter().position(|x| !x.is_finite()) {
        Some(i) => Err(CoreError::Numerical(format!(
            "non-finite state at index {} after step at t = {} ms",
            i, t
        ))),
        None => Ok(()),
    }
}
