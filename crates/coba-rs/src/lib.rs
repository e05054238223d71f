//! # COBA-RS: Conductance-Based Integrate-and-Fire Networks
//!
//! A small Brian-style engine for networks of conductance-based leaky
//! integrate-and-fire neurons with exponentially decaying synaptic
//! conductances.
//!
//! This crate provides:
//! - Neuron groups with `v`, `ge`, `gi` state and threshold/reset/refractory mechanics
//! - Poisson input groups
//! - Dense weighted connections (log-normal weight sampling)
//! - Spike monitors and state monitors
//! - A fixed-step network run loop
//! - Spike-train and conductance statistics
//!
//! Potentials are relative to rest and conductances are in units of the
//! leak conductance:
//!
//! ```text
//! dv/dt  = (-v + ge*(Ee - v) + gi*(Ei - v)) / taum
//! dge/dt = -ge / taue
//! dgi/dt = -gi / taui
//! ```

use ndarray::{Array1, Array2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, LogNormal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};
use v1net_core::{
    check_finite, Conductance, CoreError, IntegrationMethod, Rate, Time, TimeSeries, Voltage,
};

#[derive(Error, Debug)]
pub enum CobaError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("Weight matrix '{name}' has shape {got:?}, expected {expected:?}")]
    WeightShape {
        name: String,
        expected: (usize, usize),
        got: (usize, usize),
    },
    #[error("Record index {index} out of range for group '{group}' of size {n}")]
    RecordIndex { group: String, index: usize, n: usize },
    #[error("Invalid distribution: {0}")]
    Distribution(String),
}

pub type Result<T> = std::result::Result<T, CobaError>;

/// RNG stream used for network dynamics (Poisson input).
/// Stream 0 of the same seed is left for weight generation.
pub const DYNAMICS_STREAM: u64 = 1;

/// Steps between progress callbacks in [`Network::run_with`]
pub const PROGRESS_STRIDE: usize = 1000;

// ============================================================================
// NEURON MODEL
// ============================================================================

/// Conductance-based LIF parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CobaParams {
    pub tau_m: Time,         // Membrane time constant (ms)
    pub tau_e: Time,         // Excitatory conductance decay (ms)
    pub tau_i: Time,         // Inhibitory conductance decay (ms)
    pub e_exc: Voltage,      // Excitatory reversal, relative to rest (mV)
    pub e_inh: Voltage,      // Inhibitory reversal, relative to rest (mV)
    pub v_threshold: Voltage, // Spike threshold (mV)
    pub v_reset: Voltage,    // Reset potential (mV)
    pub tau_ref: Time,       // Refractory period (ms)
}

impl Default for CobaParams {
    fn default() -> Self {
        Self::relative_to_rest(-70.0, 0.0, -70.0)
    }
}

impl CobaParams {
    /// Build parameters from absolute reversal potentials
    pub fn relative_to_rest(v_rest: Voltage, e_exc: Voltage, e_inh: Voltage) -> Self {
        Self {
            tau_m: 20.0,
            tau_e: 5.0,
            tau_i: 10.0,
            e_exc: e_exc - v_rest,
            e_inh: e_inh - v_rest,
            v_threshold: 20.0,
            v_reset: -20.0,
            tau_ref: 3.0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, tau) in [("tau_m", self.tau_m), ("tau_e", self.tau_e), ("tau_i", self.tau_i)] {
            if !(tau.is_finite() && tau > 0.0) {
                return Err(CoreError::InvalidParameter(format!(
                    "{} must be positive, got {}",
                    name, tau
                ))
                .into());
            }
        }
        if !(self.tau_ref.is_finite() && self.tau_ref >= 0.0) {
            return Err(CoreError::InvalidParameter(format!(
                "tau_ref must be non-negative, got {}",
                self.tau_ref
            ))
            .into());
        }
        if self.v_reset >= self.v_threshold {
            return Err(CoreError::InvalidParameter(format!(
                "v_reset ({}) must lie below v_threshold ({})",
                self.v_reset, self.v_threshold
            ))
            .into());
        }
        Ok(())
    }

    #[inline]
    pub fn dv_dt(&self, v: Voltage, ge: Conductance, gi: Conductance) -> f64 {
        (-v + ge * (self.e_exc - v) + gi * (self.e_inh - v)) / self.tau_m
    }

    /// Exponential Euler step: `v` relaxes exactly towards its conductance
    /// dependent fixed point with `ge`, `gi` frozen over the step, the
    /// conductances decay exactly.
    pub fn exponential_euler(
        &self,
        v: Voltage,
        ge: Conductance,
        gi: Conductance,
        dt: Time,
    ) -> (Voltage, Conductance, Conductance) {
        let g_tot = 1.0 + ge + gi;
        let v_inf = (ge * self.e_exc + gi * self.e_inh) / g_tot;
        let v_next = v_inf + (v - v_inf) * (-g_tot * dt / self.tau_m).exp();
        (
            v_next,
            ge * (-dt / self.tau_e).exp(),
            gi * (-dt / self.tau_i).exp(),
        )
    }
}

/// Recordable state variables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateVariable {
    V,
    Ge,
    Gi,
}

impl StateVariable {
    pub const ALL: [StateVariable; 3] = [StateVariable::V, StateVariable::Ge, StateVariable::Gi];

    pub fn name(&self) -> &'static str {
        match self {
            StateVariable::V => "v",
            StateVariable::Ge => "ge",
            StateVariable::Gi => "gi",
        }
    }

    pub fn units(&self) -> &'static str {
        match self {
            StateVariable::V => "mV",
            StateVariable::Ge | StateVariable::Gi => "1",
        }
    }
}

impl std::str::FromStr for StateVariable {
    type Err = CobaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "v" => Ok(StateVariable::V),
            "ge" => Ok(StateVariable::Ge),
            "gi" => Ok(StateVariable::Gi),
            other => Err(CoreError::InvalidParameter(format!("Unknown variable: {}", other)).into()),
        }
    }
}

/// Conductance a connection feeds into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SynapticTarget {
    /// `ge`
    Excitatory,
    /// `gi`
    Inhibitory,
}

// ============================================================================
// NEURON GROUP
// ============================================================================

/// A group of neurons sharing the same parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeuronGroup {
    pub name: String,
    pub n: usize,
    pub params: CobaParams,
    pub method: IntegrationMethod,
    pub v: Array1<f64>,
    pub ge: Array1<f64>,
    pub gi: Array1<f64>,
    /// Remaining refractory steps per neuron
    refractory: Vec<usize>,
    /// Units that fired in the current step
    spiked: Vec<usize>,
}

impl NeuronGroup {
    pub fn new(name: &str, n: usize, params: CobaParams) -> Self {
        Self {
            name: name.to_string(),
            n,
            params,
            method: IntegrationMethod::Euler,
            v: Array1::zeros(n),
            ge: Array1::zeros(n),
            gi: Array1::zeros(n),
            refractory: vec![0; n],
            spiked: Vec::new(),
        }
    }

    pub fn with_method(mut self, method: IntegrationMethod) -> Self {
        self.method = method;
        self
    }

    pub fn state(&self, variable: StateVariable) -> &Array1<f64> {
        match variable {
            StateVariable::V => &self.v,
            StateVariable::Ge => &self.ge,
            StateVariable::Gi => &self.gi,
        }
    }

    fn state_mut(&mut self, variable: StateVariable) -> &mut Array1<f64> {
        match variable {
            StateVariable::V => &mut self.v,
            StateVariable::Ge => &mut self.ge,
            StateVariable::Gi => &mut self.gi,
        }
    }

    pub fn set_initial(&mut self, variable: StateVariable, values: Array1<f64>) -> Result<()> {
        if values.len() != self.n {
            return Err(CoreError::DimensionMismatch {
                expected: self.n,
                got: values.len(),
            }
            .into());
        }
        *self.state_mut(variable) = values;
        Ok(())
    }

    pub fn fill(&mut self, variable: StateVariable, value: f64) {
        self.state_mut(variable).fill(value);
    }

    pub fn spikes(&self) -> &[usize] {
        &self.spiked
    }

    pub fn is_refractory(&self, idx: usize) -> bool {
        self.refractory.get(idx).is_some_and(|&r| r > 0)
    }

    /// Advance all state variables by one step
    pub fn integrate(&mut self, t: Time, dt: Time) -> Result<()> {
        let p = &self.params;
        match self.method {
            IntegrationMethod::Euler => {
                let decay_e = dt / p.tau_e;
                let decay_i = dt / p.tau_i;
                for i in 0..self.n {
                    let (v, ge, gi) = (self.v[i], self.ge[i], self.gi[i]);
                    self.v[i] = v + dt * p.dv_dt(v, ge, gi);
                    self.ge[i] = ge - decay_e * ge;
                    self.gi[i] = gi - decay_i * gi;
                }
            }
            IntegrationMethod::ExponentialEuler => {
                for i in 0..self.n {
                    let (v, ge, gi) = p.exponential_euler(self.v[i], self.ge[i], self.gi[i], dt);
                    self.v[i] = v;
                    self.ge[i] = ge;
                    self.gi[i] = gi;
                }
            }
        }
        check_finite(self.v.iter().chain(&self.ge).chain(&self.gi), t)?;
        Ok(())
    }

    /// Detect threshold crossings, reset the fired units and hold
    /// refractory units at the reset potential.
    pub fn threshold_and_reset(&mut self, dt: Time) -> &[usize] {
        let refractory_steps = (self.params.tau_ref / dt).round() as usize;
        self.spiked.clear();
        for i in 0..self.n {
            if self.refractory[i] > 0 {
                self.refractory[i] -= 1;
                self.v[i] = self.params.v_reset;
            } else if self.v[i] > self.params.v_threshold {
                self.spiked.push(i);
                self.v[i] = self.params.v_reset;
                self.refractory[i] = refractory_steps;
            }
        }
        &self.spiked
    }
}

// ============================================================================
// INPUT DEVICES
// ============================================================================

/// Poisson spike generator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoissonGroup {
    pub name: String,
    pub n: usize,
    pub rates: Array1<f64>, // Hz
    spiked: Vec<usize>,
}

impl PoissonGroup {
    pub fn new(name: &str, n: usize, rate: Rate) -> Self {
        Self::new_heterogeneous(name, Array1::from_elem(n, rate))
    }

    pub fn new_heterogeneous(name: &str, rates: Array1<f64>) -> Self {
        let n = rates.len();
        Self {
            name: name.to_string(),
            n,
            rates,
            spiked: Vec::new(),
        }
    }

    pub fn spikes(&self) -> &[usize] {
        &self.spiked
    }

    /// Draw this step's spikes, one Bernoulli trial per unit
    pub fn emit<R: Rng + ?Sized>(&mut self, dt: Time, rng: &mut R) -> &[usize] {
        self.spiked.clear();
        let dt_s = dt / 1000.0;
        for (i, &rate) in self.rates.iter().enumerate() {
            let p = (rate * dt_s).clamp(0.0, 1.0);
            if rng.gen::<f64>() < p {
                self.spiked.push(i);
            }
        }
        &self.spiked
    }
}

// ============================================================================
// HANDLES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoissonGroupId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NeuronGroupId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpikeMonitorId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateMonitorId(pub usize);

/// Any spike source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupRef {
    Poisson(PoissonGroupId),
    Neurons(NeuronGroupId),
}

impl From<PoissonGroupId> for GroupRef {
    fn from(id: PoissonGroupId) -> Self {
        GroupRef::Poisson(id)
    }
}

impl From<NeuronGroupId> for GroupRef {
    fn from(id: NeuronGroupId) -> Self {
        GroupRef::Neurons(id)
    }
}

// ============================================================================
// CONNECTIONS
// ============================================================================

/// Dense weighted connection between two groups
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub name: String,
    pub source: GroupRef,
    pub target: NeuronGroupId,
    pub target_var: SynapticTarget,
    /// (source.n, target.n)
    pub weights: Array2<f64>,
}

impl Connection {
    /// Add the weight rows of the fired source units to the target conductance
    pub fn propagate(&self, spikes: &[usize], target: &mut NeuronGroup) {
        let g = match self.target_var {
            SynapticTarget::Excitatory => &mut target.ge,
            SynapticTarget::Inhibitory => &mut target.gi,
        };
        for &i in spikes {
            g.scaled_add(1.0, &self.weights.row(i));
        }
    }

    pub fn n_synapses(&self) -> usize {
        self.weights.len()
    }
}

/// Sample a `shape` matrix of `LogNormal(mu, sigma) * scale` weights,
/// filled row by row
pub fn lognormal_weights<R: Rng + ?Sized>(
    shape: (usize, usize),
    mu: f64,
    sigma: f64,
    scale: f64,
    rng: &mut R,
) -> Result<Array2<f64>> {
    if !(scale.is_finite() && scale >= 0.0) {
        return Err(CobaError::Distribution(format!(
            "weight scale must be finite and non-negative, got {}",
            scale
        )));
    }
    // rand_distr only rejects a non-finite sigma
    if !(mu.is_finite() && sigma.is_finite() && sigma >= 0.0) {
        return Err(CobaError::Distribution(format!(
            "invalid log-normal parameters mu = {}, sigma = {}",
            mu, sigma
        )));
    }
    let dist = LogNormal::new(mu, sigma)
        .map_err(|e| CobaError::Distribution(format!("lognormal({}, {}): {}", mu, sigma, e)))?;
    Ok(Array2::from_shape_fn(shape, |_| dist.sample(&mut *rng) * scale))
}

// ============================================================================
// MONITORS
// ============================================================================

/// Record spike times
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpikeMonitor {
    pub source: GroupRef,
    pub source_name: String,
    /// Recorded spikes: (neuron_idx, time_ms)
    pub spikes: Vec<(usize, Time)>,
    /// Spike counts per neuron
    pub counts: Vec<usize>,
}

impl SpikeMonitor {
    pub fn new(source: GroupRef, source_name: &str, n: usize) -> Self {
        Self {
            source,
            source_name: source_name.to_string(),
            spikes: vec![],
            counts: vec![0; n],
        }
    }

    pub fn record_spike(&mut self, idx: usize, time: Time) {
        self.spikes.push((idx, time));
        if idx < self.counts.len() {
            self.counts[idx] += 1;
        }
    }

    pub fn n_events(&self) -> usize {
        self.spikes.len()
    }

    /// Get spike trains for each neuron
    pub fn spike_trains(&self) -> BTreeMap<usize, Vec<Time>> {
        let mut trains: BTreeMap<usize, Vec<Time>> = BTreeMap::new();
        for &(idx, time) in &self.spikes {
            trains.entry(idx).or_default().push(time);
        }
        trains
    }

    pub fn times_of(&self, idx: usize) -> Vec<Time> {
        self.spikes
            .iter()
            .filter(|&&(i, _)| i == idx)
            .map(|&(_, t)| t)
            .collect()
    }

    /// Calculate firing rate in Hz
    pub fn mean_rate(&self, duration_ms: Time) -> Rate {
        mean_firing_rate(self.n_events(), self.counts.len(), duration_ms)
    }
}

/// Record state variables of selected neurons over time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMonitor {
    pub source: NeuronGroupId,
    pub source_name: String,
    pub variables: Vec<StateVariable>,
    pub record_indices: Vec<usize>,
    /// Record every n steps
    pub every: usize,
    pub times: Vec<Time>,
    /// Steps seen, sampled or not
    steps_seen: usize,
    /// data[variable][unit][sample]
    data: Vec<Vec<Vec<f64>>>,
}

impl StateMonitor {
    pub fn new(
        source: NeuronGroupId,
        source_name: &str,
        variables: &[StateVariable],
        indices: &[usize],
        every: usize,
    ) -> Self {
        Self {
            source,
            source_name: source_name.to_string(),
            variables: variables.to_vec(),
            record_indices: indices.to_vec(),
            every: every.max(1),
            times: vec![],
            steps_seen: 0,
            data: vec![vec![vec![]; indices.len()]; variables.len()],
        }
    }

    pub fn record(&mut self, step: usize, time: Time, group: &NeuronGroup) {
        self.steps_seen = step + 1;
        if step % self.every != 0 {
            return;
        }
        self.times.push(time);
        for (var, per_unit) in self.variables.iter().zip(self.data.iter_mut()) {
            let values = group.state(*var);
            for (samples, &idx) in per_unit.iter_mut().zip(self.record_indices.iter()) {
                samples.push(values[idx]);
            }
        }
    }

    /// All recorded traces of one variable, one row per recorded neuron
    pub fn values(&self, variable: StateVariable) -> Option<&[Vec<f64>]> {
        self.variables
            .iter()
            .position(|v| *v == variable)
            .map(|i| self.data[i].as_slice())
    }

    /// Trace of the `k`-th recorded neuron
    pub fn trace(&self, variable: StateVariable, k: usize) -> Option<TimeSeries> {
        let samples = self.values(variable)?.get(k)?;
        let mut ts = TimeSeries::new(&format!(
            "{}.{}[{}]",
            self.source_name,
            variable.name(),
            self.record_indices[k]
        ))
        .with_units(variable.units());
        for (&t, &x) in self.times.iter().zip(samples.iter()) {
            ts.push(t, x);
        }
        Some(ts)
    }

    pub fn n_samples(&self) -> usize {
        self.times.len()
    }

    /// Simulated time covered by the recording, including steps between
    /// samples
    pub fn duration(&self, dt: Time) -> Time {
        self.steps_seen as f64 * dt
    }
}

// ============================================================================
// NETWORK
// ============================================================================

/// Complete network with its own clock and RNG
#[derive(Debug, Clone)]
pub struct Network {
    pub poisson_groups: Vec<PoissonGroup>,
    pub neuron_groups: Vec<NeuronGroup>,
    pub connections: Vec<Connection>,
    pub spike_monitors: Vec<SpikeMonitor>,
    pub state_monitors: Vec<StateMonitor>,
    pub dt: Time, // Timestep in ms
    pub t: Time,  // Current time in ms
    pub steps: usize,
    rng: ChaCha8Rng,
}

impl Network {
    pub fn new(dt: Time, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        rng.set_stream(DYNAMICS_STREAM);
        Self {
            poisson_groups: Vec::new(),
            neuron_groups: Vec::new(),
            connections: Vec::new(),
            spike_monitors: Vec::new(),
            state_monitors: Vec::new(),
            dt,
            t: 0.0,
            steps: 0,
            rng,
        }
    }

    pub fn add_poisson_group(&mut self, group: PoissonGroup) -> PoissonGroupId {
        self.poisson_groups.push(group);
        PoissonGroupId(self.poisson_groups.len() - 1)
    }

    pub fn add_neuron_group(&mut self, group: NeuronGroup) -> Result<NeuronGroupId> {
        group.params.validate()?;
        self.neuron_groups.push(group);
        Ok(NeuronGroupId(self.neuron_groups.len() - 1))
    }

    pub fn neuron_group(&self, id: NeuronGroupId) -> &NeuronGroup {
        &self.neuron_groups[id.0]
    }

    pub fn neuron_group_mut(&mut self, id: NeuronGroupId) -> &mut NeuronGroup {
        &mut self.neuron_groups[id.0]
    }

    pub fn poisson_group(&self, id: PoissonGroupId) -> &PoissonGroup {
        &self.poisson_groups[id.0]
    }

    pub fn group_by_name(&self, name: &str) -> Option<GroupRef> {
        if let Some(i) = self.neuron_groups.iter().position(|g| g.name == name) {
            return Some(GroupRef::Neurons(NeuronGroupId(i)));
        }
        self.poisson_groups
            .iter()
            .position(|g| g.name == name)
            .map(|i| GroupRef::Poisson(PoissonGroupId(i)))
    }

    pub fn group_size(&self, group: GroupRef) -> usize {
        match group {
            GroupRef::Poisson(id) => self.poisson_groups[id.0].n,
            GroupRef::Neurons(id) => self.neuron_groups[id.0].n,
        }
    }

    pub fn group_name(&self, group: GroupRef) -> &str {
        match group {
            GroupRef::Poisson(id) => &self.poisson_groups[id.0].name,
            GroupRef::Neurons(id) => &self.neuron_groups[id.0].name,
        }
    }

    /// Connect `source` to `target` with a dense weight matrix of shape
    /// (source.n, target.n)
    pub fn connect(
        &mut self,
        name: &str,
        source: impl Into<GroupRef>,
        target: NeuronGroupId,
        target_var: SynapticTarget,
        weights: Array2<f64>,
    ) -> Result<usize> {
        let source = source.into();
        let expected = (self.group_size(source), self.neuron_groups[target.0].n);
        if weights.dim() != expected {
            return Err(CobaError::WeightShape {
                name: name.to_string(),
                expected,
                got: weights.dim(),
            });
        }
        debug!(
            connection = name,
            source = self.group_name(source),
            target = %self.neuron_groups[target.0].name,
            ?target_var,
            mean_weight = weights.mean().unwrap_or(0.0),
            "connected"
        );
        self.connections.push(Connection {
            name: name.to_string(),
            source,
            target,
            target_var,
            weights,
        });
        Ok(self.connections.len() - 1)
    }

    pub fn add_spike_monitor(&mut self, source: impl Into<GroupRef>) -> SpikeMonitorId {
        let source = source.into();
        let monitor = SpikeMonitor::new(source, self.group_name(source), self.group_size(source));
        self.spike_monitors.push(monitor);
        SpikeMonitorId(self.spike_monitors.len() - 1)
    }

    pub fn add_state_monitor(
        &mut self,
        source: NeuronGroupId,
        variables: &[StateVariable],
        indices: &[usize],
        every: usize,
    ) -> Result<StateMonitorId> {
        let group = &self.neuron_groups[source.0];
        if let Some(&index) = indices.iter().find(|&&i| i >= group.n) {
            return Err(CobaError::RecordIndex {
                group: group.name.clone(),
                index,
                n: group.n,
            });
        }
        let monitor = StateMonitor::new(source, &group.name, variables, indices, every);
        self.state_monitors.push(monitor);
        Ok(StateMonitorId(self.state_monitors.len() - 1))
    }

    pub fn spike_monitor(&self, id: SpikeMonitorId) -> &SpikeMonitor {
        &self.spike_monitors[id.0]
    }

    pub fn state_monitor(&self, id: StateMonitorId) -> &StateMonitor {
        &self.state_monitors[id.0]
    }

    pub fn total_synapses(&self) -> usize {
        self.connections.iter().map(Connection::n_synapses).sum()
    }

    /// Run simulation for given duration
    pub fn run(&mut self, duration: Time) -> Result<()> {
        self.run_with(duration, |_, _| {})
    }

    /// Run for `duration`, calling `on_progress(done, total)` every
    /// [`PROGRESS_STRIDE`] steps and once at the end
    pub fn run_with<F>(&mut self, duration: Time, mut on_progress: F) -> Result<()>
    where
        F: FnMut(usize, usize),
    {
        if !(duration.is_finite() && duration >= 0.0) {
            return Err(CoreError::InvalidParameter(format!(
                "duration must be non-negative, got {}",
                duration
            ))
            .into());
        }
        let n_steps = (duration / self.dt).round() as usize;
        info!(
            t_start = self.t,
            duration,
            dt = self.dt,
            n_steps,
            groups = self.neuron_groups.len() + self.poisson_groups.len(),
            synapses = self.total_synapses(),
            "running network"
        );

        for i in 0..n_steps {
            self.step()?;
            if (i + 1) % PROGRESS_STRIDE == 0 {
                on_progress(i + 1, n_steps);
            }
        }
        on_progress(n_steps, n_steps);

        info!(
            t = self.t,
            spikes = self.spike_monitors.iter().map(SpikeMonitor::n_events).sum::<usize>(),
            "run finished"
        );
        Ok(())
    }

    /// Single simulation step at the current clock time
    pub fn step(&mut self) -> Result<()> {
        let t = self.t;
        let dt = self.dt;

        for group in &mut self.neuron_groups {
            group.integrate(t, dt)?;
        }
        for group in &mut self.poisson_groups {
            group.emit(dt, &mut self.rng);
        }
        for group in &mut self.neuron_groups {
            group.threshold_and_reset(dt);
        }

        for monitor in &mut self.spike_monitors {
            let spikes = match monitor.source {
                GroupRef::Poisson(id) => self.poisson_groups[id.0].spikes(),
                GroupRef::Neurons(id) => self.neuron_groups[id.0].spikes(),
            };
            for &i in spikes {
                monitor.record_spike(i, t);
            }
        }

        // Detach the fired lists so recurrent connections can write into
        // the group they read from.
        let fired: Vec<Vec<usize>> = self
            .neuron_groups
            .iter_mut()
            .map(|g| std::mem::take(&mut g.spiked))
            .collect();
        for conn in &self.connections {
            let spikes = match conn.source {
                GroupRef::Poisson(id) => self.poisson_groups[id.0].spikes(),
                GroupRef::Neurons(id) => fired[id.0].as_slice(),
            };
            if !spikes.is_empty() {
                conn.propagate(spikes, &mut self.neuron_groups[conn.target.0]);
            }
        }
        for (group, spikes) in self.neuron_groups.iter_mut().zip(fired) {
            group.spiked = spikes;
        }

        for monitor in &mut self.state_monitors {
            monitor.record(self.steps, t, &self.neuron_groups[monitor.source.0]);
        }

        self.steps += 1;
        self.t = self.steps as f64 * dt;
        Ok(())
    }
}

// ============================================================================
// ANALYSIS
// ============================================================================

/// Mean firing rate (Hz) of `n_neurons` emitting `n_spikes` over `duration_ms`
pub fn mean_firing_rate(n_spikes: usize, n_neurons: usize, duration_ms: Time) -> Rate {
    if n_neurons == 0 || duration_ms <= 0.0 {
        return 0.0;
    }
    (n_spikes as f64) / (n_neurons as f64) / (duration_ms / 1000.0)
}

/// Coefficient of variation of the inter-spike intervals
pub fn cv_isi(spike_train: &[Time]) -> f64 {
    if spike_train.len() < 3 {
        return 0.0;
    }

    let isis: Vec<f64> = spike_train.windows(2).map(|w| w[1] - w[0]).collect();

    let mean = isis.iter().sum::<f64>() / isis.len() as f64;
    let variance = isis.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / isis.len() as f64;

    variance.sqrt() / mean
}

/// Mean CV of ISI over all neurons of a monitor with enough spikes
pub fn mean_cv_isi(monitor: &SpikeMonitor) -> Option<f64> {
    let cvs: Vec<f64> = monitor
        .spike_trains()
        .values()
        .filter(|train| train.len() >= 3)
        .map(|train| cv_isi(train))
        .collect();
    if cvs.is_empty() {
        None
    } else {
        Some(cvs.iter().sum::<f64>() / cvs.len() as f64)
    }
}

/// Pearson correlation coefficient, `None` for constant or empty input
pub fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < 2 {
        return None;
    }
    let (a, b) = (&a[..n], &b[..n]);
    let mean_a = a.iter().sum::<f64>() / n as f64;
    let mean_b = b.iter().sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let dx = x - mean_a;
        let dy = y - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    if var_a <= 0.0 || var_b <= 0.0 {
        return None;
    }
    Some(cov / (var_a.sqrt() * var_b.sqrt()))
}

/// Mean over recorded neurons of the correlation between `ge` and `gi`
pub fn conductance_correlation(monitor: &StateMonitor) -> Option<f64> {
    let ge = monitor.values(StateVariable::Ge)?;
    let gi = monitor.values(StateVariable::Gi)?;
    let rs: Vec<f64> = ge
        .iter()
        .zip(gi.iter())
        .filter_map(|(e, i)| pearson(e, i))
        .collect();
    if rs.is_empty() {
        None
    } else {
        Some(rs.iter().sum::<f64>() / rs.len() as f64)
    }
}

/// Population rate (Hz per neuron) in bins of `bin_size` ms
pub fn population_rate(
    monitor: &SpikeMonitor,
    bin_size: Time,
    duration: Time,
) -> TimeSeries {
    let mut ts = TimeSeries::new(&format!("{}.rate", monitor.source_name)).with_units("Hz");
    if bin_size <= 0.0 || duration <= 0.0 || monitor.counts.is_empty() {
        return ts;
    }
    let n_bins = (duration / bin_size).ceil() as usize;
    let mut hist = vec![0usize; n_bins];
    for &(_, t) in &monitor.spikes {
        let bin = (t / bin_size).floor() as usize;
        if bin < n_bins {
            hist[bin] += 1;
        }
    }
    let n = monitor.counts.len();
    for (b, &count) in hist.iter().enumerate() {
        ts.push(b as f64 * bin_size, mean_firing_rate(count, n, bin_size));
    }
    ts
}

// ============================================================================
// TESTS
// ============================================================================
