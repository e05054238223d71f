//! # Cortex-RS: Thalamocortical Network with Log-Normal Weights
//!
//! Model of spontaneous activity in visual cortex from
//! Tan AY, Andoni S, Priebe NJ (2013), "A spontaneous state of weakly
//! correlated synaptic excitation and inhibition in visual cortex",
//! Neuroscience 247:364-75.
//!
//! Nine Poisson thalamic groups drive an excitatory (100) and an inhibitory
//! (25) cortical population plus ten readout neurons. All weights are
//! log-normal and fixed. Two weight presets reproduce the asynchronous
//! state (ge/gi correlation r ~ 0.3) and the up-down state (r ~ 0.8).
//!
//! ```text
//!   TC1..TC9 ──ge──▶ Ge ◀──gi── Gi
//!       │            │ ╲      ╱ │
//!       │            │   ╲  ╱   │
//!       └────ge────▶ RON ◀──────┘
//! ```

use ndarray::Array2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use thiserror::Error;
use tracing::info;
use v1net_coba::{
    conductance_correlation, lognormal_weights, mean_cv_isi, CobaError, CobaParams, GroupRef,
    Network, NeuronGroup, NeuronGroupId, PoissonGroup, PoissonGroupId, SpikeMonitorId,
    StateMonitorId, StateVariable, SynapticTarget,
};
use v1net_core::{CoreError, IntegrationMethod, Rate, SimulationParams, Time};

#[derive(Error, Debug)]
pub enum CortexError {
    #[error(transparent)]
    Coba(#[from] CobaError),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML write error: {0}")]
    TomlWrite(#[from] toml::ser::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CortexError>;

/// Overrides the configured seed
pub const ENV_SEED: &str = "V1NET_SEED";
/// Overrides the configured duration (ms)
pub const ENV_DURATION: &str = "V1NET_DURATION_MS";

// ============================================================================
// WEIGHTS AND PRESETS
// ============================================================================

/// Weight scale factors. Every matrix is `lognormal(mu, sigma) * scale`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightScales {
    /// Thalamocortical base weight
    pub wtc0: f64,
    /// Intracortical excitatory weight
    pub we: f64,
    /// Intracortical inhibitory weight
    pub wi: f64,
    /// Thalamic drive onto inhibitory relative to excitatory cells
    pub tcrie: f64,
    /// Cortical inhibition relative to excitation
    pub cxrie: f64,
    /// Attenuation of every projection onto the readout neurons
    pub readout_scale: f64,
    /// `wtc_k = wtc0 / thalamic_divisors[k]`
    pub thalamic_divisors: Vec<f64>,
    pub mu: f64,
    pub sigma: f64,
}

impl Default for WeightScales {
    fn default() -> Self {
        Self::up_down()
    }
}

impl WeightScales {
    /// Asynchronous state (r ~ 0.3)
    pub fn asynchronous() -> Self {
        Self {
            wtc0: 25.0,
            cxrie: 3.5,
            ..Self::up_down()
        }
    }

    /// Up and down state (r ~ 0.8)
    pub fn up_down() -> Self {
        Self {
            wtc0: 75.0,
            we: 2.0 / 100.0,
            wi: 2.0 / 100.0,
            tcrie: 2.0,
            cxrie: 1.0,
            readout_scale: 0.1,
            thalamic_divisors: vec![1000.0, 800.0, 400.0, 200.0, 100.0, 200.0, 400.0, 800.0, 1000.0],
            mu: 0.0,
            sigma: 1.0,
        }
    }

    /// Weight of thalamic group `k` (0-based)
    pub fn thalamic_weight(&self, k: usize) -> f64 {
        self.wtc0 / self.thalamic_divisors[k]
    }

    fn validate(&self) -> Result<()> {
        let scalars = [
            ("wtc0", self.wtc0),
            ("we", self.we),
            ("wi", self.wi),
            ("tcrie", self.tcrie),
            ("cxrie", self.cxrie),
            ("readout_scale", self.readout_scale),
        ];
        for (name, x) in scalars {
            if !(x.is_finite() && x >= 0.0) {
                return Err(CortexError::Config(format!(
                    "weights.{} must be finite and non-negative, got {}",
                    name, x
                )));
            }
        }
        if let Some(d) = self.thalamic_divisors.iter().find(|&&d| !(d.is_finite() && d > 0.0)) {
            return Err(CortexError::Config(format!(
                "weights.thalamic_divisors must be positive, got {}",
                d
            )));
        }
        if !(self.sigma.is_finite() && self.sigma >= 0.0) || !self.mu.is_finite() {
            return Err(CortexError::Config(format!(
                "invalid log-normal parameters mu = {}, sigma = {}",
                self.mu, self.sigma
            )));
        }
        Ok(())
    }
}

/// Named network states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Preset {
    Asynchronous,
    UpDown,
}

impl Preset {
    pub const ALL: [Preset; 2] = [Preset::Asynchronous, Preset::UpDown];

    pub fn name(&self) -> &'static str {
        match self {
            Preset::Asynchronous => "asynchronous",
            Preset::UpDown => "up-down",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Preset::Asynchronous => "Asynchronous state, weakly correlated ge/gi (r ~ 0.3)",
            Preset::UpDown => "Up and down state, strongly correlated ge/gi (r ~ 0.8)",
        }
    }

    pub fn weights(&self) -> WeightScales {
        match self {
            Preset::Asynchronous => WeightScales::asynchronous(),
            Preset::UpDown => WeightScales::up_down(),
        }
    }
}

impl std::str::FromStr for Preset {
    type Err = CortexError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "asynchronous" | "async" => Ok(Preset::Asynchronous),
            "up-down" | "updown" | "up_down" => Ok(Preset::UpDown),
            other => Err(CortexError::Config(format!("Unknown preset: {}", other))),
        }
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Population sizes and thalamic drive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PopulationSizes {
    pub thalamic_groups: usize,
    pub thalamic_size: usize,
    pub thalamic_rate: Rate,
    pub excitatory: usize,
    pub inhibitory: usize,
    pub readout: usize,
}

impl Default for PopulationSizes {
    fn default() -> Self {
        Self {
            thalamic_groups: 9,
            thalamic_size: 10,
            thalamic_rate: 1.0,
            excitatory: 100,
            inhibitory: 25,
            readout: 10,
        }
    }
}

/// Which neurons get their `v`, `ge`, `gi` recorded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub excitatory_indices: Vec<usize>,
    pub readout_indices: Vec<usize>,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            excitatory_indices: (0..100).step_by(10).collect(),
            readout_indices: (0..10).collect(),
        }
    }
}

/// Complete model configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CortexConfig {
    pub method: IntegrationMethod,
    pub simulation: SimulationParams,
    pub neuron: CobaParams,
    pub populations: PopulationSizes,
    pub weights: WeightScales,
    pub recording: RecordingConfig,
}

impl CortexConfig {
    pub fn from_preset(preset: Preset) -> Self {
        Self {
            weights: preset.weights(),
            ..Default::default()
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: CortexConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply [`ENV_SEED`] and [`ENV_DURATION`] from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(seed) = lookup(ENV_SEED) {
            self.simulation.seed = seed
                .trim()
                .parse()
                .map_err(|_| CortexError::Config(format!("{} is not a seed: {}", ENV_SEED, seed)))?;
        }
        if let Some(duration) = lookup(ENV_DURATION) {
            self.simulation.duration = duration.trim().parse().map_err(|_| {
                CortexError::Config(format!("{} is not a duration: {}", ENV_DURATION, duration))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.simulation.validate()?;
        self.neuron.validate()?;
        self.weights.validate()?;

        let pops = &self.populations;
        if pops.thalamic_size == 0 || pops.excitatory == 0 || pops.inhibitory == 0 || pops.readout == 0 {
            return Err(CortexError::Config("population sizes must be positive".into()));
        }
        if !(pops.thalamic_rate.is_finite() && pops.thalamic_rate >= 0.0) {
            return Err(CortexError::Config(format!(
                "thalamic_rate must be non-negative, got {}",
                pops.thalamic_rate
            )));
        }
        if self.weights.thalamic_divisors.len() != pops.thalamic_groups {
            return Err(CortexError::Config(format!(
                "{} thalamic divisors for {} thalamic groups",
                self.weights.thalamic_divisors.len(),
                pops.thalamic_groups
            )));
        }
        let checks = [
            ("excitatory", &self.recording.excitatory_indices, pops.excitatory),
            ("readout", &self.recording.readout_indices, pops.readout),
        ];
        for (name, indices, n) in checks {
            if let Some(i) = indices.iter().find(|&&i| i >= n) {
                return Err(CortexError::Config(format!(
                    "recording index {} out of range for {} population of size {}",
                    i, name, n
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// MODEL
// ============================================================================

/// The built network and handles to its parts
#[derive(Debug, Clone)]
pub struct CortexModel {
    pub config: CortexConfig,
    pub network: Network,
    pub thalamus: Vec<PoissonGroupId>,
    pub excitatory: NeuronGroupId,
    pub inhibitory: NeuronGroupId,
    pub readout: NeuronGroupId,
    pub excitatory_spikes: SpikeMonitorId,
    pub inhibitory_spikes: SpikeMonitorId,
    pub readout_spikes: SpikeMonitorId,
    pub excitatory_states: StateMonitorId,
    pub readout_states: StateMonitorId,
}

impl CortexModel {
    /// Create populations, draw every weight matrix and attach monitors
    pub fn build(config: &CortexConfig) -> Result<Self> {
        config.validate()?;
        let sim = &config.simulation;
        let pops = &config.populations;
        let w = &config.weights;

        info!(
            seed = sim.seed,
            wtc0 = w.wtc0,
            cxrie = w.cxrie,
            tcrie = w.tcrie,
            "building thalamocortical network"
        );

        let mut rng = ChaCha8Rng::seed_from_u64(sim.seed);
        let mut network = Network::new(sim.dt, sim.seed);

        let thalamus: Vec<PoissonGroupId> = (1..=pops.thalamic_groups)
            .map(|k| {
                network.add_poisson_group(PoissonGroup::new(
                    &format!("TC{}", k),
                    pops.thalamic_size,
                    pops.thalamic_rate,
                ))
            })
            .collect();

        let neurons = |name: &str, n: usize| {
            let mut group = NeuronGroup::new(name, n, config.neuron.clone()).with_method(config.method);
            for var in StateVariable::ALL {
                group.fill(var, 0.0);
            }
            group
        };
        let ge = network.add_neuron_group(neurons("Ge", pops.excitatory))?;
        let gi = network.add_neuron_group(neurons("Gi", pops.inhibitory))?;
        let ron = network.add_neuron_group(neurons("RON", pops.readout))?;

        let mut wire = |network: &mut Network,
                        source: GroupRef,
                        target: NeuronGroupId,
                        var: SynapticTarget,
                        scale: f64|
         -> Result<()> {
            let shape = (network.group_size(source), network.neuron_group(target).n);
            let weights: Array2<f64> = lognormal_weights(shape, w.mu, w.sigma, scale, &mut rng)?;
            let name = format!(
                "{}->{}",
                network.group_name(source),
                network.neuron_group(target).name
            );
            network.connect(&name, source, target, var, weights)?;
            Ok(())
        };

        use SynapticTarget::{Excitatory, Inhibitory};

        // Thalamocortical
        for (k, &tc) in thalamus.iter().enumerate() {
            let wtc = w.thalamic_weight(k);
            wire(&mut network, tc.into(), ge, Excitatory, wtc)?;
            wire(&mut network, tc.into(), gi, Excitatory, wtc * w.tcrie)?;
        }

        // Intracortical
        wire(&mut network, ge.into(), ge, Excitatory, w.we)?;
        wire(&mut network, ge.into(), gi, Excitatory, w.we)?;
        wire(&mut network, gi.into(), ge, Inhibitory, w.wi * w.cxrie)?;
        wire(&mut network, gi.into(), gi, Inhibitory, w.wi * w.cxrie)?;

        // Readout
        for (k, &tc) in thalamus.iter().enumerate() {
            wire(&mut network, tc.into(), ron, Excitatory, w.thalamic_weight(k) * w.readout_scale)?;
        }
        wire(&mut network, ge.into(), ron, Excitatory, w.we * w.readout_scale)?;
        wire(&mut network, gi.into(), ron, Inhibitory, w.wi * w.cxrie * w.readout_scale)?;

        let excitatory_spikes = network.add_spike_monitor(ge);
        let inhibitory_spikes = network.add_spike_monitor(gi);
        let readout_spikes = network.add_spike_monitor(ron);
        let excitatory_states = network.add_state_monitor(
            ge,
            &StateVariable::ALL,
            &config.recording.excitatory_indices,
            sim.record_every,
        )?;
        let readout_states = network.add_state_monitor(
            ron,
            &StateVariable::ALL,
            &config.recording.readout_indices,
            sim.record_every,
        )?;

        info!(
            groups = network.poisson_groups.len() + network.neuron_groups.len(),
            connections = network.connections.len(),
            synapses = network.total_synapses(),
            "network built"
        );

        Ok(Self {
            config: config.clone(),
            network,
            thalamus,
            excitatory: ge,
            inhibitory: gi,
            readout: ron,
            excitatory_spikes,
            inhibitory_spikes,
            readout_spikes,
            excitatory_states,
            readout_states,
        })
    }

    /// Run for the configured duration
    pub fn run(&mut self) -> Result<()> {
        self.run_with(|_, _| {})
    }

    pub fn run_with<F>(&mut self, on_progress: F) -> Result<()>
    where
        F: FnMut(usize, usize),
    {
        let duration = self.config.simulation.duration;
        self.network.run_with(duration, on_progress)?;
        Ok(())
    }

    /// Simulated time so far
    pub fn elapsed(&self) -> Time {
        self.network.t
    }

    pub fn recording(&self) -> Recording {
        let exc = self.network.state_monitor(self.excitatory_states);
        let ron = self.network.state_monitor(self.readout_states);
        let take = |m: &v1net_coba::StateMonitor, var| m.values(var).map(<[_]>::to_vec).unwrap_or_default();
        Recording {
            spikes: self.network.spike_monitor(self.excitatory_spikes).spikes.clone(),
            time: exc.times.clone(),
            v: take(exc, StateVariable::V),
            ge: take(exc, StateVariable::Ge),
            gi: take(exc, StateVariable::Gi),
            readout_v: take(ron, StateVariable::V),
            readout_ge: take(ron, StateVariable::Ge),
            readout_gi: take(ron, StateVariable::Gi),
        }
    }

    pub fn summary(&self) -> RunSummary {
        let elapsed = self.elapsed();
        let net = &self.network;
        let exc = net.spike_monitor(self.excitatory_spikes);
        RunSummary {
            seed: self.config.simulation.seed,
            duration: elapsed,
            excitatory_spikes: exc.n_events(),
            rate_exc: exc.mean_rate(elapsed),
            rate_inh: net.spike_monitor(self.inhibitory_spikes).mean_rate(elapsed),
            rate_readout: net.spike_monitor(self.readout_spikes).mean_rate(elapsed),
            cv_isi_exc: mean_cv_isi(exc),
            r_exc: conductance_correlation(net.state_monitor(self.excitatory_states)),
            r_readout: conductance_correlation(net.state_monitor(self.readout_states)),
        }
    }
}

// ============================================================================
// OUTPUT
// ============================================================================

/// Recorded arrays, keyed by the names the MATLAB analysis scripts expect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    /// (neuron, time_ms) spikes of the excitatory population
    #[serde(rename = "M")]
    pub spikes: Vec<(usize, Time)>,
    #[serde(rename = "Mtime")]
    pub time: Vec<Time>,
    #[serde(rename = "Mv")]
    pub v: Vec<Vec<f64>>,
    #[serde(rename = "Mge")]
    pub ge: Vec<Vec<f64>>,
    #[serde(rename = "Mgi")]
    pub gi: Vec<Vec<f64>>,
    #[serde(rename = "Mronv")]
    pub readout_v: Vec<Vec<f64>>,
    #[serde(rename = "Mronge")]
    pub readout_ge: Vec<Vec<f64>>,
    #[serde(rename = "Mrongi")]
    pub readout_gi: Vec<Vec<f64>>,
}

impl Recording {
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let file = fs::File::create(path)?;
        serde_json::to_writer(BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn read_json(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

/// Scalar outcome of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub seed: u64,
    pub duration: Time,
    pub excitatory_spikes: usize,
    pub rate_exc: Rate,
    pub rate_inh: Rate,
    pub rate_readout: Rate,
    pub cv_isi_exc: Option<f64>,
    /// Mean ge/gi correlation of the recorded excitatory neurons
    pub r_exc: Option<f64>,
    /// Mean ge/gi correlation of the recorded readout neurons
    pub r_readout: Option<f64>,
}

/// Run one independent simulation per seed in parallel, results in seed order
pub fn sweep(config: &CortexConfig, seeds: &[u64]) -> Result<Vec<RunSummary>> {
    info!(runs = seeds.len(), duration = config.simulation.duration, "starting seed sweep");
    seeds
        .par_iter()
        .map(|&seed| -> Result<RunSummary> {
            let mut config = config.clone();
            config.simulation.seed = seed;
            let mut model = CortexModel::build(&config)?;
            model.run()?;
            Ok(model.summary())
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn short_config(duration: Time) -> CortexConfig {
        let mut config = CortexConfig::default();
        config.simulation.duration = duration;
        config
    }

    fn connection<'a>(model: &'a CortexModel, name: &str) -> &'a v1net_coba::Connection {
        model
            .network
            .connections
            .iter()
            .find(|c| c.name == name)
            .unwrap()
    }

    #[test]
    fn test_preset_weights() {
        let up = WeightScales::up_down();
        assert!((up.thalamic_weight(0) - 0.075).abs() < 1e-12);
        assert!((up.thalamic_weight(4) - 0.75).abs() < 1e-12);
        assert!((up.thalamic_weight(8) - 0.075).abs() < 1e-12);
        assert_eq!(up.cxrie, 1.0);

        let asyn = WeightScales::asynchronous();
        assert!((asyn.thalamic_weight(4) - 0.25).abs() < 1e-12);
        assert_eq!(asyn.cxrie, 3.5);
        assert_eq!(asyn.tcrie, 2.0);
        assert_eq!(asyn.we, asyn.wi);
    }

    #[test]
    fn test_preset_from_str() {
        assert_eq!("up-down".parse::<Preset>().unwrap(), Preset::UpDown);
        assert_eq!("Asynchronous".parse::<Preset>().unwrap(), Preset::Asynchronous);
        assert!("burst".parse::<Preset>().is_err());
        for preset in Preset::ALL {
            assert_eq!(preset.name().parse::<Preset>().unwrap(), preset);
        }
    }

    #[test]
    fn test_build_topology() {
        let model = CortexModel::build(&CortexConfig::default()).unwrap();
        let net = &model.network;

        assert_eq!(net.poisson_groups.len(), 9);
        assert_eq!(net.neuron_groups.len(), 3);
        // 9 x (Ge, Gi) + 4 intracortical + 9 + 2 readout
        assert_eq!(net.connections.len(), 33);

        for conn in &net.connections {
            let expected = (net.group_size(conn.source), net.neuron_group(conn.target).n);
            assert_eq!(conn.weights.dim(), expected);
            assert!(conn.weights.iter().all(|&x| x >= 0.0));
        }

        assert_eq!(connection(&model, "TC5->Ge").weights.dim(), (10, 100));
        assert_eq!(connection(&model, "Gi->Ge").target_var, SynapticTarget::Inhibitory);
        assert_eq!(connection(&model, "Gi->RON").target_var, SynapticTarget::Inhibitory);
        assert_eq!(connection(&model, "TC1->Gi").target_var, SynapticTarget::Excitatory);
        assert_eq!(connection(&model, "Ge->Ge").weights.dim(), (100, 100));
    }

    #[test]
    fn test_thalamic_scaling() {
        let model = CortexModel::build(&CortexConfig::default()).unwrap();
        let mean = |name: &str| connection(&model, name).weights.mean().unwrap();

        // wtc5 / wtc1 = 10
        let ratio = mean("TC5->Ge") / mean("TC1->Ge");
        assert!(ratio > 6.0 && ratio < 16.0, "ratio = {}", ratio);

        // readout projections are attenuated tenfold
        let ratio = mean("Ge->Ge") / mean("Ge->RON");
        assert!(ratio > 6.0 && ratio < 16.0, "ratio = {}", ratio);
    }

    #[test]
    fn test_seed_determines_weights() {
        let a = CortexModel::build(&CortexConfig::default()).unwrap();
        let b = CortexModel::build(&CortexConfig::default()).unwrap();
        let mut config = CortexConfig::default();
        config.simulation.seed += 1;
        let c = CortexModel::build(&config).unwrap();

        assert_eq!(connection(&a, "Ge->Ge").weights, connection(&b, "Ge->Ge").weights);
        assert_ne!(connection(&a, "Ge->Ge").weights, connection(&c, "Ge->Ge").weights);
    }

    #[test]
    fn test_short_run_recording() {
        let mut model = CortexModel::build(&short_config(200.0)).unwrap();
        model.run().unwrap();
        let rec = model.recording();

        assert_eq!(rec.time.len(), 2000);
        assert_eq!(rec.v.len(), 10);
        assert_eq!(rec.readout_gi.len(), 10);
        assert!(rec.v.iter().all(|trace| trace.len() == 2000));
        let threshold = model.config.neuron.v_threshold;
        assert!(rec.v.iter().flatten().all(|&x| x <= threshold));
        assert!(rec.readout_v.iter().flatten().all(|&x| x <= threshold));
        assert!(rec.ge.iter().flatten().all(|&x| x >= 0.0));

        let span = rec.time.last().unwrap() - rec.time[0] + model.config.simulation.dt;
        assert!((span - 200.0).abs() < model.config.simulation.dt);

        let summary = model.summary();
        assert!((summary.duration - 200.0).abs() < 1e-9);
        assert_eq!(summary.excitatory_spikes, rec.spikes.len());
    }

    #[test]
    fn test_sparse_recording() {
        let mut config = short_config(100.0);
        config.simulation.record_every = 3;
        let mut model = CortexModel::build(&config).unwrap();
        model.run().unwrap();

        let rec = model.recording();
        // steps 0, 3, ..., 999
        assert_eq!(rec.time.len(), 334);
        assert!(rec.v.iter().all(|trace| trace.len() == 334));
        let monitor = model.network.state_monitor(model.excitatory_states);
        assert!((monitor.duration(config.simulation.dt) - 100.0).abs() < config.simulation.dt);
    }

    #[test]
    fn test_reset_value_recorded_at_spike() {
        let mut config = short_config(300.0);
        config.recording.excitatory_indices = (0..100).collect();
        let mut model = CortexModel::build(&config).unwrap();
        model.run().unwrap();

        let rec = model.recording();
        assert!(!rec.spikes.is_empty());
        let dt = config.simulation.dt;
        for &(idx, t) in &rec.spikes {
            let sample = (t / dt).round() as usize;
            assert_eq!(rec.v[idx][sample], config.neuron.v_reset);
        }
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let config = CortexConfig::from_preset(Preset::Asynchronous);
        let text = config.to_toml_string().unwrap();
        let parsed = CortexConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let text = r#"
            method = "exponential-euler"

            [simulation]
            duration = 1000.0
            seed = 7

            [weights]
            wtc0 = 25.0
            cxrie = 3.5
        "#;
        let config = CortexConfig::from_toml_str(text).unwrap();
        assert_eq!(config.method, IntegrationMethod::ExponentialEuler);
        assert_eq!(config.simulation.duration, 1000.0);
        assert_eq!(config.simulation.dt, 0.1);
        assert_eq!(config.simulation.seed, 7);
        assert_eq!(config.weights, WeightScales::asynchronous());
        assert_eq!(config.populations, PopulationSizes::default());
    }

    #[test]
    fn test_config_validation() {
        let mut config = CortexConfig::default();
        config.weights.thalamic_divisors.pop();
        assert!(matches!(config.validate(), Err(CortexError::Config(_))));

        let mut config = CortexConfig::default();
        config.recording.readout_indices.push(10);
        assert!(config.validate().is_err());

        let mut config = CortexConfig::default();
        config.weights.cxrie = -1.0;
        assert!(config.validate().is_err());

        let mut config = CortexConfig::default();
        config.simulation.dt = -0.1;
        assert!(matches!(config.validate(), Err(CortexError::Core(_))));

        assert!(CortexConfig::from_toml_str("[simulation]\nduration = \"long\"").is_err());
    }

    #[test]
    fn test_overrides() {
        let mut config = CortexConfig::default();
        let vars: HashMap<&str, &str> = [(ENV_SEED, "99"), (ENV_DURATION, " 500 ")].into_iter().collect();
        config
            .apply_overrides_from(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.simulation.seed, 99);
        assert_eq!(config.simulation.duration, 500.0);

        let err = config.apply_overrides_from(|k| (k == ENV_SEED).then(|| "abc".to_string()));
        assert!(err.is_err());
    }

    #[test]
    fn test_recording_json_export() {
        let mut model = CortexModel::build(&short_config(20.0)).unwrap();
        model.run().unwrap();
        let rec = model.recording();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nnetwork_lognormalw.json");
        rec.write_json(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        for key in ["\"M\"", "\"Mtime\"", "\"Mv\"", "\"Mge\"", "\"Mgi\"", "\"Mronv\"", "\"Mronge\"", "\"Mrongi\""] {
            assert!(text.contains(key), "missing {}", key);
        }
        let back = Recording::read_json(&path).unwrap();
        assert_eq!(back.time.len(), rec.time.len());
        assert_eq!(back.spikes.len(), rec.spikes.len());
        assert_eq!(back.readout_v.len(), rec.readout_v.len());
        let max_diff = back
            .v
            .iter()
            .flatten()
            .zip(rec.v.iter().flatten())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);
        assert!(max_diff < 1e-9);
    }

    #[test]
    fn test_sweep_keeps_seed_order() {
        let config = short_config(50.0);
        let summaries = sweep(&config, &[3, 1, 2]).unwrap();
        let seeds: Vec<u64> = summaries.iter().map(|s| s.seed).collect();
        assert_eq!(seeds, vec![3, 1, 2]);

        let mut model = CortexModel::build(&CortexConfig {
            simulation: SimulationParams { seed: 1, ..config.simulation.clone() },
            ..config.clone()
        })
        .unwrap();
        model.run().unwrap();
        assert_eq!(summaries[1], model.summary());
    }
}
