//! # v1net CLI
//!
//! Command-line interface for the thalamocortical network model.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use v1net_core::IntegrationMethod;
use v1net_cortex::{sweep, CortexConfig, CortexModel, Preset, RunSummary};

#[derive(Parser)]
#[command(name = "v1net")]
#[command(author = "Yatrogenesis")]
#[command(version = "0.1.0")]
#[command(about = "Spiking thalamocortical network with log-normal weights", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug); RUST_LOG takes precedence
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct ModelArgs {
    /// Weight preset (asynchronous, up-down)
    #[arg(short, long)]
    preset: Option<String>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Simulated duration (ms)
    #[arg(short, long)]
    duration: Option<f64>,

    /// Integration step (ms)
    #[arg(long)]
    dt: Option<f64>,

    /// Integration method (euler, exponential-euler)
    #[arg(short, long)]
    method: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and run the network once
    Run {
        #[command(flatten)]
        model: ModelArgs,

        /// Random seed for weights and thalamic input
        #[arg(short, long)]
        seed: Option<u64>,

        /// Write recorded arrays as JSON
        #[arg(short, long)]
        export: Option<PathBuf>,
    },

    /// Run independent seeds in parallel and tabulate the results
    Sweep {
        #[command(flatten)]
        model: ModelArgs,

        /// Number of seeds
        #[arg(short = 'n', long, default_value_t = 8)]
        seeds: u64,

        /// First seed of the range
        #[arg(long, default_value_t = 1)]
        first_seed: u64,
    },

    /// List weight presets
    Presets,

    /// Print the effective configuration as TOML
    Config {
        #[command(flatten)]
        model: ModelArgs,
    },
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_config(args: &ModelArgs) -> anyhow::Result<CortexConfig> {
    resolve_config_with(args, |key| std::env::var(key).ok())
}

/// Defaults or file, then preset, then environment, then flags
fn resolve_config_with<F>(args: &ModelArgs, env: F) -> anyhow::Result<CortexConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match &args.config {
        Some(path) => CortexConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => CortexConfig::default(),
    };
    if let Some(name) = &args.preset {
        let preset: Preset = name.parse()?;
        config.weights = preset.weights();
    }
    config.apply_overrides_from(env)?;
    if let Some(duration) = args.duration {
        config.simulation.duration = duration;
    }
    if let Some(dt) = args.dt {
        config.simulation.dt = dt;
    }
    if let Some(method) = &args.method {
        config.method = method.parse::<IntegrationMethod>()?;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// `n` consecutive seeds starting at `first`
fn seed_range(first: u64, n: u64) -> anyhow::Result<Vec<u64>> {
    (0..n)
        .map(|i| first.checked_add(i))
        .collect::<Option<Vec<u64>>>()
        .with_context(|| format!("{} seeds starting at {} overflow u64", n, first))
}

fn fmt_opt(x: Option<f64>) -> String {
    x.map(|v| format!("{:.3}", v)).unwrap_or_else(|| "-".into())
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("{}", "Run summary:".green().bold());
    println!("  seed            {}", summary.seed);
    println!("  simulated       {:.1} ms", summary.duration);
    println!("  Ge spikes       {}", summary.excitatory_spikes);
    println!("  rate Ge         {:.3} Hz", summary.rate_exc);
    println!("  rate Gi         {:.3} Hz", summary.rate_inh);
    println!("  rate RON        {:.3} Hz", summary.rate_readout);
    println!("  CV ISI Ge       {}", fmt_opt(summary.cv_isi_exc));
    println!("  r(ge, gi) Ge    {}", fmt_opt(summary.r_exc).cyan());
    println!("  r(ge, gi) RON   {}", fmt_opt(summary.r_readout).cyan());
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Run { model, seed, export } => {
            let mut config = resolve_config(&model)?;
            if let Some(seed) = seed {
                config.simulation.seed = seed;
            }

            println!(
                "{} {:.0} ms at dt = {} ms (seed {})",
                "Simulating".green().bold(),
                config.simulation.duration,
                config.simulation.dt,
                config.simulation.seed
            );

            let mut net = CortexModel::build(&config).context("building network")?;

            let bar = ProgressBar::new(config.simulation.n_steps() as u64);
            bar.set_style(
                ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} steps ({eta})")?
                    .progress_chars("=> "),
            );
            net.run_with(|done, _| bar.set_position(done as u64))
                .context("running network")?;
            bar.finish_and_clear();

            print_summary(&net.summary());

            if let Some(path) = export {
                net.recording()
                    .write_json(&path)
                    .with_context(|| format!("writing {}", path.display()))?;
                info!(path = %path.display(), "recording exported");
                println!("  {} {}", "Exported:".green(), path.display());
            }
        }

        Commands::Sweep { model, seeds, first_seed } => {
            let config = resolve_config(&model)?;
            let seeds = seed_range(first_seed, seeds)?;
            println!(
                "{} {} seeds of {:.0} ms",
                "Sweeping".green().bold(),
                seeds.len(),
                config.simulation.duration
            );

            let summaries = sweep(&config, &seeds).context("seed sweep")?;

            println!();
            println!(
                "  {:>6} {:>10} {:>10} {:>10} {:>8} {:>8}",
                "seed", "Ge (Hz)", "Gi (Hz)", "RON (Hz)", "r Ge", "r RON"
            );
            for s in &summaries {
                println!(
                    "  {:>6} {:>10.3} {:>10.3} {:>10.3} {:>8} {:>8}",
                    s.seed,
                    s.rate_exc,
                    s.rate_inh,
                    s.rate_readout,
                    fmt_opt(s.r_exc),
                    fmt_opt(s.r_readout)
                );
            }

            let rs: Vec<f64> = summaries.iter().filter_map(|s| s.r_exc).collect();
            if !rs.is_empty() {
                let mean = rs.iter().sum::<f64>() / rs.len() as f64;
                println!();
                println!("  mean r(ge, gi) Ge: {}", format!("{:.3}", mean).cyan().bold());
            }
        }

        Commands::Presets => {
            println!("{}", "Weight presets:".green().bold());
            println!();
            for preset in Preset::ALL {
                let w = preset.weights();
                println!("  {} - {}", preset.name().cyan(), preset.description());
                println!(
                    "      wtc0 = {}, we = {}, wi = {}, tcrie = {}, cxrie = {}",
                    w.wtc0, w.we, w.wi, w.tcrie, w.cxrie
                );
            }
        }

        Commands::Config { model } => {
            let config = resolve_config(&model)?;
            print!("{}", config.to_toml_string()?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use v1net_cortex::{WeightScales, ENV_DURATION, ENV_SEED};

    fn model_args(config: Option<PathBuf>) -> ModelArgs {
        ModelArgs {
            preset: None,
            config,
            duration: None,
            dt: None,
            method: None,
        }
    }

    fn env_of(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    fn write_config(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("v1net.toml");
        let text = r#"
            method = "exponential-euler"

            [simulation]
            duration = 1000.0
            dt = 0.05
            seed = 5

            [weights]
            wtc0 = 25.0
            cxrie = 3.5
        "#;
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn test_defaults_without_overrides() {
        let config = resolve_config_with(&model_args(None), env_of(&[])).unwrap();
        assert_eq!(config, CortexConfig::default());
    }

    #[test]
    fn test_config_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = model_args(Some(write_config(&dir)));

        // file alone
        let config = resolve_config_with(&args, env_of(&[])).unwrap();
        assert_eq!(config.weights, WeightScales::asynchronous());
        assert_eq!(config.simulation.seed, 5);
        assert_eq!(config.method, IntegrationMethod::ExponentialEuler);

        // preset over file, environment over file
        args.preset = Some("up-down".into());
        let env = env_of(&[(ENV_SEED, "9"), (ENV_DURATION, "500")]);
        let config = resolve_config_with(&args, &env).unwrap();
        assert_eq!(config.weights, WeightScales::up_down());
        assert_eq!(config.simulation.seed, 9);
        assert_eq!(config.simulation.duration, 500.0);
        assert_eq!(config.simulation.dt, 0.05);

        // flags over environment
        args.duration = Some(200.0);
        args.dt = Some(0.1);
        args.method = Some("euler".into());
        let config = resolve_config_with(&args, &env).unwrap();
        assert_eq!(config.simulation.duration, 200.0);
        assert_eq!(config.simulation.dt, 0.1);
        assert_eq!(config.method, IntegrationMethod::Euler);
        assert_eq!(config.simulation.seed, 9);
    }

    #[test]
    fn test_invalid_overrides_rejected() {
        let mut args = model_args(None);
        args.preset = Some("burst".into());
        assert!(resolve_config_with(&args, env_of(&[])).is_err());

        let mut args = model_args(None);
        args.dt = Some(-0.1);
        assert!(resolve_config_with(&args, env_of(&[])).is_err());

        let args = model_args(None);
        assert!(resolve_config_with(&args, env_of(&[(ENV_SEED, "x")])).is_err());

        let args = model_args(Some(PathBuf::from("/nonexistent/v1net.toml")));
        assert!(resolve_config_with(&args, env_of(&[])).is_err());
    }

    #[test]
    fn test_seed_range() {
        assert_eq!(seed_range(1, 3).unwrap(), vec![1, 2, 3]);
        assert!(seed_range(7, 0).unwrap().is_empty());
        assert_eq!(seed_range(u64::MAX, 1).unwrap(), vec![u64::MAX]);
        assert!(seed_range(u64::MAX - 1, 3).is_err());
    }
}
