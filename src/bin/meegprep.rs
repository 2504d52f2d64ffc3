/// meegprep: run the M/EEG preprocessing stages of one subject.
///
///   meegprep --config study.json maxwell
///   meegprep --config study.json all
///   meegprep simulate --out /tmp/sim          # synthetic study + study.json
///
/// Logging goes to stderr; set `RUST_LOG=debug` for numeric details.
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::info;

use meegprep::pipeline::{run_all, Stage};
use meegprep::simulate::{simulate_study, SimulationConfig};
use meegprep::StudyConfig;

#[derive(Parser, Debug)]
#[command(name = "meegprep", about = "M/EEG preprocessing pipeline", version)]
struct Args {
    /// Study configuration (JSON).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 01: bad MEG channels + SSS/tSSS.
    Maxwell,
    /// 02: bad EEG channels, interpolation, average reference.
    BadEeg,
    /// 03: blink and muscle annotations.
    Annotate,
    /// 04: events and trial metadata.
    Events,
    /// 05: fit ICA on all runs.
    IcaFit,
    /// 06: remove the excluded ICA components.
    IcaApply,
    /// 07: epochs of the concatenated runs.
    Epochs,
    /// A01: evoked responses per condition.
    Evoked,
    /// B01: time-frequency power per condition.
    Tfr,
    /// Every stage in order.
    All,
    /// Write a synthetic study and its configuration.
    Simulate {
        /// Output directory.
        #[arg(long)]
        out: PathBuf,

        /// Seconds per run.
        #[arg(long, default_value_t = 30.0)]
        duration: f64,

        /// Number of runs.
        #[arg(long, default_value_t = 2)]
        runs: usize,

        /// Simulate a subject recorded without EEG.
        #[arg(long)]
        no_eeg: bool,

        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
}

impl Command {
    fn stage(&self) -> Option<Stage> {
        Some(match self {
            Command::Maxwell => Stage::Maxwell,
            Command::BadEeg => Stage::BadEeg,
            Command::Annotate => Stage::Annotate,
            Command::Events => Stage::Events,
            Command::IcaFit => Stage::IcaFit,
            Command::IcaApply => Stage::IcaApply,
            Command::Epochs => Stage::Epochs,
            Command::Evoked => Stage::Evoked,
            Command::Tfr => Stage::Tfr,
            Command::All | Command::Simulate { .. } => return None,
        })
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<StudyConfig> {
    let path = path.context("--config <study.json> is required for pipeline stages")?;
    let cfg = StudyConfig::load(path)?;
    info!("study {} (experiment {}), output {}", cfg.study_stem(), u8::from(cfg.experiment), cfg.out_dir().display());
    Ok(cfg)
}

fn main() -> Result<()> {
    env_logger::init_from_env(Env::default().default_filter_or("info"));
    let args = Args::parse();
    let t0 = Instant::now();

    match &args.command {
        Command::Simulate { out, duration, runs, no_eeg, seed } => {
            let sim = SimulationConfig {
                run_duration: *duration,
                n_runs: *runs,
                with_eeg: !*no_eeg,
                seed: *seed,
                ..SimulationConfig::default()
            };
            let cfg = simulate_study(&sim, out)?;
            info!("wrote {} runs and {}", cfg.run_names().len(), out.join("study.json").display());
        }
        Command::All => run_all(&load_config(args.config.as_ref())?)?,
        cmd => {
            let cfg = load_config(args.config.as_ref())?;
            if let Some(stage) = cmd.stage() {
                stage.run(&cfg)?;
            }
        }
    }

    info!("done in {:.1} s", t0.elapsed().as_secs_f64());
    Ok(())
}
