//! Batch driver of preset datasets. See "config.rs" for the dataset configuration file.
//!
//! A typical run renders spectrograms (possibly split across processes with `--shard`),
//! then learnable presets:
//!
//! ```text
//! presetbake --config dexed.toml specs --shard 0/4   # one per process, 0/4 to 3/4
//! presetbake --config dexed.toml commit-specs --shards 4
//! presetbake --config dexed.toml presets
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use presetbake::{DatasetConfig, LogSpectrogram, PrerenderedSynth, PresetDataset, ShardSpec};

#[derive(Parser, Debug)]
#[command(version, about = "Generates and inspects the on-disk caches of synth preset datasets")]
struct CliArgs {
    /// Dataset configuration (TOML).
    #[arg(long, short)]
    config: PathBuf,

    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Renders spectrograms, computes their stats and normalizes them.
    Specs {
        /// Only render the presets of shard "index/count", without stats.
        #[arg(long)]
        shard: Option<ShardSpec>,
    },
    /// Merges the spectrograms of every shard, then computes stats and normalizes.
    CommitSpecs {
        #[arg(long)]
        shards: usize,
    },
    /// Computes the learnable presets and the class counts of categorical parameters.
    Presets,
    /// Lists presets having silent renders.
    ZeroVolume,
    /// Writes (or checks) the render constraints of the audio files.
    Constraints {
        #[arg(long)]
        write: bool,
    },
    /// Prints a summary of the dataset.
    Info,
    /// Deletes every spectrogram and stats file of the synth.
    Clean,
}

fn open_dataset(config_path: &Path) -> Result<PresetDataset<PrerenderedSynth>> {
    let config = DatasetConfig::load(config_path)
        .with_context(|| format!("Failed to load config '{}'", config_path.display()))?;
    let synth = PrerenderedSynth::open(&config)
        .with_context(|| format!("Failed to open synth '{}'", config.synth_name))?;
    Ok(PresetDataset::new(config, synth)?)
}

fn main() -> Result<()> {
    let cli_args = CliArgs::parse();
    presetbake::logging::init(cli_args.verbose).context("Failed to initialize logging")?;
    let mut dataset = open_dataset(&cli_args.config)?;

    match cli_args.command {
        Command::Specs { shard: None } => {
            let transform = LogSpectrogram::from_config(dataset.config());
            let stats = dataset.compute_and_store_spectrograms_and_stats(&transform)?;
            info!("Spectrograms ready, stats: {:?}", stats);
        }
        Command::Specs { shard: Some(shard) } => {
            let transform = LogSpectrogram::from_config(dataset.config());
            let report = dataset.render_shard(shard, &transform)?;
            info!(
                "Shard {} done: {} spectrograms in {:.1}s",
                shard,
                report.items,
                report.elapsed.as_secs_f64()
            );
        }
        Command::CommitSpecs { shards } => {
            let stats = dataset
                .commit_shards(shards)
                .with_context(|| format!("Failed to commit {shards} shards"))?;
            info!("Spectrograms ready, stats: {:?}", stats);
        }
        Command::Presets => {
            let counts = dataset.compute_and_store_learnable_presets()?;
            for (param_index, classes) in &counts {
                println!("Param {param_index}: {classes:?}");
            }
        }
        Command::ZeroVolume => {
            let uids = dataset.zero_volume_preset_uids()?;
            let indices = dataset.zero_volume_preset_indices()?;
            println!("{} zero-volume presets: {:?}", uids.len(), uids);
            println!("Dataset indices: {:?}", indices);
        }
        Command::Constraints { write: true } => {
            dataset.write_render_constraints()?;
            println!("Wrote '{}'", dataset.render_constraints_path().display());
        }
        Command::Constraints { write: false } => {
            dataset.check_render_constraints()?;
            println!("Audio files match the render constraints of this dataset.");
        }
        Command::Info => {
            println!("{dataset}");
            match dataset.normalization_stats() {
                Ok(stats) => println!("Normalization stats: {stats:?}"),
                Err(err) => println!("No normalization stats: {err}"),
            }
            println!("Spectrogram files: {}", dataset.spectrogram_cache().count_files()?);
        }
        Command::Clean => dataset.delete_all_spectrogram_data()?,
    }
    Ok(())
}
