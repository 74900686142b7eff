//! knockcap CLI
//!
//! Replays recorded audio through the knock capture engine and writes the
//! resulting recordings to disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;

use knockcap::audio::AudioFormat;
use knockcap::metrics::MetricsRegistry;
use knockcap::replay::{replay, ReplayOptions};
use knockcap::{Config, WavFileSink};

#[derive(Parser)]
#[command(name = "knockcap")]
#[command(version)]
#[command(about = "Knock-triggered audio capture", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a 16-bit PCM WAV file as a live stream
    Replay {
        /// Input WAV file
        #[arg(long, short)]
        input: PathBuf,

        /// JSON configuration file
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Output directory (overrides the configuration)
        #[arg(long, short)]
        out: Option<PathBuf>,

        /// Drop a session still open at end of input instead of finalizing it
        #[arg(long)]
        discard_open: bool,

        /// Milliseconds of audio fed per step (defaults to the detector frame)
        #[arg(long)]
        chunk_ms: Option<u32>,
    },

    /// Print the default configuration
    DefaultConfig,
}

fn main() -> Result<()> {
    knockcap::init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Replay {
            input,
            config,
            out,
            discard_open,
            chunk_ms,
        } => {
            let mut config = match config {
                Some(path) => Config::load(&path)
                    .with_context(|| format!("loading config {}", path.display()))?,
                None => Config::default(),
            };
            if let Some(out) = out {
                config.output_dir = out;
            }
            let options = ReplayOptions {
                start: Utc::now(),
                chunk_ms,
                discard_open,
            };
            run_replay(&input, config, &options)
        }
        Commands::DefaultConfig => {
            println!("{}", serde_json::to_string_pretty(&Config::default())?);
            Ok(())
        }
    }
}

fn run_replay(input: &Path, mut config: Config, options: &ReplayOptions) -> Result<()> {
    let mut reader = hound::WavReader::open(input)
        .with_context(|| format!("opening {}", input.display()))?;
    let spec = reader.spec();
    if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
        bail!(
            "{}: need 16-bit integer PCM, got {} bit {:?}",
            input.display(),
            spec.bits_per_sample,
            spec.sample_format
        );
    }
    let samples = reader
        .samples::<i16>()
        .collect::<Result<Vec<_>, _>>()
        .context("decoding samples")?;

    // The file's format wins over the configured one.
    config.ring.sample_rate = spec.sample_rate;
    config.ring.channels = spec.channels;
    config.validate()?;
    let format = AudioFormat {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        bit_depth: 16,
    };

    let sink = Arc::new(WavFileSink::new(&config.output_dir)?);
    let metrics = Arc::new(MetricsRegistry::new());
    let summary = replay(&samples, format, &config, sink, Arc::clone(&metrics), options);

    for artifact in &summary.artifacts {
        println!(
            "{}  {:.2}s  pre-roll {:.2}s  knocks {}{}",
            artifact.id,
            artifact.duration_secs,
            artifact.pre_roll_secs,
            artifact.detected_knocks.len(),
            if artifact.is_partial() { "  (partial)" } else { "" }
        );
    }
    for (metric, m) in metrics.summary() {
        info!(%metric, p50 = m.p50, p95 = m.p95, max = m.max, count = m.count, "metric");
    }
    if summary.sink_failures > 0 {
        bail!("{} recording(s) could not be written", summary.sink_failures);
    }
    Ok(())
}
