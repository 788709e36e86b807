//! CLI Entry Point for imu_daq
//!
//! Provides command-line interface for:
//! - Recording labeled repetitions from the configured IMUs
//! - Live classification of repetitions with a trained model
//! - Training and comparing classifiers on recorded data
//! - Exporting per-repetition feature tables
//!
//! # Usage
//!
//! Record (interactive, commands on stdin):
//! ```bash
//! imu_daq record
//! > start correcto
//! > stop
//! > raw off
//! > quit
//! ```
//!
//! Train on the labeled file and save the best model:
//! ```bash
//! imu_daq train
//! ```
//!
//! Try everything without hardware:
//! ```bash
//! imu_daq --simulate live
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use imu_daq::acquisition::AcquisitionController;
use imu_daq::adapters::{MockPortOpener, PortOpener, SerialPortOpener};
use imu_daq::classifier::model::Model;
use imu_daq::classifier::training::{train_and_save, Dataset, TrainingPipeline};
use imu_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use imu_daq::data::features::FeatureExtractor;
use imu_daq::data::storage::{write_feature_table, CsvStorage};
use imu_daq::messages::AcquisitionEvent;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Line rate of simulated sensors.
const SIMULATED_RATE_HZ: f64 = 100.0;

/// How long to wait for queued events to be printed on exit.
const PRINTER_DRAIN: std::time::Duration = std::time::Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "imu_daq")]
#[command(about = "Multi-IMU repetition capture and classification", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Replace serial ports with simulated sensors
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record labeled repetitions
    Record {
        /// First rep_id to assign (default: continue after the labeled file)
        #[arg(long)]
        first_rep_id: Option<u64>,
    },

    /// Record and classify every repetition
    Live {
        /// Model artifact (default: model.path from the configuration)
        #[arg(long)]
        model: Option<PathBuf>,
    },

    /// Train the configured algorithms and save the best model
    Train {
        /// Labeled segments file (default: storage paths from the configuration)
        #[arg(long)]
        input: Option<PathBuf>,

        /// Model artifact (default: model.path from the configuration)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Write one feature row per repetition
    Features {
        /// Labeled segments file (default: storage paths from the configuration)
        #[arg(long)]
        input: Option<PathBuf>,

        /// Output CSV
        #[arg(long, default_value = "features.csv")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    imu_daq::logging::init(&settings.application)?;
    info!(config = %cli.config.display(), "Configuration loaded");

    match cli.command {
        Commands::Record { first_rep_id } => {
            let mut controller = build_controller(settings, cli.simulate);
            if let Some(first) = first_rep_id {
                controller = controller.with_first_rep_id(first);
            }
            run_session(controller).await
        }
        Commands::Live { model } => {
            let path = model.unwrap_or_else(|| settings.model.path.clone());
            let model = Model::load(&path)
                .with_context(|| format!("Failed to load model from {}", path.display()))?;
            println!("Model: {} ({:?})", model.algorithm_name, model.classes);
            let controller = build_controller(settings, cli.simulate).with_classifier(Arc::new(model));
            run_session(controller).await
        }
        Commands::Train { input, output } => train(settings, input, output),
        Commands::Features { input, output } => export_features(settings, input, output),
    }
}

fn build_controller(settings: Settings, simulate: bool) -> AcquisitionController {
    let opener: Arc<dyn PortOpener> = if simulate {
        let mut opener = MockPortOpener::new();
        for sensor in &settings.sensors {
            opener = opener.with_simulated(sensor.port.clone(), SIMULATED_RATE_HZ, None);
        }
        Arc::new(opener)
    } else {
        Arc::new(SerialPortOpener::new())
    };
    let storage = Arc::new(CsvStorage::from_settings(&settings));
    AcquisitionController::new(settings, opener, storage)
}

async fn run_session(mut controller: AcquisitionController) -> Result<()> {
    let mut events = controller.events().channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });

    controller.start_recording().await?;
    println!("Labels: {:?}", controller.settings().labels);
    println!("Commands: start <label> | stop | raw on|off | quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        let mut words = line.split_whitespace();
        match (words.next(), words.next()) {
            (Some("start"), Some(label)) => match controller.start_segment(label).await {
                Ok(Some(_)) => {}
                Ok(None) => println!("A segment is already open"),
                Err(e) => println!("Cannot start segment: {}", e),
            },
            (Some("stop"), None) => match controller.stop_segment().await {
                Ok(Some(report)) => println!(
                    "rep {} ({}): {} readings, {:.2} s",
                    report.segment.rep_id,
                    report.segment.label,
                    report.segment.len(),
                    report.features.duration
                ),
                Ok(None) => println!("No readings recorded"),
                Err(e) => println!("Segment stop failed: {}", e),
            },
            (Some("raw"), Some("on")) => controller.set_raw_logging(true),
            (Some("raw"), Some("off")) => controller.set_raw_logging(false),
            (Some("quit"), None) => break,
            (None, _) => {}
            _ => println!("Unknown command: {}", line.trim()),
        }
    }

    let stopped = controller.stop_recording().await;
    drop(controller);
    if tokio::time::timeout(PRINTER_DRAIN, printer).await.is_err() {
        warn!("Event printer did not finish");
    }
    stopped?;
    Ok(())
}

fn print_event(event: &AcquisitionEvent) {
    match event {
        AcquisitionEvent::DataReady(_) => {}
        AcquisitionEvent::RecordingStarted => println!("Recording started"),
        AcquisitionEvent::RecordingStopped => println!("Recording stopped"),
        AcquisitionEvent::SegmentStarted { label, rep_id } => {
            println!("Segment {} started ({})", rep_id, label)
        }
        AcquisitionEvent::SegmentStopped { rep_id } => println!("Segment {} stopped", rep_id),
        AcquisitionEvent::PredictionReady { label, probability } => {
            println!("Prediction: {} ({:.0}%)", label, probability * 100.0)
        }
        AcquisitionEvent::Error(report) => eprintln!("Error: {}", report),
    }
}

fn labeled_input(settings: &Settings, input: Option<PathBuf>) -> PathBuf {
    input.unwrap_or_else(|| settings.labeled_path())
}

fn train(settings: Settings, input: Option<PathBuf>, output: Option<PathBuf>) -> Result<()> {
    let input = labeled_input(&settings, input);
    let output = output.unwrap_or_else(|| settings.model.path.clone());
    let extractor = FeatureExtractor::new(settings.features.timestamp_unit);

    let dataset = Dataset::from_labeled_csv(&input, &extractor)
        .with_context(|| format!("Failed to load {}", input.display()))?;
    println!("Repetitions: {}", dataset.len());

    let pipeline = TrainingPipeline::from_config(&settings.training);
    let report = train_and_save(&pipeline, &dataset, &output)?;

    println!(
        "Train/test: {}/{}  classes: {:?}",
        report.train_size, report.test_size, report.classes
    );
    for (i, candidate) in report.candidates.iter().enumerate() {
        let marker = if i == report.best { "*" } else { " " };
        println!(
            "{} {:<14} test {:.2}  cv({}) {:.2} ± {:.2}",
            marker, candidate.name, candidate.accuracy, candidate.folds, candidate.cv_mean, candidate.cv_std
        );
        for (label, row) in report.classes.iter().zip(&candidate.confusion) {
            println!("      {:<12} {:?}", label, row);
        }
    }
    println!("Model saved to {}", output.display());
    Ok(())
}

fn export_features(settings: Settings, input: Option<PathBuf>, output: PathBuf) -> Result<()> {
    let input = labeled_input(&settings, input);
    let extractor = FeatureExtractor::new(settings.features.timestamp_unit);
    let dataset = Dataset::from_labeled_csv(&input, &extractor)
        .with_context(|| format!("Failed to load {}", input.display()))?;

    let rows: Vec<_> = dataset
        .samples
        .into_iter()
        .map(|s| (s.rep_id, s.label, s.features))
        .collect();
    write_feature_table(&output, &rows)?;
    println!("{} repetitions written to {}", rows.len(), output.display());
    Ok(())
}
