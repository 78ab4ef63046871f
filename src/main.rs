use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use solvertext::progress::TrainingProgress;
use solvertext::training::data::{read_text_table, scan_labeled_files, FoldData};
use solvertext::utils::{init_logging, select_device};
use solvertext::{ClassifierTrainer, Config};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "solvertext")]
#[command(about = "Fine-tune BERT text classifiers on stratified folds", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train one fold
    Train {
        /// Configuration file (JSON, YAML or TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Validation fold; negative values count from the end
        #[arg(short, long, allow_negative_numbers = true)]
        fold: Option<i64>,

        /// Device selection, e.g. `cpu`, `0` or `cuda:1`
        #[arg(short, long)]
        gpus: Option<String>,

        /// Resume from a checkpoint
        #[arg(long)]
        resume: Option<PathBuf>,
    },

    /// Show per-fold row and class counts
    Split {
        /// Configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Validate a configuration file and print the resolved settings
    Config {
        /// Configuration file to validate
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Show system information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    init_logging(&format!("solvertext={}", level), cli.json_logs);

    match cli.command {
        Commands::Train {
            config,
            fold,
            gpus,
            resume,
        } => {
            let mut config = Config::load(config.as_deref()).context("Failed to load configuration")?;
            if let Some(fold) = fold {
                config.data.fold = fold;
            }
            if let Some(gpus) = gpus {
                config.device.gpus = gpus;
            }
            if resume.is_some() {
                config.training.resume_from = resume;
            }
            config.validate().context("Invalid configuration")?;
            train(config).await?;
        }

        Commands::Split { config } => {
            let config = Config::load(config.as_deref()).context("Failed to load configuration")?;
            show_split(&config)?;
        }

        Commands::Config { file } => {
            validate_config(file)?;
        }

        Commands::Info => {
            show_system_info();
        }
    }

    Ok(())
}

async fn train(config: Config) -> Result<()> {
    info!(
        "Training fold {} of {} ({})",
        config.fold(),
        config.data.n_splits,
        config.run_version()
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    let n_epochs = config.training.n_epochs as u64;
    let refresh_rate = config.logging.progress_bar_refresh_rate;

    let handle = tokio::task::spawn_blocking(move || -> solvertext::Result<_> {
        let device = select_device(&config.device.gpus)?;
        let mut trainer = ClassifierTrainer::from_config(&config, &device)?.with_event_monitoring(tx);
        trainer.fit()
    });

    let mut progress: Option<TrainingProgress> = None;
    while let Some(event) = rx.recv().await {
        if progress.is_none() {
            if let solvertext::TrainingEvent::EpochStarted { num_batches, .. } = &event {
                progress = Some(TrainingProgress::new(n_epochs, *num_batches as u64, refresh_rate)?);
            }
        }
        if let Some(progress) = progress.as_mut() {
            progress.handle(&event);
        }
    }

    match handle.await.context("Training task panicked")? {
        Ok(result) => {
            info!("Training complete in {:?}", result.training_duration);
            if let Some(summary) = result.history.last() {
                info!(
                    "Final epoch: valid_loss={:.4}, valid_metric={:.4}",
                    summary.valid_loss, summary.valid_metric
                );
            }
            if let Some(best) = &result.best_checkpoint_path {
                info!("Best checkpoint: {}", best.display());
            }
            info!("Last checkpoint: {}", result.last_checkpoint_path.display());
            Ok(())
        }
        Err(e) => {
            error!("Training failed: {}", e);
            Err(e.into())
        }
    }
}

fn show_split(config: &Config) -> Result<()> {
    let files = scan_labeled_files(&config.data.train_dir()).context("Failed to scan training files")?;
    let table = read_text_table(&config.data.text_table_path()).context("Failed to read text table")?;

    println!("{} labeled files, {} text rows", files.len(), table.len());
    for fold in 0..config.data.n_splits {
        let data = FoldData::from_parts(
            &files,
            &table,
            config.data.n_splits,
            fold,
            config.training.seed,
        )?;
        let mut classes: BTreeMap<u32, usize> = BTreeMap::new();
        for row in &data.valid {
            *classes.entry(row.label).or_default() += 1;
        }
        println!(
            "fold {}: {} train, {} valid, {} classes in valid",
            fold,
            data.train.len(),
            data.valid.len(),
            classes.len()
        );
    }
    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    info!("Validating configuration file: {}", config_path.display());

    let config = Config::from_file(&config_path).context("Failed to load configuration file")?;

    info!("Configuration is valid");
    info!("  - Model: {} ({} classes)", config.model.model_name, config.model.num_classes);
    info!(
        "  - Schedule: {} epochs, max lr {}, batch size {}",
        config.training.n_epochs, config.training.learning_rate, config.training.batch_size
    );
    info!("  - Fold: {} of {}", config.fold(), config.data.n_splits);
    println!("{}", serde_yaml::to_string(&config).context("Failed to render configuration")?);

    Ok(())
}

fn show_system_info() {
    println!("SolverText - BERT text classifier fine-tuning");
    println!();
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Hardware support:");

    #[cfg(feature = "cuda")]
    println!("  ✅ NVIDIA CUDA GPU acceleration");
    #[cfg(not(feature = "cuda"))]
    println!("  ❌ CUDA support (not compiled)");

    #[cfg(feature = "metal")]
    println!("  ✅ Apple Metal GPU acceleration");
    #[cfg(not(feature = "metal"))]
    println!("  ❌ Metal support (not compiled)");

    #[cfg(feature = "accelerate")]
    println!("  ✅ Apple Accelerate framework");
    #[cfg(not(feature = "accelerate"))]
    println!("  ❌ Accelerate support (not compiled)");

    println!("  ✅ CPU training");
    println!();
    println!("Usage:");
    println!("  solvertext train -c run.yaml --fold 0   # Train one fold");
    println!("  solvertext split -c run.yaml            # Show fold sizes");
    println!("  solvertext config -f run.yaml           # Validate configuration");
    println!("  solvertext info                         # Show this information");
}
