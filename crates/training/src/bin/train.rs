use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use training::{
    apply_overrides, ConfigOverride, RunContext, Trainer, TrainerStatus, TrainingConfig,
    TrainingError,
};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable checkpointed training CLI", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to a TOML or JSON training config"
    )]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<ConfigOverride>,

    #[arg(long, value_name = "PATH", help = "Resume from this checkpoint file")]
    resume: Option<PathBuf>,

    #[arg(long, default_value_t = 42, help = "Seed for initialization and data")]
    seed: u64,

    #[arg(long, help = "Stay on the CPU even when a GPU is available")]
    cpu: bool,

    #[arg(long, help = "Evaluate the best checkpoint on the test split after fitting")]
    test: bool,
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = TrainingConfig::load(&args.config)?;
    config = apply_overrides(config, &args.overrides)?;
    if let Some(path) = args.resume {
        config.runtime.resume_from_checkpoint = Some(path);
    }

    let context = if args.cpu {
        RunContext::new(args.seed)
    } else {
        RunContext::detect(args.seed)
    };
    let mut trainer = Trainer::new(config, context)?;

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    trainer.fit_with_shutdown(|| shutdown_flag.load(Ordering::Relaxed))?;
    if trainer.status() == TrainerStatus::Interrupted {
        warn!("stopped before max_epochs; skipping test");
        return Ok(());
    }

    if let Some(best) = trainer.best_model_path() {
        info!(best_model_path = %best.display(), "best checkpoint");
    }

    if args.test {
        let summary = match trainer.best_model_path().map(|path| path.to_path_buf()) {
            Some(best) => trainer.test_checkpoint(&best)?,
            None => trainer.test()?,
        };
        println!(
            "test loss={:.6} samples={}",
            summary.average_loss, summary.samples
        );
    }

    Ok(())
}
