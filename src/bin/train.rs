//! densify-train: train a Gaussian Splatting scene with adaptive density control
//!
//! Usage:
//!   densify-train --iterations 3000 --views 12 --resolution 64
//!   densify-train --config run.json --resume runs/<dir>/chkpnt2000.ckpt
//!
//! The scene is synthetic (see `train_utils::synthetic`): targets are rendered
//! from hidden ground-truth blobs, and training starts from a sparse subset.

mod train_utils;

use anyhow::Context;
use clap::Parser;
use densify_rs::core::init_from_points;
use densify_rs::io::{load_checkpoint, save_checkpoint, Checkpoint};
use densify_rs::optim::{EvalReport, LossKind, TrainConfig, Trainer, TrainingHooks};
use densify_rs::render::AdditiveRasterizer;
use densify_rs::store::GaussianStore;
use nalgebra::Vector3;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use train_utils::synthetic::{self, SceneSpec};

#[derive(Parser, Debug)]
#[command(name = "densify-train", version)]
#[command(about = "Train a Gaussian Splatting scene with adaptive density control")]
struct Cli {
    /// JSON training config; missing keys keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Resume from a checkpoint file
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Output directory (default: runs/<timestamp>_<name>)
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Run name used for the default output directory
    #[arg(long, default_value = "synthetic")]
    name: String,

    #[arg(long)]
    iterations: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    /// Loss: l1 | l2 | l1-dssim (default)
    #[arg(long)]
    loss: Option<String>,

    #[arg(long)]
    densify_grad_threshold: Option<f32>,

    #[arg(long)]
    max_primitives: Option<usize>,

    #[arg(long)]
    white_background: bool,

    #[arg(long)]
    random_background: bool,

    /// Extra checkpoint iterations
    #[arg(long, value_delimiter = ',')]
    checkpoint_iterations: Vec<usize>,

    /// Ground-truth blobs in the synthetic scene
    #[arg(long, default_value_t = 48)]
    blobs: usize,

    /// Number of training views
    #[arg(long, default_value_t = 8)]
    views: usize,

    /// Square image size in pixels
    #[arg(long, default_value_t = 64)]
    resolution: u32,

    /// Initial points (before densification)
    #[arg(long, default_value_t = 16)]
    init_points: usize,

    /// Print the effective config as JSON and exit
    #[arg(long)]
    print_config: bool,
}

fn parse_loss(s: &str) -> anyhow::Result<LossKind> {
    match s {
        "l1" => Ok(LossKind::L1),
        "l2" => Ok(LossKind::L2),
        "l1-dssim" | "l1_dssim" | "l1dssim" => Ok(LossKind::L1Dssim),
        other => anyhow::bail!("unknown loss `{other}` (expected: l1 | l2 | l1-dssim)"),
    }
}

fn effective_config(cli: &Cli) -> anyhow::Result<TrainConfig> {
    let mut config = match &cli.config {
        Some(path) => TrainConfig::from_json_file(path)
            .with_context(|| format!("loading config `{}`", path.display()))?,
        None => TrainConfig::default(),
    };

    if let Some(iterations) = cli.iterations {
        config.iterations = iterations;
    }
    if let Some(seed) = cli.seed {
        config.seed = seed;
    }
    if let Some(loss) = &cli.loss {
        config.loss = parse_loss(loss)?;
    }
    if let Some(threshold) = cli.densify_grad_threshold {
        config.densify_grad_threshold = threshold;
    }
    if cli.max_primitives.is_some() {
        config.densify.max_primitives = cli.max_primitives;
    }
    config.white_background |= cli.white_background;
    config.random_background |= cli.random_background;
    config.checkpoint_iterations.extend(&cli.checkpoint_iterations);

    config.validate()?;
    Ok(config)
}

/// Create timestamped run directory
fn create_run_directory(name: &str) -> std::io::Result<PathBuf> {
    use time::OffsetDateTime;

    // UTC avoids platform-specific timezone lookup.
    let now = OffsetDateTime::now_utc();
    let sanitized = name.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_");
    let dir_name = format!(
        "runs/{:04}{:02}{:02}_{:02}{:02}_{}",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        sanitized
    );

    let mut path = PathBuf::from(&dir_name);
    let mut counter = 1;
    while path.exists() {
        path = PathBuf::from(format!("{}.{}", dir_name, counter));
        counter += 1;
    }

    std::fs::create_dir_all(&path)?;
    Ok(path)
}

/// Writes Gaussians, checkpoints and metrics under the run directory.
struct RunHooks {
    out_dir: PathBuf,
}

impl RunHooks {
    fn path(&self, name: impl AsRef<Path>) -> PathBuf {
        self.out_dir.join(name)
    }
}

impl TrainingHooks for RunHooks {
    fn on_test(&mut self, report: &EvalReport) -> anyhow::Result<()> {
        let line = serde_json::json!({
            "set": report.set,
            "iteration": report.iteration,
            "views": report.views,
            "l1": report.l1,
            "psnr": report.psnr,
            "primitives": report.num_primitives,
        });
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path("metrics.jsonl"))?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    fn on_save(&mut self, iteration: usize, store: &GaussianStore) -> anyhow::Result<()> {
        let dir = self.path("point_cloud");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("iteration_{iteration}.json"));
        let file = std::io::BufWriter::new(std::fs::File::create(&path)?);
        serde_json::to_writer(file, &store.to_gaussians())?;
        tracing::info!(path = %path.display(), "saved Gaussians");
        Ok(())
    }

    fn on_checkpoint(&mut self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        let path = self.path(format!("chkpnt{}.ckpt", checkpoint.iteration));
        save_checkpoint(&path, checkpoint)?;
        tracing::info!(path = %path.display(), "saved checkpoint");
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = effective_config(&cli)?;
    if cli.print_config {
        println!("{}", config.to_json()?);
        return Ok(());
    }
    tracing::info!(version = densify_rs::VERSION, "densify-train");

    let background = if config.white_background {
        Vector3::repeat(1.0)
    } else {
        Vector3::zeros()
    };
    let scene = synthetic::build(&SceneSpec {
        blobs: cli.blobs,
        views: cli.views,
        resolution: cli.resolution,
        init_points: cli.init_points,
        seed: config.seed,
        background,
    })?;

    let out_dir = match &cli.out_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            dir.clone()
        }
        None => create_run_directory(&cli.name)?,
    };
    std::fs::write(out_dir.join("config.json"), config.to_json()?)?;
    tracing::info!(out_dir = %out_dir.display(), "run directory");

    let rasterizer = Box::new(AdditiveRasterizer::default());
    let mut trainer = match &cli.resume {
        Some(path) => {
            let checkpoint =
                load_checkpoint(path).with_context(|| format!("loading checkpoint `{}`", path.display()))?;
            Trainer::from_checkpoint(config, &checkpoint, scene.views, rasterizer)?
        }
        None => {
            let initial = init_from_points(&scene.points);
            Trainer::new(config, &initial, scene.views, rasterizer)?
        }
    };

    let mut hooks = RunHooks { out_dir };
    trainer.run(&mut hooks)?;

    let final_checkpoint = hooks.path("final.ckpt");
    save_checkpoint(&final_checkpoint, &trainer.checkpoint())?;
    tracing::info!(
        primitives = trainer.store().len(),
        path = %final_checkpoint.display(),
        "done"
    );
    Ok(())
}
