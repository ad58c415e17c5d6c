//! Binary entry point: daemon mode or one-shot generation.

use std::time::Instant;

use tracing::info;
use tracing_subscriber::EnvFilter;

use cadenced::audio::{samples_to_duration, write_wav, ChannelLayout};
use cadenced::cli::Cli;
use cadenced::error::Result;
use cadenced::models::ace_step::SchedulerType;
use cadenced::models::{fetch_backend_assets, is_installed, load_backend, Backend, GenerateSpec};
use cadenced::types::CancelFlag;

fn main() {
    // stdout carries protocol lines only; all human output goes to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("fatal: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();
    let config = cli.build_config()?;

    if cli.is_daemon_mode() {
        return cadenced::rpc::run(config);
    }
    if cli.is_one_shot() {
        return one_shot(&cli, config);
    }

    eprintln!("nothing to do: pass --daemon, or --prompt \"...\" for a one-shot render");
    eprintln!("see --help for options");
    Ok(())
}

/// Generates a single track to a WAV file, fetching assets if needed.
/// Exercises the same engines as daemon mode.
fn one_shot(cli: &Cli, config: cadenced::DaemonConfig) -> Result<()> {
    let prompt = cli.prompt.as_deref().unwrap_or_default();
    let backend = match &cli.backend {
        Some(name) => Backend::parse(name)
            .ok_or_else(|| cadenced::DaemonError::invalid_backend(name.clone()))?,
        None => config.default_backend,
    };
    let seed = cli.seed.unwrap_or_else(rand::random);
    let output = cli.output_path();

    let model_dir = config.model_dir(backend);
    if !is_installed(backend, &model_dir) {
        info!(%backend, "assets missing, downloading");
        fetch_backend_assets(backend, &model_dir, &mut |p| {
            info!(
                component = %p.component,
                percent = p.component_percent,
                overall = p.overall_percent,
                "downloading"
            );
        })?;
    }

    info!(%backend, prompt, duration = cli.duration, seed, "one-shot generation");
    let mut models = load_backend(backend, &config)?;

    let spec = GenerateSpec {
        prompt: prompt.to_string(),
        duration_sec: cli.duration,
        seed,
        inference_steps: config.ace_step_default_steps,
        scheduler: SchedulerType::parse(&config.ace_step_default_scheduler).unwrap_or_default(),
        guidance_scale: config.ace_step_default_guidance,
    };

    let started = Instant::now();
    let samples = models.generate(&spec, &CancelFlag::new(), &|done, total| {
        if total > 0 && done % (total / 10).max(1) == 0 {
            info!(done, total, "progress");
        }
    })?;
    let took = started.elapsed().as_secs_f32();

    let sample_rate = backend.sample_rate();
    write_wav(&samples, &output, sample_rate, ChannelLayout::Mono)?;

    info!(
        path = %output.display(),
        audio_sec = samples_to_duration(samples.len(), sample_rate),
        took_sec = took,
        "done"
    );
    Ok(())
}
