mod cli;

use std::panic;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use modelport_models::utils::load_labels;
use modelport_models::{
    add_rotated_rects, verify_round_trip, InferenceResult, Model, ModelOptions, OutputTransform,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return ExitCode::FAILURE;
        }
    };
    init_tracing(cli.log.as_deref());

    match panic::catch_unwind(|| run(&cli)) {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(err)) if is_recognised(&err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
        Ok(Err(err)) => {
            tracing::error!(error = ?err, "unrecognised failure");
            eprintln!("Unknown/internal exception happened.");
            ExitCode::FAILURE
        }
        Err(_) => {
            eprintln!("Unknown/internal exception happened.");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(log: Option<&str>) {
    let filter = match log {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: &Cli) -> Result<()> {
    let image = image::open(&cli.image)
        .with_context(|| format!("reading image {}", cli.image.display()))?
        .to_rgb8();

    let mut options = ModelOptions::default().device(cli.device.clone());
    if let Some(kind) = cli.kind {
        options = options.kind(kind);
    }
    if let Some(path) = &cli.labels {
        options = options.labels(load_labels(path)?);
    }
    let mut model = Model::create_model_with(&cli.model, options)?;
    info!(model = %cli.model.display(), kind = %model.kind(), device = %model.device(), "model loaded");

    let result = if cli.verify_roundtrip {
        let scratch = tempfile::tempdir().context("creating scratch directory")?;
        let report = verify_round_trip(&mut model, &image, &scratch.path().join("model.json"))?;
        info!(objects = report.original.len(), "round trip verified");
        report.original
    } else {
        model.infer(&image)?
    };
    let result = match cli.output_resolution {
        Some(resolution) => {
            let transform = OutputTransform::new(image.dimensions(), resolution)
                .context("output resolution must be non-zero")?;
            info!(scale = transform.scale_factor(), "rescaling results");
            transform.apply(&result)
        }
        None => result,
    };
    print_result(&result, cli.rotated_rects);

    if let Some(dest) = &cli.save {
        model.serialize(dest)?;
    }
    Ok(())
}

fn print_result(result: &InferenceResult, rotated_rects: bool) {
    match result {
        InferenceResult::Classification(items) => items.iter().for_each(|c| println!("{c}")),
        InferenceResult::Detection(items) => items.iter().for_each(|d| println!("{d}")),
        InferenceResult::InstanceSegmentation(items) if rotated_rects => {
            add_rotated_rects(items).iter().for_each(|o| println!("{o}"))
        }
        InferenceResult::InstanceSegmentation(items) => items.iter().for_each(|o| println!("{o}")),
    }
}

/// Failures with a known cause: model errors and unreadable inputs.
fn is_recognised(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.is::<modelport_core::Error>()
            || cause.is::<modelport_core::ModelLoadError>()
            || cause.is::<image::ImageError>()
            || cause.is::<std::io::Error>()
    })
}
