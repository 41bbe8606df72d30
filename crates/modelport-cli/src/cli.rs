use std::path::PathBuf;

use clap::Parser;
use modelport_core::Device;
use modelport_models::ModelKind;

#[derive(Parser, Debug)]
#[command(name = "modelport", version, about = "Run a model on one image and print what it finds")]
pub struct Cli {
    /// Model file (.json graph or .onnx)
    pub model: PathBuf,

    /// Input image
    pub image: PathBuf,

    /// Device for inference (cpu or cuda:N)
    #[arg(long, default_value = "cpu")]
    pub device: Device,

    /// Log filter (RUST_LOG syntax); falls back to RUST_LOG, then `warn`
    #[arg(long)]
    pub log: Option<String>,

    /// Model variant (classification, ssd, maskrcnn), overriding model_type
    #[arg(long)]
    pub kind: Option<ModelKind>,

    /// Label file, one label per line, replacing the embedded labels
    #[arg(long)]
    pub labels: Option<PathBuf>,

    /// Write the model here after inference
    #[arg(long)]
    pub save: Option<PathBuf>,

    /// Serialize, reload and check that both copies agree
    #[arg(long)]
    pub verify_roundtrip: bool,

    /// Rescale printed results to fit WIDTHxHEIGHT
    #[arg(long, value_name = "WIDTHxHEIGHT", value_parser = parse_resolution)]
    pub output_resolution: Option<(u32, u32)>,

    /// Print a rotated rectangle per mask contour for segmentation models
    #[arg(long)]
    pub rotated_rects: bool,
}

fn parse_resolution(raw: &str) -> Result<(u32, u32), String> {
    let (w, h) = raw
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got `{raw}`"))?;
    let side = |v: &str| match v.trim().parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!("invalid resolution side `{v}` in `{raw}`")),
    };
    Ok((side(w)?, side(h)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_resolutions() {
        assert_eq!(parse_resolution("1280x720"), Ok((1280, 720)));
        assert_eq!(parse_resolution("64X48"), Ok((64, 48)));
        assert!(parse_resolution("1280").is_err());
        assert!(parse_resolution("0x10").is_err());
    }
}
