use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::{Parser, Subcommand};
use facematch_core::OnnxExtractor;
use std::path::{Path, PathBuf};

/// Similarity above which `authenticate` reports a match.
///
/// ArcFace embeddings are L2-normalised, so `d^2 = 2 - 2 cos` and the index
/// `max(0, 1 - d)` is above zero exactly when cosine similarity exceeds 0.5.
/// Two photos of one person usually land at d = 0.7..1.1 (index 0.0..0.3),
/// strangers near d = 1.4 (index 0). The 0.5 cut-off used with 128-d dlib
/// encodings would reject most genuine pairs on this scale.
const DEFAULT_THRESHOLD: f32 = 0.0;

#[derive(Parser)]
#[command(name = "facematch", about = "Face comparison CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare the faces in two image files in-process
    Compare {
        /// Enrolled image
        first: PathBuf,
        /// Live capture image
        second: PathBuf,
        /// Directory containing det_10g.onnx and w600k_r50.onnx
        #[arg(long, env = "FACEMATCH_MODEL_DIR")]
        model_dir: Option<PathBuf>,
    },
    /// Send two image files to a running facematchd
    Authenticate {
        /// Enrolled image ("image1")
        first: PathBuf,
        /// Live capture image ("image2")
        second: PathBuf,
        /// Daemon base URL
        #[arg(long, default_value = "http://localhost:8000")]
        url: String,
        /// Similarity above which the faces count as a match
        #[arg(short, long, default_value_t = DEFAULT_THRESHOLD)]
        threshold: f32,
    },
}

fn read_base64(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(STANDARD.encode(bytes))
}

fn run_compare(first: &Path, second: &Path, model_dir: Option<PathBuf>) -> Result<()> {
    let model_dir = model_dir.unwrap_or_else(facematch_core::default_model_dir);
    let mut extractor = OnnxExtractor::load(&model_dir)
        .with_context(|| format!("loading models from {}", model_dir.display()))?;

    let (a, b) = (read_base64(first)?, read_base64(second)?);
    tracing::debug!(
        first = %first.display(),
        second = %second.display(),
        "images read"
    );

    let index = facematch_core::compare_encoded(&mut extractor, &a, &b)?;
    println!("similarity_index: {index}");
    Ok(())
}

async fn run_authenticate(first: &Path, second: &Path, url: &str, threshold: f32) -> Result<()> {
    let payload = serde_json::json!({
        "image1": read_base64(first)?,
        "image2": read_base64(second)?,
    });

    let endpoint = format!("{}/api/authenticate", url.trim_end_matches('/'));
    tracing::debug!(%endpoint, "sending authenticate request");

    let response = reqwest::Client::new()
        .post(&endpoint)
        .json(&payload)
        .send()
        .await
        .with_context(|| format!("sending request to {endpoint}"))?;

    let status = response.status();
    let body: serde_json::Value = response
        .json()
        .await
        .context("parsing authenticate response")?;
    println!("{}", serde_json::to_string_pretty(&body)?);

    if !status.is_success() {
        let message = body["error"].as_str().unwrap_or("unknown error");
        bail!("facematchd returned {status}: {message}");
    }

    let similarity = body["similarity_index"]
        .as_f64()
        .context("response has no similarity_index")?;
    if similarity > threshold as f64 {
        println!("match (similarity {similarity:.4} > {threshold})");
    } else {
        println!("no match (similarity {similarity:.4} <= {threshold})");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Compare {
            first,
            second,
            model_dir,
        } => run_compare(&first, &second, model_dir),
        Commands::Authenticate {
            first,
            second,
            url,
            threshold,
        } => run_authenticate(&first, &second, &url, threshold).await,
    }
}
