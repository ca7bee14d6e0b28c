use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::{Parser, Subcommand};
use facerelay_core::{FaceRecord, HttpTransport, Relay, RelayOptions};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Embedding dimensions shown per face in summaries.
const PREVIEW_DIMS: usize = 10;

#[derive(Parser)]
#[command(name = "facerelay", about = "facerelay CLI — detect faces through the backend relay")]
struct Cli {
    /// Detection backend endpoint
    #[arg(long, global = true, env = "FACERELAY_BACKEND_URL", default_value = "http://127.0.0.1:10002/")]
    backend_url: String,

    /// Backend timeout in seconds
    #[arg(long, global = true, env = "FACERELAY_TIMEOUT_SECS", default_value_t = 180)]
    timeout_secs: u64,

    /// Print JSON instead of a summary
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect faces in an image by calling the backend directly
    Detect {
        /// Image file to send
        image: PathBuf,
    },
    /// Send an image to a running facerelayd
    Send {
        /// Image file to send
        image: PathBuf,
        /// facerelayd endpoint
        #[arg(long, env = "FACERELAY_URL", default_value = "http://127.0.0.1:7777/")]
        relay_url: String,
    },
    /// Report the best face similarity between two images
    Compare { first: PathBuf, second: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let timeout = Duration::from_secs(cli.timeout_secs);

    match cli.command {
        Commands::Detect { image } => {
            let relay = backend_relay(&cli.backend_url, timeout)?;
            let faces = detect(&relay, &image).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "faces": faces }))?);
            } else {
                print!("{}", summarize(&faces));
            }
        }
        Commands::Send { image, relay_url } => {
            let bytes = read_image(&image)?;
            let response = reqwest::Client::builder()
                .timeout(timeout)
                .build()?
                .post(&relay_url)
                .json(&serde_json::json!({ "image": STANDARD.encode(&bytes) }))
                .send()
                .await
                .with_context(|| format!("failed to reach facerelayd at {relay_url}"))?;

            let status = response.status();
            let body: serde_json::Value = response.json().await.context("facerelayd sent a non-JSON reply")?;
            if !status.is_success() {
                bail!(
                    "facerelayd answered {status}: {}",
                    body["error"].as_str().unwrap_or("unknown error")
                );
            }
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&body)?);
            } else {
                let faces: Vec<FaceRecord> = serde_json::from_value(body["faces"].clone())?;
                print!("{}", summarize(&faces));
            }
        }
        Commands::Compare { first, second } => {
            let relay = backend_relay(&cli.backend_url, timeout)?;
            let (a, b) = tokio::try_join!(detect(&relay, &first), detect(&relay, &second))?;

            let Some((i, j, similarity)) = best_match(&a, &b) else {
                bail!("need at least one face in each image (got {} and {})", a.len(), b.len());
            };
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({ "first_face": i, "second_face": j, "similarity": similarity })
                );
            } else {
                println!("Best match: face {i} of {} ↔ face {j} of {}", first.display(), second.display());
                println!("Cosine similarity: {similarity:.4}");
            }
        }
    }

    Ok(())
}

fn backend_relay(url: &str, timeout: Duration) -> Result<Relay<HttpTransport>> {
    let transport = HttpTransport::new(url, timeout)?;
    Ok(Relay::new(
        transport,
        RelayOptions {
            timeout,
            ..RelayOptions::default()
        },
    ))
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read image {}", path.display()))
}

async fn detect(relay: &Relay<HttpTransport>, path: &Path) -> Result<Vec<FaceRecord>> {
    let bytes = read_image(path)?;
    tracing::info!(path = %path.display(), bytes = bytes.len(), "sending image to backend");
    let faces = relay
        .relay(bytes)
        .await
        .with_context(|| format!("face detection failed for {}", path.display()))?;
    Ok(faces)
}

/// Highest-similarity face pair across two detections.
fn best_match(a: &[FaceRecord], b: &[FaceRecord]) -> Option<(usize, usize, f32)> {
    let mut best: Option<(usize, usize, f32)> = None;
    for (i, fa) in a.iter().enumerate() {
        for (j, fb) in b.iter().enumerate() {
            let sim = fa.similarity(fb);
            if best.map_or(true, |(_, _, s)| sim > s) {
                best = Some((i, j, sim));
            }
        }
    }
    best
}

fn summarize(faces: &[FaceRecord]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Detected {} faces.", faces.len());
    for (i, face) in faces.iter().enumerate() {
        let _ = writeln!(out, "\n---- FACE {i} ----");
        let _ = writeln!(
            out,
            "Bounding box: {:?} ({:.0}x{:.0})",
            face.pixel_bbox(),
            face.width(),
            face.height()
        );
        let _ = writeln!(out, "Detection score: {:.3}", face.det_score);
        let _ = writeln!(out, "Landmarks: {:?}", face.landmark_pixels());
        let _ = writeln!(out, "Embedding length: {}", face.embedding.len());
        if !face.embedding.is_empty() {
            let preview = &face.embedding[..face.embedding.len().min(PREVIEW_DIMS)];
            let _ = writeln!(out, "First {} dims: {preview:?}", preview.len());
        }
    }
    out
}
