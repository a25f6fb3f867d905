use anyhow::{Context, Result};
use clap::Parser;
use signed_upload::{
    client::{
        ChunkedUploader, ClientError, FileSource, HttpTransport, HttpUploadApi, UploadRequest,
    },
    config::UploadConfig,
};
use std::{path::PathBuf, sync::Arc};
use tracing_subscriber::EnvFilter;

/// Upload a file through a signed-upload server.
#[derive(Parser, Debug)]
#[command(author, version, about = "Signed-URL upload client")]
struct Args {
    /// File to upload
    file: PathBuf,

    /// Server base URL (overrides SIGNED_UPLOAD_SERVER)
    #[arg(long)]
    server: Option<String>,

    /// Name of the resource the file belongs to (defaults to the file name)
    #[arg(long)]
    resource_name: Option<String>,

    #[arg(long)]
    description: Option<String>,

    /// MIME type sent with the upload
    #[arg(long)]
    content_type: Option<String>,

    /// Part uploads in flight at once (overrides SIGNED_UPLOAD_MAX_CONCURRENT_PARTS)
    #[arg(long)]
    concurrency: Option<usize>,

    /// Request every part URL upfront
    #[arg(long)]
    presign_parts: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let server = args
        .server
        .or_else(|| std::env::var("SIGNED_UPLOAD_SERVER").ok())
        .unwrap_or_else(|| "http://127.0.0.1:4000".into());

    let source = FileSource::open(&args.file)
        .await
        .with_context(|| format!("opening {}", args.file.display()))?;
    let file_name = args
        .file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .context("upload path has no file name")?;

    let defaults = UploadConfig::default();
    let max_concurrent_parts = match args.concurrency {
        Some(value) => value,
        None => match std::env::var("SIGNED_UPLOAD_MAX_CONCURRENT_PARTS") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("invalid SIGNED_UPLOAD_MAX_CONCURRENT_PARTS `{raw}`"))?,
            Err(_) => defaults.max_concurrent_parts,
        },
    };
    let config = UploadConfig {
        max_concurrent_parts,
        ..defaults
    };
    config.validate()?;

    let http = reqwest::Client::new();
    let uploader = ChunkedUploader::new(
        Arc::new(HttpUploadApi::new(http.clone(), &server)),
        Arc::new(HttpTransport::new(http)),
        &config,
    )
    .with_presigned_parts(args.presign_parts);

    let token = uploader.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling upload");
            token.cancel();
        }
    });

    let mut progress = uploader.subscribe_progress();
    tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let p = *progress.borrow_and_update();
            if p.completed_parts > 0 {
                tracing::info!(
                    "{}% ({}/{} bytes, {}/{} parts)",
                    p.percent(),
                    p.completed_bytes,
                    p.total_bytes,
                    p.completed_parts,
                    p.total_parts
                );
            }
        }
    });

    let request = UploadRequest {
        resource_name: args.resource_name.unwrap_or_else(|| file_name.clone()),
        description: args.description,
        file_name,
        content_type: args.content_type,
    };

    match uploader.upload(request, Arc::new(source)).await {
        Ok(session) => {
            tracing::info!(
                session_id = %session.id,
                key = %session.key,
                token = ?session.integrity_token,
                "upload complete"
            );
            println!("{}", serde_json::to_string_pretty(&session)?);
            Ok(())
        }
        Err(ClientError::Cancelled) => {
            tracing::warn!("upload cancelled; session aborted");
            std::process::exit(130);
        }
        Err(err) => Err(err.into()),
    }
}
