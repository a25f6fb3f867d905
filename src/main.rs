use anyhow::{Result, anyhow};
use axum::Router;
use signed_upload::{
    config::AppConfig,
    db,
    handlers::AppState,
    routes,
    services::{
        coordinator::UploadCoordinator, local_storage::LocalStorage,
        session_store::SqliteSessionStore, signer::UrlSigner,
    },
};
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!(
        addr = %cfg.addr(),
        storage_dir = %cfg.storage_dir,
        database_url = %cfg.database_url,
        public_url = %cfg.public_url,
        upload = ?cfg.upload,
        "Starting signed-upload"
    );

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url).await?);

    // --- Handle migration mode ---
    if migrate {
        db::run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(());
    }
    db::run_migrations(&db).await?;

    // --- Initialize services ---
    let signer = UrlSigner::new(cfg.signing_secret.as_bytes(), cfg.public_url.clone())
        .map_err(|err| anyhow!("building URL signer: {err}"))?;
    let storage = LocalStorage::new(db.clone(), cfg.storage_dir.clone(), signer);
    let store = SqliteSessionStore::new(db.clone());
    let coordinator = UploadCoordinator::new(
        Arc::new(store),
        Arc::new(storage.clone()),
        cfg.upload.clone(),
    );

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(AppState {
        coordinator,
        storage,
    });

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
