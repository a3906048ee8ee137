//! Face Analysis Service
//!
//! Face detection, embedding extraction, and attribute inference over a REST
//! API, with OpenVINO doing the model execution and SQLite holding the
//! registered embeddings.

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use facebank::api::rest::{create_rest_router, AppState};
use facebank::config::Config;
use facebank::engine::registry::ProviderRegistry;
use facebank::engine::{ArcFaceRecognizer, ModelRuntime, ScrfdDetector};
use facebank::engine::attribute::{FerEmotionClassifier, GenderAgeExtractor};
use facebank::service::FacePipeline;
use facebank::storage::SqliteStore;

#[tokio::main]
async fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    info!("Starting Face Analysis Service v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(Config::default_path()).unwrap_or_else(|e| {
        info!("Using default config ({})", e);
        Config::default()
    });

    info!("Configuration loaded:");
    info!("  Port: {}", config.server.port);
    info!("  Device: {}", config.inference.device);
    info!("  Embedding dim: {}", config.pipeline.embedding_dim);
    info!("  Identity scheme: {:?}", config.storage.identity_scheme);

    // Required capabilities bind eagerly; a load failure here is fatal.
    let mut runtime = ModelRuntime::new(&config.inference.device)?;
    let detector_model = runtime.load("detector", &config.models.detector)?;
    let recognizer_model = runtime.load("recognizer", &config.models.recognizer)?;

    let mut builder = ProviderRegistry::builder()
        .detector(Arc::new(ScrfdDetector::new(
            detector_model,
            config.inference.confidence_threshold,
        )))
        .recognizer(Arc::new(ArcFaceRecognizer::new(
            recognizer_model,
            config.pipeline.embedding_dim,
        )));

    // Optional capabilities degrade to absent fields instead of failing boot.
    if let Some(path) = &config.models.attributes {
        match runtime.load("attributes", path) {
            Ok(model) => builder = builder.attributes(Arc::new(GenderAgeExtractor::new(model))),
            Err(e) => warn!("Attribute model unavailable, continuing without: {}", e),
        }
    }
    if let Some(path) = &config.models.emotion {
        match runtime.load("emotion", path) {
            Ok(model) => builder = builder.emotion(Arc::new(FerEmotionClassifier::new(model))),
            Err(e) => warn!("Emotion model unavailable, continuing without: {}", e),
        }
    }

    let registry = Arc::new(builder.build()?);
    for (capability, bound) in registry.capabilities() {
        info!("  Capability {}: {}", capability.as_str(), if bound { "bound" } else { "absent" });
    }

    let store = Arc::new(
        SqliteStore::new(
            &config.storage.sqlite_path,
            config.storage.encoding,
            config.storage.identity_scheme,
        )
        .await?,
    );
    info!("SQLite store initialized at: {}", config.storage.sqlite_path.display());

    let pipeline = Arc::new(FacePipeline::new(
        registry,
        store,
        config.pipeline.embedding_dim,
    ));
    let app_state = Arc::new(AppState { pipeline });
    let router = create_rest_router(app_state);

    let addr = format!("0.0.0.0:{}", config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("REST API listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    info!("Goodbye!");
    Ok(())
}
