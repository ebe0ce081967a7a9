use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sightline::{
    app::{build_router, AppState},
    config::Config,
    session::Sessions,
    speech::{OpenAiTts, RodioSink, SpeechOutput},
    vision::{OpenAiVision, VisionClient},
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Path to the YAML configuration file; defaults apply if it's absent
    #[clap(long, default_value = "config.yml")]
    config: String,

    /// Override the address and port from the configuration
    #[clap(long)]
    address: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    // initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Parse command line arguments
    let args = Args::parse();
    let config = Config::load_or_default(&args.config).context("Loading configuration")?;
    let address = args.address.unwrap_or(config.server.address.clone());

    // The one required credential. Without it there is nothing to serve.
    let api_key = dotenvy::var("OPENAI_API_KEY")
        .context("Could not find OPENAI_API_KEY in the environment.")?;

    let vision = VisionClient::new(Arc::new(OpenAiVision::new(&api_key, &config.vision.model)));
    let speech = SpeechOutput::new(
        Arc::new(OpenAiTts::new(&api_key, &config.speech)),
        Arc::new(RodioSink::new(config.speech.volume).context("Starting audio playback")?),
    );

    let app = build_router(AppState {
        sessions: Sessions::new(),
        vision,
        speech,
    });

    // In development, use HTTP. In production, use HTTPS.
    if let Some(tls) = &config.server.tls {
        rustls::crypto::ring::default_provider()
            .install_default()
            .expect("Failed to install rustls crypto provider");
        let tls_config =
            axum_server::tls_rustls::RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
                .await
                .context("Loading TLS certificate")?;

        let addr = address.parse()?;
        tracing::info!("Listening on {}", addr);
        axum_server::bind_rustls(addr, tls_config)
            .serve(app.into_make_service())
            .await
            .context("Starting TLS server")?;
    } else {
        let listener = tokio::net::TcpListener::bind(&address).await?;
        tracing::info!("Listening on {}", address);
        axum::serve(listener, app).await?;
    }
    Ok(())
}
