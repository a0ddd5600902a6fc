use std::sync::Arc;

use clap::Parser;
use starlight_hub::auth::AuthValidator;
use starlight_hub::config::Args;
use starlight_hub::driver::NullDriver;
use starlight_hub::hub::Hub;
use starlight_hub::lifecycle::{wait_for_shutdown_signal, Lifecycle, LoggingWebhookSink};
use starlight_hub::server;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = args.resolve()?;
    let auth = Arc::new(AuthValidator::new(config.security.auth_token.clone()));

    // TODO: wire in a real PageDriver once a browser-automation backend is
    // chosen; the Hub's control flow is fully exercised against NullDriver
    // in ghost mode and in the integration tests.
    let hub = Arc::new(Hub::new(config.clone(), Arc::new(NullDriver)));
    let lifecycle = Arc::new(Lifecycle::new(Arc::clone(&hub), config, Arc::new(LoggingWebhookSink)));

    let listener = lifecycle.start().await?;
    let router = server::router(hub, auth);

    let serve = tokio::spawn(async move {
        axum::serve(listener, router).await
    });

    wait_for_shutdown_signal().await;
    lifecycle.shutdown(Some("signal".to_string())).await;
    serve.abort();

    Ok(())
}
