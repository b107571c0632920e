use gateway_core::config::Config;
use gateway_core::server::Server;
use gateway_core::state::AppState;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load_for_service("gateway")?;
    init_tracing(&config);

    tracing::info!(
        service = %config.service.name,
        port = config.service.port,
        environment = %config.service.environment,
        "starting sovereign gateway"
    );

    let state = AppState::build(config.clone()).await?;
    let router = gateway_core::routes::router(state);

    Server::new(config).serve(router).await?;
    Ok(())
}

fn init_tracing(config: &Config) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.service.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
