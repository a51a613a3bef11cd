use std::sync::Arc;

use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use sqlx::postgres::PgPoolOptions;
use tracing::warn;

use cep_api::batch::{BatchProcessor, BatchSettings};
use cep_api::chain::ResolutionChain;
use cep_api::config::Config;
use cep_api::provider::AddressProvider;
use cep_api::providers::brasilapi::BrasilApiClient;
use cep_api::providers::correios::CorreiosClient;
use cep_api::providers::viacep::ViaCepClient;
use cep_api::router::{router, AppState};
use cep_api::store::PgRecordStore;
use cep_api::stream::ProgressBroadcaster;

async fn listen(app: Router, address: std::net::SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(address).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

fn build_correios(client: &reqwest::Client, config: &Config) -> Option<Arc<CorreiosClient>> {
    match (
        &config.correios_cep_url,
        &config.correios_auth_url,
        &config.correios_username,
        &config.correios_password,
    ) {
        (Some(cep_url), Some(auth_url), Some(username), Some(password)) => {
            Some(Arc::new(CorreiosClient::new(
                client.clone(),
                cep_url.clone(),
                auth_url.clone(),
                username.clone(),
                password.clone(),
            )))
        }
        (None, None, None, None) => None,
        _ => {
            warn!("incomplete Correios configuration, provider disabled");
            None
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to postgres");

    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("failed to run database migrations");

    let client = reqwest::Client::builder()
        .timeout(config.request_timeout.0)
        .user_agent("cep-api")
        .build()
        .expect("failed to construct reqwest client");

    let correios = build_correios(&client, &config);

    let mut providers: Vec<Arc<dyn AddressProvider>> = Vec::new();
    if let Some(correios) = &correios {
        providers.push(correios.clone());
    }
    providers.push(Arc::new(ViaCepClient::new(
        client.clone(),
        config.viacep_url.clone(),
    )));
    providers.push(Arc::new(BrasilApiClient::new(
        client,
        config.brasilapi_url.clone(),
    )));

    let store = Arc::new(PgRecordStore::new(pool));
    let chain = Arc::new(ResolutionChain::new(providers));
    let broadcaster = ProgressBroadcaster::new();
    let processor = BatchProcessor::new(
        store.clone(),
        chain.clone(),
        broadcaster.clone(),
        BatchSettings {
            concurrency: config.concurrency,
            item_delay: config.base_delay.0,
        },
    );

    let state = AppState {
        store,
        chain,
        correios,
        broadcaster,
        processor,
    };

    let app = router(state, config.export_prometheus);

    tracing::info!(address = %config.address, "starting cep-api");
    match listen(app, config.address).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start cep-api http server, {}", e),
    }
}
