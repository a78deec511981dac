//! Demo server: config → backend registry → session manager → router.

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt};

use session_warden::config::Config;
use session_warden::session::AnyBackend;
use session_warden::session::dynamodb::DynamoDbBackend;
use session_warden::session::manager::SessionManager;
use session_warden::session::memory::InMemoryBackend;
use session_warden::session::registry::{BackendRegistry, Provider};
use session_warden::{AppState, create_app};

#[tokio::main]
async fn main() {
    // Load .env for local dev
    let _ = dotenvy::dotenv();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if env::var("LOG_FORMAT").is_ok_and(|v| v == "json") {
        fmt().json().with_env_filter(filter).init();
    } else {
        fmt().with_env_filter(filter).init();
    }

    let config = Config::from_env().expect("Failed to load configuration");

    // Session backend: DynamoDB for production, InMemory for dev
    let mut registry = BackendRegistry::new();
    match config.session_backend {
        Provider::DocumentStore => {
            let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
            let dynamo_client = if config.dynamodb_endpoint.is_empty() {
                aws_sdk_dynamodb::Client::new(&sdk_config)
            } else {
                let dynamo_config = aws_sdk_dynamodb::config::Builder::from(&sdk_config)
                    .endpoint_url(&config.dynamodb_endpoint)
                    .build();
                aws_sdk_dynamodb::Client::from_conf(dynamo_config)
            };
            tracing::info!(
                sessions = %config.session_table(),
                blacklist = %config.blacklist_table(),
                "Using DynamoDB session backend"
            );
            let backend = DynamoDbBackend::new(
                dynamo_client,
                config.session_table(),
                config.blacklist_table(),
            )
            .with_max_lifetime(config.max_lifetime);
            registry.register(Provider::DocumentStore, AnyBackend::DynamoDb(backend));
        }
        _ => {
            tracing::info!("Using in-memory session backend");
            let backend = InMemoryBackend::with_max_lifetime(config.max_lifetime);
            registry.register(Provider::Memory, AnyBackend::Memory(backend));
        }
    }

    let provider = config.session_backend;
    let manager = Arc::new(
        SessionManager::new(provider, config.clone(), &registry)
            .expect("Failed to build session manager"),
    );
    let shutdown = manager.start_maintenance();

    let state = Arc::new(AppState {
        config: config.clone(),
        manager,
    });
    let app = create_app(state);

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
    .expect("Server error");

    let _ = shutdown.send(true);
}
