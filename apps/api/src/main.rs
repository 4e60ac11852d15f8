use std::net::SocketAddr;
use std::sync::Arc;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tower_http::cors::{CorsLayer, Any};
use tower_http::trace::{self, TraceLayer};
use tracing::{Level, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod router;

use consultation_cell::{ConsultationCoordinator, ConsultationState};
use shared_config::AppConfig;
use video_conferencing_cell::HttpRoomGateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Loading Env Vars
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Amae consultation server");

    // Load configuration
    let config = Arc::new(AppConfig::from_env());
    if !config.is_configured() {
        warn!("SUPABASE_JWT_SECRET is not set; every channel and request will be rejected");
    }

    // Room provider and coordination core
    let gateway = Arc::new(HttpRoomGateway::new(&config)?);
    let (coordinator, departures) = ConsultationCoordinator::new(&config.coordination, gateway);
    tokio::spawn(Arc::clone(&coordinator).run_departure_worker(departures));

    info!(
        "Coordination: grace {:?}, invite timeout {:?}, default consultation {:?}",
        config.coordination.grace_window,
        config.coordination.invite_timeout,
        config.coordination.default_consultation
    );

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let state = ConsultationState {
        config: Arc::clone(&config),
        coordinator,
    };

    // Build the application router
    let app = router::create_router(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new()
                    .level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new()
                    .level(Level::INFO)),
        )
        .layer(cors);

    // Run the server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    info!("Listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
