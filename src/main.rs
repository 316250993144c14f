use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use docubot_hub::config::CorsConfig;
use docubot_hub::{configure_routes, AppError, AppState, Settings};
use dotenv::dotenv;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn cors(config: &CorsConfig) -> Cors {
    if !config.enabled {
        return Cors::default();
    }

    let cors = if config.allow_any_origin {
        Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
    } else {
        Cors::default()
            .allowed_origin("http://localhost:5173")
            .allowed_origin("http://127.0.0.1:5173")
            .allowed_methods(vec!["GET"])
            .allowed_headers(vec!["Authorization", "Content-Type"])
    };

    cors.max_age(config.max_age as usize)
}

#[tokio::main]
async fn main() -> docubot_hub::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let config = Settings::new()?;
    info!("Configuration loaded successfully ({})", config.environment);

    let state = AppState::new(config.clone()).await?;

    let ws_listener = TcpListener::bind((config.server.host.as_str(), config.server.ws_port)).await?;
    tokio::spawn(state.websocket_server().run(ws_listener));

    info!("Starting HTTP server at {}:{}", config.server.host, config.server.port);
    let data = web::Data::new(state.clone());
    let cors_config = config.cors.clone();

    let result = HttpServer::new(move || {
        App::new()
            .wrap(cors(&cors_config))
            .app_data(data.clone())
            .configure(configure_routes)
    })
    .bind((config.server.host.as_str(), config.server.port))?
    .workers(config.server.workers as usize)
    .run()
    .await
    .map_err(|e| AppError::InternalError(e.to_string()));

    if let Err(e) = &result {
        error!("HTTP server stopped: {}", e);
    }

    info!("Shutting down");
    state.shutdown().await?;
    result
}
