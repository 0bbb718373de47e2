mod db;
mod event;
mod routes;
mod services;
mod state;

use services::lifecycle;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()
        .expect("invalid PORT");

    let pool = db::init_pool(&database_url)
        .await
        .expect("database init failed");

    let directory = std::sync::Arc::new(services::directory::PgDirectory::new(pool.clone()));
    let config = lifecycle::LifecycleConfig::from_env();
    let state = state::AppState::new(pool, directory, config);

    // Background failure detector for vanished clients.
    let _sweep = lifecycle::spawn_sweep_task(state.clone());

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "studyhall listening");
    axum::serve(listener, app).await.expect("server failed");
}
