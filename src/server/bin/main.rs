use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};

use timecard::api::{self, AppState};
use timecard::assets::LogoService;
use timecard::auth::{AuthService, GoogleVerifier, JwtKeys};
use timecard::clock::{Clock, SystemClock};
use timecard::config::Settings;
use timecard::db;
use timecard::telemetry::{get_subscriber, init_subscriber};
use timecard::tracker::TimeTracker;

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = get_subscriber("timecard", "info", std::io::stdout);
    init_subscriber(subscriber)?;

    let settings = Settings::from_env()?;

    let pool = db::setup_pool(&settings.database_url).await?;
    db::setup_db(&pool).await?;

    let uploads_dir = settings.uploads_dir();
    tokio::fs::create_dir_all(&uploads_dir)
        .await
        .with_context(|| format!("Failed to create {}", uploads_dir.display()))?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let tracker = TimeTracker::new(pool.clone(), clock.clone(), settings.utc_offset);

    let mut auth = AuthService::new(pool.clone(), JwtKeys::new(&settings.jwt_secret), clock.clone());
    match &settings.google_client_id {
        Some(client_id) => auth = auth.with_verifier(Arc::new(GoogleVerifier::new(client_id.clone()))),
        None => tracing::info!("GOOGLE_CLIENT_ID not set, Google sign-in disabled"),
    }

    let logo = LogoService::new(pool, uploads_dir, settings.public_base_url.clone(), clock);

    let routes = api::routes(
        AppState::new(tracker, auth, logo),
        settings.public_dir.clone(),
        &settings.frontend_origin,
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let (bound, server) = warp::serve(routes)
        .try_bind_with_graceful_shutdown(addr, async {
            tokio::signal::ctrl_c().await.ok();
        })
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!(%bound, "timecard server listening");
    server.await;
    tracing::info!("timecard server stopped");

    Ok(())
}
