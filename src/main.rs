use std::sync::Arc;

use actix_cors::Cors;
use actix_web::middleware::{Compress, DefaultHeaders};
use actix_web::{web, App, HttpResponse, HttpServer};
use anyhow::{anyhow, Context};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{info, warn, Level};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi; // bring trait into scope for ApiDoc::openapi()
use utoipa_swagger_ui::SwaggerUi;

use cinechat::config::AppConfig;
use cinechat::docstore::DocumentStore;
use cinechat::openapi::ApiDoc;
use cinechat::rate_limit::{InMemoryRateLimiter, RateLimiterFacade};
use cinechat::{config, AppState, DocCommentRepo};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load .env automatically only in debug builds; deployments set the environment themselves.
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }

    // Structured logging initialisation
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Bootstrapping cinechat server");
    let cfg = AppConfig::from_env().context("invalid configuration")?;
    info!(frontend_url = ?cfg.frontend_url, rate_limit_enabled = cfg.rate_limit_enabled, "configuration loaded");

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;
    describe_metrics();

    let store = build_store(&cfg).await?;
    let repo = DocCommentRepo::new(store).with_like_max_attempts(cfg.like_max_attempts);
    let state = AppState {
        repo: Arc::new(repo),
        rate_limiter: Some(RateLimiterFacade::new(
            InMemoryRateLimiter::new(cfg.rate_limit_enabled),
            cfg.rate_limits.clone(),
        )),
        max_text_len: cfg.max_text_len,
    };

    let openapi = ApiDoc::openapi();
    info!("OpenAPI document generated");

    let frontend_url = cfg.frontend_url.clone();
    let server = HttpServer::new(move || {
        let cors = {
            let mut c = Cors::default()
                // local React/Vite dev servers
                .allowed_origin("http://localhost:5173")
                .allowed_origin("http://127.0.0.1:5173")
                .allowed_origin("http://localhost:3000")
                .allowed_origin("http://127.0.0.1:3000")
                .allow_any_header()
                .allowed_methods(["GET", "POST", "OPTIONS"])
                .max_age(3600);
            if let Some(front) = frontend_url.as_deref() {
                c = c.allowed_origin(front);
            }
            c
        };

        App::new()
            .wrap(TracingLogger::default())
            .wrap(Compress::default())
            .wrap(
                DefaultHeaders::new()
                    .add(("X-Content-Type-Options", "nosniff"))
                    .add(("X-Frame-Options", "DENY"))
                    .add(("Referrer-Policy", "no-referrer")),
            )
            .wrap(cors)
            .app_data(web::Data::new(state.clone()))
            .app_data(web::Data::new(prometheus.clone()))
            .configure(config)
            .route("/metrics", web::get().to(metrics_endpoint))
            .service(SwaggerUi::new("/docs/{_:.*}").url("/docs/openapi.json", openapi.clone()))
    })
    .bind(cfg.http_addr)
    .with_context(|| format!("failed to bind {}", cfg.http_addr))?;

    info!("Listening on http://{}", cfg.http_addr);
    server.run().await?;
    Ok(())
}

async fn metrics_endpoint(handle: web::Data<PrometheusHandle>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(handle.render())
}

fn describe_metrics() {
    metrics::describe_counter!("cinechat_comments_created_total", "Comments created");
    metrics::describe_counter!("cinechat_replies_created_total", "Replies created");
    metrics::describe_counter!("cinechat_like_toggles_total", "Like toggles committed");
    metrics::describe_counter!("cinechat_like_conflicts_total", "Like toggles retried after a version conflict");
}

async fn build_store(cfg: &AppConfig) -> anyhow::Result<Arc<dyn DocumentStore>> {
    if let Some(store) = postgres_store(cfg).await? {
        return Ok(store);
    }
    in_memory_store(cfg).ok_or_else(|| anyhow!("no document store available: set DATABASE_URL or build with inmem-store"))
}

#[cfg(feature = "postgres-store")]
async fn postgres_store(cfg: &AppConfig) -> anyhow::Result<Option<Arc<dyn DocumentStore>>> {
    use cinechat::docstore::pg::PgDocStore;
    use sqlx::postgres::PgPoolOptions;

    let Some(url) = cfg.database_url.as_deref() else { return Ok(None) };
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(url)
        .await
        .context("failed to connect to DATABASE_URL")?;
    let store = PgDocStore::new(pool);
    store.ensure_schema().await.context("failed to create documents schema")?;
    info!("Using Postgres document store");
    Ok(Some(Arc::new(store)))
}

#[cfg(not(feature = "postgres-store"))]
async fn postgres_store(cfg: &AppConfig) -> anyhow::Result<Option<Arc<dyn DocumentStore>>> {
    if cfg.database_url.is_some() {
        warn!("DATABASE_URL is set but this build lacks postgres-store; ignoring it");
    }
    Ok(None)
}

#[cfg(feature = "inmem-store")]
fn in_memory_store(cfg: &AppConfig) -> Option<Arc<dyn DocumentStore>> {
    use cinechat::docstore::inmem::InMemDocStore;

    let store = match cfg.snapshot_path() {
        Some(path) => {
            info!(path = %path.display(), "Using in-memory document store with snapshot");
            InMemDocStore::with_snapshot(path)
        }
        None => {
            warn!("CINECHAT_DATA_DIR unset: comments are lost on restart");
            InMemDocStore::new()
        }
    };
    Some(Arc::new(store))
}

#[cfg(not(feature = "inmem-store"))]
fn in_memory_store(_cfg: &AppConfig) -> Option<Arc<dyn DocumentStore>> {
    None
}
