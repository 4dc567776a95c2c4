use crate::{
    axum_http::{default_routers, routers},
    config::config_model::DotEnvyConfig,
};
use anyhow::Result;
use axum::{
    Router,
    http::{
        Method,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
    routing::get,
};
use lms::{
    domain::value_objects::plans::PlanCatalog,
    infra::db::postgres::postgres_connection::PgPoolSquad,
    payments::stripe_client::StripeClient,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{error, info};

pub async fn start(config: Arc<DotEnvyConfig>, db_pool: Arc<PgPoolSquad>) -> Result<()> {
    let gateway = Arc::new(StripeClient::new(
        config.stripe.secret_key.clone(),
        config.stripe.webhook_secret.clone(),
        config.stripe.webhook_tolerance_secs,
    ));
    let catalog = Arc::new(PlanCatalog::new(config.plans.clone()));
    let pending_episode_grace =
        chrono::Duration::seconds(config.billing.pending_episode_grace_secs);

    let app = Router::new()
        .fallback(default_routers::not_found)
        .nest(
            "/api/student/payment",
            routers::subscriptions::routes(
                Arc::clone(&db_pool),
                Arc::clone(&gateway),
                Arc::clone(&catalog),
                pending_episode_grace,
            ),
        )
        .nest(
            "/api/student/payment/methods",
            routers::payment_methods::routes(Arc::clone(&db_pool), Arc::clone(&gateway)),
        )
        .nest(
            "/api/student/payment/invoices",
            routers::invoices::routes(
                Arc::clone(&db_pool),
                Arc::clone(&gateway),
                Arc::clone(&catalog),
            ),
        )
        .nest(
            "/api/student/course",
            routers::enrollments::routes(Arc::clone(&db_pool)),
        )
        .nest(
            "/api/admin/dashboard",
            routers::admin_dashboard::routes(Arc::clone(&db_pool), Arc::clone(&catalog)),
        )
        .nest(
            "/api/stripe/webhook",
            routers::stripe_webhook::routes(
                Arc::clone(&db_pool),
                Arc::clone(&gateway),
                Arc::clone(&catalog),
            ),
        )
        .route("/api/v1/health-check", get(default_routers::health_check))
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.backend_server.timeout,
        )))
        .layer(RequestBodyLimitLayer::new(
            (config.backend_server.body_limit * 1024 * 1024).try_into()?,
        ))
        .layer(
            CorsLayer::new()
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PATCH,
                    Method::PUT,
                    Method::DELETE,
                ])
                .allow_headers([AUTHORIZATION, CONTENT_TYPE])
                .allow_origin(Any),
        )
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.backend_server.port));
    let listener = TcpListener::bind(addr).await?;

    info!("Server is running on port {}", config.backend_server.port);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to install CTRL+C signal handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM signal handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received ctrl+C signal"),
        _ = terminate => info!("Received terminate signal"),
    }
}
