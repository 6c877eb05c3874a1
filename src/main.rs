use std::{process, sync::Arc};

use gazette::{
    application::{
        articles::{ArticleService, ArticleStores},
        error::AppError,
    },
    cache::{CoherenceConfig, InvalidationHub, SystemClock},
    config,
    infra::{
        db::PostgresRepositories,
        error::InfraError,
        http::{self, HttpState},
        telemetry,
    },
    resilience::{CancelToken, FallbackSwitch, HealthTracker, ResilienceManager},
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Probe(_) => run_probe(settings).await,
    }
}

fn init_repositories(settings: &config::Settings) -> Result<Arc<PostgresRepositories>, AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))
        .map_err(AppError::from)?;

    let pool = PostgresRepositories::connect_lazy(
        database_url,
        settings.database.max_connections.get(),
        settings.database.acquire_timeout,
    )
    .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    Ok(Arc::new(PostgresRepositories::new(pool)))
}

fn build_resilience(settings: &config::Settings) -> Arc<ResilienceManager> {
    Arc::new(ResilienceManager::new(
        settings.resilience.retry.clone(),
        Arc::new(HealthTracker::new()),
        Arc::new(FallbackSwitch::new(settings.resilience.smart_fallback)),
    ))
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let repositories = init_repositories(&settings)?;

    // The pool is lazy; an unreachable store at boot is logged and the service starts degraded.
    if settings.database.run_migrations
        && let Err(err) = PostgresRepositories::run_migrations(repositories.pool()).await
    {
        warn!(
            target = "gazette::startup",
            error = %err,
            "Migrations did not run; store may be unreachable"
        );
    }

    let coherence = CoherenceConfig::from(&settings.coherence);
    let hub = Arc::new(InvalidationHub::from_config(&coherence));
    let articles = Arc::new(ArticleService::new(
        ArticleStores::from_repo(repositories),
        build_resilience(&settings),
        hub.clone(),
        Arc::new(SystemClock),
    ));

    let shutdown = CancelToken::new();
    let router = http::build_router(HttpState {
        articles,
        shutdown: shutdown.clone(),
    });

    let addr = settings.server.addr;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| AppError::from(InfraError::bind(addr, err)))?;

    info!(
        target = "gazette::startup",
        %addr,
        transport = coherence.transport.as_str(),
        smart_fallback = settings.resilience.smart_fallback,
        "Gazette listening"
    );

    let server_shutdown = shutdown.clone();
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await });
    let mut server = tokio::spawn(async move { server.await });

    tokio::select! {
        joined = &mut server => return flatten_server_result(joined),
        _ = shutdown_signal() => {}
    }

    info!(target = "gazette::shutdown", "Shutdown signal received");
    shutdown.cancel();
    hub.close();

    match tokio::time::timeout(settings.server.graceful_shutdown, &mut server).await {
        Ok(joined) => flatten_server_result(joined),
        Err(_) => {
            warn!(
                target = "gazette::shutdown",
                timeout_secs = settings.server.graceful_shutdown.as_secs(),
                "Graceful shutdown timed out; aborting open connections"
            );
            server.abort();
            Ok(())
        }
    }
}

fn flatten_server_result(
    joined: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<(), AppError> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(AppError::unexpected(format!("server error: {err}"))),
        Err(err) => Err(AppError::unexpected(format!("server task failed: {err}"))),
    }
}

async fn run_probe(settings: config::Settings) -> Result<(), AppError> {
    let repositories = init_repositories(&settings)?;
    let resilience = build_resilience(&settings);
    let cancel = CancelToken::new();

    let report = resilience
        .health_check(repositories.as_ref(), &cancel)
        .await;
    let rendered = serde_json::to_string_pretty(&report)
        .map_err(|err| AppError::unexpected(format!("failed to encode report: {err}")))?;
    println!("{rendered}");

    if report.healthy {
        Ok(())
    } else {
        Err(AppError::from(InfraError::database(
            report
                .live_check
                .error
                .unwrap_or_else(|| "store unreachable".to_string()),
        )))
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(target = "gazette::shutdown", error = %err, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(target = "gazette::shutdown", error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
