use std::env;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    extract::DefaultBodyLimit,
    extract::State,
    extract::connect_info::ConnectInfo,
    http::Method,
    http::Request,
    http::header::{AUTHORIZATION, CONTENT_TYPE, HeaderName, HeaderValue},
    middleware,
    middleware::Next,
    response::Response,
    routing::get,
};
use clap::{Parser, ValueEnum};
use dotenvy::dotenv;
use expo_common::db::{PgFeedbackStore, create_pool_from_url_checked, run_migrations};
use expo_common::logging::{init_tracing_subscriber, install_tracing_panic_hook};
use expo_common::{FeedbackService, FeedbackStore, MemoryFeedbackStore};
use governor::{
    Quota, RateLimiter, clock::DefaultClock, middleware::NoOpMiddleware,
    state::keyed::DashMapStateStore,
};
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

pub mod auth;
pub mod error;
pub mod handlers;

use auth::{AuthConfig, AuthMode, JwtAlgorithm};
use error::ApiError;
use handlers::{feedback, health, session};

const SHUTDOWN_DRAIN_GRACE: Duration = Duration::from_millis(200);
const RATE_LIMIT_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "snake_case")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl StoreBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreBackend::Postgres => "postgres",
            StoreBackend::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "expo-api", about = "HTTP API for event expo feedback")]
struct Cli {
    /// Record store backend: postgres | memory
    #[arg(long, env = "EXPO_STORE", default_value = "postgres", value_enum)]
    store: StoreBackend,

    /// PostgreSQL connection string (required for the postgres store)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Server port
    #[arg(long, env = "PORT", default_value_t = 3001)]
    port: u16,

    /// API key for X-API-Key authentication
    #[arg(long, env = "EXPO_API_KEY")]
    api_key: Option<String>,

    /// Authentication mode: api_key | jwt
    #[arg(long, env = "AUTH_MODE", default_value = "jwt", value_enum)]
    auth_mode: AuthMode,

    /// JWT secret for AUTH_MODE=jwt
    #[arg(long, env = "JWT_SECRET")]
    jwt_secret: Option<String>,

    /// PEM public key for AUTH_MODE=jwt when using an asymmetric algorithm
    #[arg(long, env = "JWT_PUBLIC_KEY")]
    jwt_public_key: Option<String>,

    #[arg(long, env = "JWT_ALGORITHM", default_value = "hs256", value_enum)]
    jwt_algorithm: JwtAlgorithm,

    /// Comma separated list of allowed CORS origins
    #[arg(long, env = "EXPO_CORS_ORIGINS", default_value = "http://localhost:3000")]
    cors_origins: String,

    /// Prometheus exporter port, 0 disables it
    #[arg(long, env = "EXPO_METRICS_PORT", default_value_t = 9100)]
    metrics_port: u16,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub store: StoreBackend,
    pub database_url: Option<String>,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub auth: AuthConfig,
    pub metrics_port: u16,
}

type IpRateLimiter = RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock, NoOpMiddleware>;

#[derive(Clone)]
pub struct RateLimits {
    global: Arc<IpRateLimiter>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub global_per_sec: u64,
    pub global_burst: u32,
}

impl RateLimitConfig {
    fn parse_env<T: std::str::FromStr + PartialOrd + Default>(name: &str) -> Option<T> {
        env::var(name)
            .ok()
            .and_then(|value| value.trim().parse::<T>().ok())
            .filter(|value| *value > T::default())
    }

    fn from_env() -> Self {
        Self {
            global_per_sec: Self::parse_env("EXPO_RATE_LIMIT_GLOBAL_PER_SEC").unwrap_or(20),
            global_burst: Self::parse_env("EXPO_RATE_LIMIT_GLOBAL_BURST").unwrap_or(40),
        }
    }
}

impl AppConfig {
    fn from_cli(cli: Cli) -> Result<Self, ApiError> {
        let cors_origins = cli
            .cors_origins
            .split(',')
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect::<Vec<_>>();

        if cors_origins.iter().any(|origin| origin == "*") {
            return Err(ApiError::BadRequest(
                "EXPO_CORS_ORIGINS must list explicit origins when credentials are enabled".into(),
            ));
        }

        if cli.store == StoreBackend::Postgres && cli.database_url.is_none() {
            return Err(ApiError::BadRequest(
                "DATABASE_URL is required when EXPO_STORE=postgres".into(),
            ));
        }

        let auth = AuthConfig {
            mode: cli.auth_mode,
            api_key: cli.api_key,
            jwt_secret: cli.jwt_secret,
            jwt_public_key: cli.jwt_public_key,
            jwt_algorithm: cli.jwt_algorithm,
        };

        match auth.mode {
            AuthMode::ApiKey if auth.api_key.is_none() => {
                return Err(ApiError::BadRequest(
                    "EXPO_API_KEY is required when AUTH_MODE=api_key".into(),
                ));
            }
            AuthMode::Jwt => match auth.jwt_algorithm.key_kind() {
                auth::JwtKeyKind::Secret if auth.jwt_secret.is_none() => {
                    return Err(ApiError::BadRequest(
                        "JWT_SECRET is required when AUTH_MODE=jwt with symmetric algorithms"
                            .into(),
                    ));
                }
                auth::JwtKeyKind::Secret => {}
                _ if auth.jwt_public_key.is_none() => {
                    return Err(ApiError::BadRequest(
                        "JWT_PUBLIC_KEY is required when AUTH_MODE=jwt with asymmetric algorithms"
                            .into(),
                    ));
                }
                _ => {}
            },
            _ => {}
        }

        Ok(Self {
            store: cli.store,
            database_url: cli.database_url,
            port: cli.port,
            cors_origins,
            auth,
            metrics_port: cli.metrics_port,
        })
    }

    pub fn for_tests(auth: AuthConfig) -> Self {
        Self {
            store: StoreBackend::Memory,
            database_url: None,
            port: 3001,
            cors_origins: vec!["http://localhost:3000".into()],
            auth,
            metrics_port: 0,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub feedback: FeedbackService,
    pub config: AppConfig,
    pub(crate) rate_limits: RateLimits,
    pub readiness: Arc<std::sync::atomic::AtomicBool>,
}

pub type SharedState = Arc<AppState>;

impl axum::extract::FromRef<SharedState> for AuthConfig {
    fn from_ref(input: &SharedState) -> AuthConfig {
        input.config.auth.clone()
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed = origins
        .iter()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect::<Vec<_>>();

    CorsLayer::new()
        .allow_origin(allowed)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            AUTHORIZATION,
            CONTENT_TYPE,
            HeaderName::from_static("x-api-key"),
        ])
        .allow_credentials(true)
}

fn build_ip_limiter(per_second: u64, burst_size: u32) -> Arc<IpRateLimiter> {
    let nanos_per_token = (1_000_000_000u64 / per_second.max(1)).max(1);
    let quota = Quota::with_period(Duration::from_nanos(nanos_per_token))
        .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
        .allow_burst(NonZeroU32::new(burst_size).unwrap_or(NonZeroU32::MIN));

    Arc::new(RateLimiter::keyed(quota))
}

pub fn default_rate_limits() -> RateLimits {
    let cfg = RateLimitConfig::from_env();
    RateLimits {
        global: build_ip_limiter(cfg.global_per_sec, cfg.global_burst),
    }
}

/// Drop per-IP entries whose bucket has fully refilled.
fn prune_rate_limits(limits: &RateLimits) {
    limits.global.retain_recent();
    limits.global.shrink_to_fit();
}

fn spawn_rate_limit_pruner(limits: RateLimits) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RATE_LIMIT_PRUNE_INTERVAL);
        loop {
            ticker.tick().await;
            prune_rate_limits(&limits);
        }
    })
}

fn request_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
}

fn enforce_rate_limit(limiter: &IpRateLimiter, ip: Option<IpAddr>) -> Result<(), ApiError> {
    if let Some(client_ip) = ip {
        if limiter.check_key(&client_ip).is_err() {
            return Err(ApiError::TooManyRequests("rate limit exceeded".into()));
        }
    }

    Ok(())
}

async fn global_rate_limit(
    State(state): State<SharedState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    enforce_rate_limit(&state.rate_limits.global, request_ip(&req))?;
    Ok(next.run(req).await)
}

async fn attach_request_id_context(req: Request<Body>, next: Next) -> Result<Response, ApiError> {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string());

    Ok(error::with_request_id(request_id, next.run(req)).await)
}

pub fn create_router(state: SharedState) -> Router {
    let cors = cors_layer(&state.config.cors_origins);

    let request_id_header = HeaderName::from_static("x-request-id");
    let trace_header = request_id_header.clone();

    let trace = TraceLayer::new_for_http().make_span_with(move |request: &Request<Body>| {
        let request_id = request
            .headers()
            .get(&trace_header)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");

        tracing::info_span!(
            "http_request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
            status = tracing::field::Empty,
        )
    });

    let feedback_routes = get(feedback::list_feedback).post(feedback::submit_feedback);

    let api_routes = Router::new()
        .route("/feedback", feedback_routes.clone())
        .route("/session", get(session::current_session));

    Router::new()
        .route("/feedback", feedback_routes)
        .route("/health", get(health::readyz))
        .route("/livez", get(health::livez))
        .route("/readyz", get(health::readyz))
        .nest("/api", api_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            global_rate_limit,
        ))
        .layer(middleware::from_fn(attach_request_id_context))
        .layer(DefaultBodyLimit::max(256 * 1024))
        .layer(trace)
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(SetRequestIdLayer::new(
            request_id_header,
            MakeRequestUuid,
        ))
        .layer(cors)
        .with_state(state)
}

pub fn state_with_store(config: AppConfig, store: Arc<dyn FeedbackStore>) -> SharedState {
    Arc::new(AppState {
        feedback: FeedbackService::new(store),
        config,
        rate_limits: default_rate_limits(),
        readiness: Arc::new(std::sync::atomic::AtomicBool::new(true)),
    })
}

/// State backed by an empty in-memory store and API key auth.
pub fn test_state(api_key: &str) -> SharedState {
    let auth = AuthConfig {
        mode: AuthMode::ApiKey,
        api_key: Some(api_key.to_string()),
        jwt_secret: None,
        jwt_public_key: None,
        jwt_algorithm: JwtAlgorithm::Hs256,
    };

    state_with_store(
        AppConfig::for_tests(auth),
        Arc::new(MemoryFeedbackStore::new()),
    )
}

async fn build_store(config: &AppConfig) -> Result<Arc<dyn FeedbackStore>, ApiError> {
    match (config.store, config.database_url.as_deref()) {
        (StoreBackend::Postgres, Some(url)) => {
            let pool = create_pool_from_url_checked(url)
                .await
                .map_err(|err| ApiError::Database(format!("failed to create pool: {err}")))?;
            run_migrations(&pool)
                .await
                .map_err(|err| ApiError::Database(format!("failed to run migrations: {err}")))?;
            Ok(Arc::new(PgFeedbackStore::new(pool)))
        }
        (StoreBackend::Postgres, None) => Err(ApiError::BadRequest(
            "DATABASE_URL is required when EXPO_STORE=postgres".into(),
        )),
        (StoreBackend::Memory, _) => {
            warn!("using in-memory feedback store; records are lost on restart");
            Ok(Arc::new(MemoryFeedbackStore::new()))
        }
    }
}

pub async fn run() -> Result<(), ApiError> {
    dotenv().ok();
    init_tracing_subscriber(env!("CARGO_PKG_NAME"));
    install_tracing_panic_hook(env!("CARGO_PKG_NAME"));

    let cli = Cli::parse();
    let config = AppConfig::from_cli(cli)?;
    let store = build_store(&config).await?;
    expo_metrics::init_metrics(config.metrics_port);

    let state = state_with_store(config.clone(), store);
    let pruner = spawn_rate_limit_pruner(state.rate_limits.clone());

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    let app = create_router(state.clone());

    info!(%addr, store = config.store.as_str(), auth_mode = ?config.auth.mode, "expo-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;

    let service = app.into_make_service_with_connect_info::<SocketAddr>();

    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;

    pruner.abort();
    Ok(())
}

async fn shutdown_signal(state: SharedState) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            let _ = sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    state
        .readiness
        .store(false, std::sync::atomic::Ordering::SeqCst);

    // Let load balancers observe /readyz as not ready before connections stop.
    tokio::time::sleep(SHUTDOWN_DRAIN_GRACE).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use std::sync::Mutex;
    use tower::ServiceExt;

    static ENV_GUARD: Mutex<()> = Mutex::new(());

    fn with_envs(vars: &[(&str, Option<&str>)], f: impl FnOnce()) {
        let _guard = ENV_GUARD.lock().unwrap();

        let previous: Vec<(&str, Option<String>)> = vars
            .iter()
            .map(|(var, value)| {
                let old = env::var(var).ok();
                match value {
                    Some(v) => unsafe { env::set_var(var, v) },
                    None => unsafe { env::remove_var(var) },
                }
                (*var, old)
            })
            .collect();

        f();

        for (var, previous_value) in previous {
            match previous_value {
                Some(v) => unsafe { env::set_var(var, v) },
                None => unsafe { env::remove_var(var) },
            }
        }
    }

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["expo-api"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[tokio::test]
    async fn router_sets_request_id_when_missing() {
        let app = create_router(test_state("test-key"));

        let response = app
            .oneshot(Request::builder().uri("/livez").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[test]
    fn rate_limit_config_respects_env_overrides() {
        with_envs(
            &[
                ("EXPO_RATE_LIMIT_GLOBAL_PER_SEC", Some("10")),
                ("EXPO_RATE_LIMIT_GLOBAL_BURST", Some("25")),
            ],
            || {
                assert_eq!(
                    RateLimitConfig::from_env(),
                    RateLimitConfig {
                        global_per_sec: 10,
                        global_burst: 25,
                    }
                );
            },
        );
    }

    #[test]
    fn rate_limit_config_ignores_zero_and_garbage() {
        with_envs(
            &[
                ("EXPO_RATE_LIMIT_GLOBAL_PER_SEC", Some("0")),
                ("EXPO_RATE_LIMIT_GLOBAL_BURST", Some("lots")),
            ],
            || {
                assert_eq!(
                    RateLimitConfig::from_env(),
                    RateLimitConfig {
                        global_per_sec: 20,
                        global_burst: 40,
                    }
                );
            },
        );
    }

    #[test]
    fn rate_limiter_rejects_after_burst() {
        let limiter = build_ip_limiter(1, 2);
        let ip = Some(IpAddr::from([10, 0, 0, 1]));

        assert!(enforce_rate_limit(&limiter, ip).is_ok());
        assert!(enforce_rate_limit(&limiter, ip).is_ok());
        assert!(matches!(
            enforce_rate_limit(&limiter, ip),
            Err(ApiError::TooManyRequests(_))
        ));
        assert!(enforce_rate_limit(&limiter, None).is_ok());
    }

    #[test]
    fn pruning_forgets_clients_with_refilled_buckets() {
        let limits = RateLimits {
            global: build_ip_limiter(1000, 1),
        };
        let ip = Some(IpAddr::from([10, 0, 0, 2]));

        assert!(enforce_rate_limit(&limits.global, ip).is_ok());
        assert_eq!(limits.global.len(), 1);

        std::thread::sleep(Duration::from_millis(20));
        prune_rate_limits(&limits);
        assert_eq!(limits.global.len(), 0);
    }

    #[test]
    fn pruning_keeps_clients_still_limited() {
        let limits = RateLimits {
            global: build_ip_limiter(1, 1),
        };
        let ip = Some(IpAddr::from([10, 0, 0, 3]));

        assert!(enforce_rate_limit(&limits.global, ip).is_ok());
        prune_rate_limits(&limits);
        assert_eq!(limits.global.len(), 1);
    }

    #[test]
    fn config_rejects_wildcard_cors() {
        let result = AppConfig::from_cli(cli(&[
            "--store",
            "memory",
            "--jwt-secret",
            "s",
            "--cors-origins",
            "http://a.test, *",
        ]));

        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn config_requires_database_url_for_postgres() {
        with_envs(&[("DATABASE_URL", None)], || {
            let result = AppConfig::from_cli(cli(&["--store", "postgres", "--jwt-secret", "s"]));
            assert!(matches!(result, Err(ApiError::BadRequest(_))));
        });
    }

    #[test]
    fn config_requires_key_material_for_auth_mode() {
        with_envs(
            &[
                ("EXPO_API_KEY", None),
                ("JWT_SECRET", None),
                ("JWT_PUBLIC_KEY", None),
            ],
            || {
                let api_key = AppConfig::from_cli(cli(&["--store", "memory", "--auth-mode", "api_key"]));
                assert!(matches!(api_key, Err(ApiError::BadRequest(_))));

                let rsa = AppConfig::from_cli(cli(&[
                    "--store",
                    "memory",
                    "--jwt-algorithm",
                    "rs256",
                    "--jwt-secret",
                    "s",
                ]));
                assert!(matches!(rsa, Err(ApiError::BadRequest(_))));
            },
        );
    }

    #[test]
    fn config_accepts_memory_store_with_trimmed_origins() {
        let config = AppConfig::from_cli(cli(&[
            "--store",
            "memory",
            "--jwt-secret",
            "s",
            "--cors-origins",
            " http://a.test ,,http://b.test",
        ]))
        .unwrap();

        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.cors_origins, vec!["http://a.test", "http://b.test"]);
    }
}
