mod cdn;
mod config;
mod crop;
mod db;
mod http;
mod normalize;
mod rate_limit;
mod state;
mod transform;

use crate::cdn::CdnClient;
use crate::config::Config;
use crate::db::Database;
use crate::state::AppState;
use axum::Router;
use axum::body::HttpBody;
use axum::http::{Response, header};
use axum::middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::compression::{
    CompressionLayer,
    predicate::{DefaultPredicate, Predicate},
};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing::info;

#[derive(Clone)]
struct NoImageCompression {
    inner: DefaultPredicate,
}

impl NoImageCompression {
    fn new() -> Self {
        Self {
            inner: DefaultPredicate::new(),
        }
    }
}

impl Predicate for NoImageCompression {
    fn should_compress<B>(&self, response: &Response<B>) -> bool
    where
        B: HttpBody,
    {
        if let Some(content_type) = response.headers().get(header::CONTENT_TYPE) {
            if let Ok(content_type) = content_type.to_str() {
                if content_type.starts_with("image/") {
                    return false;
                }
            }
        }
        self.inner.should_compress(response)
    }
}

fn build_app(state: Arc<AppState>) -> Router {
    let max_in_flight = if state.config.max_in_flight_requests == 0 {
        usize::MAX
    } else {
        state.config.max_in_flight_requests
    };
    let access_state = state.clone();
    http::router(state)
        .layer(CompressionLayer::new().compress_when(NoImageCompression::new()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(false)),
        )
        .layer(SetSensitiveHeadersLayer::new([
            header::AUTHORIZATION,
            header::COOKIE,
            header::SET_COOKIE,
        ]))
        .layer(middleware::from_fn(move |request, next| {
            let state = access_state.clone();
            async move { http::access_middleware(state, request, next).await }
        }))
        .layer(ConcurrencyLimitLayer::new(max_in_flight))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;
    info!(
        cdn_configured = config.cdn.is_some(),
        rate_limit_per_minute = config.rate_limit_per_minute,
        download_rate_limit_per_minute = config.download_rate_limit_per_minute,
        download_allowed_hosts = ?config.download_allowed_hosts,
        transform_strict = config.transform_strict,
        "startup config summary"
    );

    let config = Arc::new(config);
    let db = Database::new(&config).await?;
    let cdn = CdnClient::new(config.clone())?;
    let state = Arc::new(AppState::new(config.clone(), db, cdn));

    let app = build_app(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(address = %addr, "wallpaper gateway listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
