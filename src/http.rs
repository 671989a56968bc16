use crate::cdn::{CdnFetchError, ProxiedUpstream};
use crate::crop;
use crate::normalize::{self, NormalizedWallpaper};
use crate::rate_limit::RateDecision;
use crate::state::AppState;
use crate::transform::{RawTransformParams, TransformOptions, build_transform_url};
use axum::body::Body;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use ipnet::IpNet;
use serde::Deserialize;
use serde_json::Value;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use url::Url;

const MAX_FORWARDED_IPS: usize = 20;
const RATE_WINDOW: Duration = Duration::from_secs(60);
const DELIVERY_HOST: &str = "res.cloudinary.com";
const DEFAULT_DOWNLOAD_NAME: &str = "wallpaper";

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/wallpapers", get(list_wallpapers))
        .route("/api/transform", get(transform_proxy))
        .route("/api/download", get(download_proxy))
        .route("/api/devices", get(list_devices))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[derive(Debug, Deserialize)]
pub struct WallpaperQuery {
    pub folder: Option<String>,
    pub prefix: Option<String>,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

async fn list_wallpapers(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WallpaperQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(state.config.default_list_limit)
        .clamp(1, state.config.max_list_limit);
    let mut listing = state
        .cdn
        .list_resources(
            query.folder.as_deref(),
            query.prefix.as_deref(),
            limit,
            query.cursor.as_deref(),
        )
        .await
        .map_err(map_cdn_error)?;
    normalize::sort_by_created_desc(&mut listing.resources);
    let wallpapers: Vec<NormalizedWallpaper> = listing
        .resources
        .iter()
        .enumerate()
        .map(|(index, resource)| normalize::normalize(resource, index))
        .collect();
    Ok(Json(serde_json::json!({
        "wallpapers": wallpapers,
        "count": wallpapers.len(),
        "next_cursor": listing.next_cursor,
    })))
}

#[derive(Debug, Deserialize)]
pub struct TransformQuery {
    #[serde(rename = "publicId")]
    pub public_id: Option<String>,
    pub url: Option<String>,
    pub w: Option<String>,
    pub h: Option<String>,
    pub fit: Option<String>,
    pub g: Option<String>,
    pub saturation: Option<String>,
    pub hue: Option<String>,
    pub brightness: Option<String>,
    pub contrast: Option<String>,
    pub tint: Option<String>,
    #[serde(rename = "deviceProfileId")]
    pub device_profile_id: Option<String>,
}

impl TransformQuery {
    fn raw_params(&self) -> RawTransformParams {
        RawTransformParams {
            width: self.w.clone(),
            height: self.h.clone(),
            fit: self.fit.clone(),
            gravity: self.g.clone(),
            saturation: self.saturation.clone(),
            hue: self.hue.clone(),
            brightness: self.brightness.clone(),
            contrast: self.contrast.clone(),
            tint: self.tint.clone(),
        }
    }
}

async fn transform_proxy(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TransformQuery>,
) -> Result<Response, ApiError> {
    let raw = query.raw_params();
    let mut options = TransformOptions::from_raw(&raw, state.config.transform_strict)
        .map_err(|err| ApiError::bad_request(&err.to_string()))?;

    let Some(public_id) = query.public_id.as_deref().map(str::trim).filter(|id| !id.is_empty())
    else {
        // Direct delivery URLs are accepted as a fallback, restricted to the
        // CDN's own delivery host.
        if let Some(url) = query.url.as_deref() {
            let parsed = parse_proxy_url(url, |host| host == DELIVERY_HOST)?;
            return proxy_upstream(&state, parsed.as_str(), None).await;
        }
        return Err(ApiError::bad_request("publicId or url is required"));
    };

    let Some(cloud_name) = state.cdn.cloud_name().map(str::to_string) else {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "cdn not configured",
        ));
    };

    // Device profiles only apply when the caller did not pick dimensions.
    if !raw.has_dimensions() {
        if let Some(device_id) = query.device_profile_id.as_deref() {
            let profile = resolve_device_profile(&state, device_id).await?;
            let cropped = crop::crop_for(profile.physical_width(), profile.physical_height());
            options = apply_device_crop(cropped, options);
        }
    }

    let url = build_transform_url(&cloud_name, public_id, &options);
    proxy_upstream(&state, &url, None).await
}

/// Device-derived sizing wins; the caller's cosmetic adjustments ride along.
fn apply_device_crop(cropped: TransformOptions, requested: TransformOptions) -> TransformOptions {
    TransformOptions {
        saturation: requested.saturation,
        hue: requested.hue,
        brightness: requested.brightness,
        contrast: requested.contrast,
        tint: requested.tint,
        ..cropped
    }
}

async fn resolve_device_profile(
    state: &AppState,
    device_id: &str,
) -> Result<crate::db::DeviceProfile, ApiError> {
    let id = device_id
        .trim()
        .parse::<i64>()
        .map_err(|_| ApiError::bad_request("invalid deviceProfileId"))?;
    state
        .db
        .get_device_profile(id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::bad_request("unknown deviceProfileId"))
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub url: Option<String>,
    pub filename: Option<String>,
}

async fn download_proxy(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let Some(url) = query.url.as_deref().map(str::trim).filter(|url| !url.is_empty()) else {
        return Err(ApiError::bad_request("url is required"));
    };

    let exempt = bearer_token(&headers)
        .map(|token| is_exempt_key(token, &state.config.download_exempt_keys))
        .unwrap_or(false);
    if !exempt {
        let ip = client_ip(Some(peer.ip()), &headers, &state.config.trusted_proxies);
        if let Some(ip) = ip {
            let decision = state.download_limiter.consume_ip(
                ip,
                state.config.download_rate_limit_per_minute,
                RATE_WINDOW,
            );
            if !decision.allowed {
                return Ok(rate_limit_response(decision));
            }
        }
    }

    let parsed = parse_proxy_url(url, |host| state.config.download_host_allowed(host))?;
    let filename = download_filename(query.filename.as_deref(), &parsed);
    proxy_upstream(&state, parsed.as_str(), Some(&filename)).await
}

async fn list_devices(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let profiles = state.db.list_device_profiles().await?;
    Ok(Json(serde_json::json!({ "devices": profiles })))
}

/// Validates scheme and host, never silently coercing a bad URL.
fn parse_proxy_url(url: &str, host_allowed: impl Fn(&str) -> bool) -> Result<Url, ApiError> {
    let parsed = Url::parse(url).map_err(|_| ApiError::bad_request("malformed url"))?;
    if parsed.scheme() != "https" {
        return Err(ApiError::bad_request("only https urls are allowed"));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| ApiError::bad_request("url has no host"))?;
    if !host_allowed(&host.to_ascii_lowercase()) {
        return Err(ApiError::bad_request("url host not allowed"));
    }
    Ok(parsed)
}

/// Fetches the upstream URL and passes the byte stream through unmodified.
async fn proxy_upstream(
    state: &AppState,
    url: &str,
    attachment_name: Option<&str>,
) -> Result<Response, ApiError> {
    let upstream = state.cdn.open_stream(url).await.map_err(map_fetch_error)?;
    Ok(upstream_response(upstream, attachment_name))
}

fn upstream_response(upstream: ProxiedUpstream, attachment_name: Option<&str>) -> Response {
    let mut headers = HeaderMap::new();
    let content_type = upstream
        .content_type
        .as_ref()
        .map(|mime| mime.essence_str().to_string())
        .unwrap_or_else(|| mime::APPLICATION_OCTET_STREAM.essence_str().to_string());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or(HeaderValue::from_static("application/octet-stream")),
    );
    if let Some(length) = upstream.content_length {
        if let Ok(value) = HeaderValue::from_str(&length.to_string()) {
            headers.insert(header::CONTENT_LENGTH, value);
        }
    }
    if let Some(name) = attachment_name {
        let disposition = format!("attachment; filename=\"{name}\"");
        headers.insert(
            header::CONTENT_DISPOSITION,
            HeaderValue::from_str(&disposition)
                .unwrap_or(HeaderValue::from_static("attachment")),
        );
    }
    let body = Body::from_stream(upstream.response.bytes_stream());
    (StatusCode::OK, headers, body).into_response()
}

fn download_filename(requested: Option<&str>, url: &Url) -> String {
    if let Some(name) = requested.map(sanitize_filename).filter(|name| !name.is_empty()) {
        return name;
    }
    url.path_segments()
        .and_then(|mut segments| segments.next_back().map(sanitize_filename))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_DOWNLOAD_NAME.to_string())
}

fn sanitize_filename(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .filter(|ch| ch.is_ascii() && !ch.is_ascii_control())
        .map(|ch| match ch {
            '"' | '\\' | '/' => '_',
            other => other,
        })
        .collect();
    sanitized.truncate(128);
    sanitized.trim_matches(['.', ' ', '_']).to_string()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn is_exempt_key(token: &str, exempt_keys: &[String]) -> bool {
    exempt_keys.iter().any(|key| {
        key.len() == token.len() && key.as_bytes().ct_eq(token.as_bytes()).into()
    })
}

/// Global per-IP limiter, checked before routing. Health probes skip it.
pub async fn access_middleware(
    state: Arc<AppState>,
    request: axum::http::Request<Body>,
    next: Next,
) -> Response {
    if request.uri().path() == "/healthz" {
        return next.run(request).await;
    }
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());
    let ip = client_ip(peer, request.headers(), &state.config.trusted_proxies);
    if let Some(ip) = ip {
        let decision =
            state
                .rate_limiter
                .consume_ip(ip, state.config.rate_limit_per_minute, RATE_WINDOW);
        if !decision.allowed {
            return rate_limit_response(decision);
        }
    }
    next.run(request).await
}

fn rate_limit_response(decision: RateDecision) -> Response {
    let retry_after = decision.retry_after_seconds();
    let mut response =
        ApiError::new(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded").into_response();
    let headers = response.headers_mut();
    let _ = headers.insert(
        header::RETRY_AFTER,
        HeaderValue::from_str(&retry_after.to_string()).unwrap_or(HeaderValue::from_static("60")),
    );
    let _ = headers.insert(
        "X-RateLimit-Limit",
        HeaderValue::from_str(&decision.limit.to_string())
            .unwrap_or(HeaderValue::from_static("0")),
    );
    let _ = headers.insert(
        "X-RateLimit-Remaining",
        HeaderValue::from_str(&decision.remaining.to_string())
            .unwrap_or(HeaderValue::from_static("0")),
    );
    let _ = headers.insert(
        "X-RateLimit-Reset",
        HeaderValue::from_str(&decision.reset_at_ms.to_string())
            .unwrap_or(HeaderValue::from_static("0")),
    );
    response
}

pub(crate) fn client_ip(
    peer_ip: Option<IpAddr>,
    headers: &HeaderMap,
    trusted_proxies: &[IpNet],
) -> Option<IpAddr> {
    if trusted_proxies.is_empty() {
        return peer_ip;
    }
    let peer_ip = peer_ip?;
    let trusted = trusted_proxies.iter().any(|net| net.contains(&peer_ip));
    if !trusted {
        return Some(peer_ip);
    }
    let mut forwarded = parse_forwarded_chain(headers);
    if forwarded.len() > MAX_FORWARDED_IPS {
        forwarded.truncate(MAX_FORWARDED_IPS);
    }
    Some(select_client_ip(forwarded, trusted_proxies, peer_ip))
}

fn select_client_ip(mut forwarded: Vec<IpAddr>, trusted: &[IpNet], peer_ip: IpAddr) -> IpAddr {
    forwarded.push(peer_ip);
    for ip in forwarded.iter().rev() {
        let is_trusted = trusted.iter().any(|net| net.contains(ip));
        if !is_trusted {
            return *ip;
        }
    }
    peer_ip
}

fn parse_forwarded_chain(headers: &HeaderMap) -> Vec<IpAddr> {
    if let Some(value) = headers.get("x-forwarded-for") {
        if let Ok(value) = value.to_str() {
            return parse_x_forwarded_for(value);
        }
    }
    if let Some(value) = headers.get("forwarded") {
        if let Ok(value) = value.to_str() {
            return parse_forwarded_header(value);
        }
    }
    Vec::new()
}

fn parse_x_forwarded_for(value: &str) -> Vec<IpAddr> {
    let mut ips = Vec::new();
    for item in value.split(',') {
        if ips.len() >= MAX_FORWARDED_IPS {
            break;
        }
        if let Some(ip) = parse_ip_candidate(item.trim()) {
            ips.push(ip);
        }
    }
    ips
}

fn parse_forwarded_header(value: &str) -> Vec<IpAddr> {
    let mut ips = Vec::new();
    for segment in value.split(',') {
        if ips.len() >= MAX_FORWARDED_IPS {
            break;
        }
        for pair in segment.split(';') {
            if ips.len() >= MAX_FORWARDED_IPS {
                break;
            }
            let pair = pair.trim();
            let (key, value) = match pair.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => continue,
            };
            if !key.eq_ignore_ascii_case("for") {
                continue;
            }
            let cleaned = value.trim_matches('"');
            if let Some(ip) = parse_ip_candidate(cleaned) {
                ips.push(ip);
            }
        }
    }
    ips
}

fn parse_ip_candidate(value: &str) -> Option<IpAddr> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("unknown") {
        return None;
    }
    if let Some(bracketed) = trimmed.strip_prefix('[') {
        if let Some(end) = bracketed.find(']') {
            if let Ok(addr) = bracketed[..end].parse::<IpAddr>() {
                return Some(addr);
            }
        }
    }
    if let Ok(addr) = trimmed.parse::<IpAddr>() {
        return Some(addr);
    }
    if let Some((host, _)) = trimmed.rsplit_once(':') {
        if let Ok(addr) = host.parse::<IpAddr>() {
            return Some(addr);
        }
    }
    None
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: Value,
    pub headers: HeaderMap,
}

impl ApiError {
    pub fn new(status: StatusCode, message: &str) -> Self {
        Self {
            status,
            body: serde_json::json!({ "error": message }),
            headers: HeaderMap::new(),
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        if let Value::Object(map) = &mut self.body {
            map.insert(key.to_string(), value);
        }
        self
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::warn!(error = ?error, "request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "request failed")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error_message = extract_error_message(&self.body);
        let mut response = (self.status, Json(self.body)).into_response();
        response.headers_mut().extend(self.headers);
        if let Some(message) = error_message {
            let sanitized = sanitize_error_header(&message);
            if let Ok(value) = HeaderValue::from_str(&sanitized) {
                response.headers_mut().insert("X-Gateway-Error", value);
            }
        }
        response
    }
}

fn extract_error_message(body: &Value) -> Option<String> {
    let Value::Object(map) = body else {
        return None;
    };
    map.get("error")
        .and_then(|value| value.as_str())
        .map(|value| value.to_string())
}

fn sanitize_error_header(value: &str) -> String {
    let mut sanitized: String = value
        .chars()
        .filter(|ch| ch.is_ascii() && !ch.is_control())
        .collect();
    sanitized.truncate(200);
    sanitized
}

fn map_fetch_error(error: CdnFetchError) -> ApiError {
    match &error {
        CdnFetchError::TooLarge => {
            ApiError::new(StatusCode::PAYLOAD_TOO_LARGE, "upstream response too large")
        }
        CdnFetchError::UpstreamStatus { status, detail } => {
            ApiError::new(StatusCode::BAD_GATEWAY, "upstream fetch failed")
                .with_field("upstream_status", Value::from(status.as_u16()))
                .with_field("upstream_detail", Value::from(detail.clone()))
        }
        CdnFetchError::Upstream(err) => {
            tracing::warn!(error = ?err, "upstream fetch failed");
            ApiError::new(StatusCode::BAD_GATEWAY, "upstream fetch failed")
        }
    }
}

fn map_cdn_error(error: anyhow::Error) -> ApiError {
    if let Some(fetch_error) = error.downcast_ref::<CdnFetchError>() {
        let mapped = match fetch_error {
            CdnFetchError::UpstreamStatus { status, detail } => {
                ApiError::new(StatusCode::BAD_GATEWAY, "cdn listing failed")
                    .with_field("upstream_status", Value::from(status.as_u16()))
                    .with_field("upstream_detail", Value::from(detail.clone()))
            }
            _ => ApiError::new(StatusCode::BAD_GATEWAY, "cdn listing failed"),
        };
        return mapped;
    }
    if error.downcast_ref::<reqwest::Error>().is_some() {
        return ApiError::new(StatusCode::BAD_GATEWAY, "cdn listing failed");
    }
    ApiError::from(error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x_forwarded_for_parses_ips_and_skips_garbage() {
        let ips = parse_x_forwarded_for("203.0.113.7, unknown, 10.0.0.1, not-an-ip");
        assert_eq!(ips.len(), 2);
        assert_eq!(ips[0], "203.0.113.7".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn forwarded_header_extracts_for_pairs() {
        let ips = parse_forwarded_header(r#"for="203.0.113.7";proto=https, for="[2001:db8::1]:443""#);
        assert_eq!(ips.len(), 2);
        assert_eq!(ips[1], "2001:db8::1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn client_ip_ignores_forwarding_without_trusted_proxies() {
        let peer = "198.51.100.2".parse::<IpAddr>().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7"));
        assert_eq!(client_ip(Some(peer), &headers, &[]), Some(peer));
    }

    #[test]
    fn client_ip_walks_past_trusted_hops() {
        let trusted = vec!["10.0.0.0/8".parse::<IpNet>().unwrap()];
        let peer = "10.0.0.1".parse::<IpAddr>().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.2"),
        );
        assert_eq!(
            client_ip(Some(peer), &headers, &trusted),
            Some("203.0.113.7".parse().unwrap())
        );
    }

    #[test]
    fn spoofed_header_from_untrusted_peer_is_ignored() {
        let trusted = vec!["10.0.0.0/8".parse::<IpNet>().unwrap()];
        let peer = "198.51.100.2".parse::<IpAddr>().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7"));
        assert_eq!(client_ip(Some(peer), &headers, &trusted), Some(peer));
    }

    #[test]
    fn proxy_url_rejects_bad_scheme_and_host() {
        let allow_cdn = |host: &str| host == "res.cloudinary.com";
        assert!(parse_proxy_url("https://res.cloudinary.com/demo/image/upload/a.png", allow_cdn).is_ok());
        assert!(parse_proxy_url("http://res.cloudinary.com/a.png", allow_cdn).is_err());
        assert!(parse_proxy_url("https://evil.example/a.png", allow_cdn).is_err());
        assert!(parse_proxy_url("not a url", allow_cdn).is_err());
    }

    #[test]
    fn download_filename_prefers_sanitized_request_name() {
        let url = Url::parse("https://res.cloudinary.com/demo/image/upload/cats/fluffy.png").unwrap();
        assert_eq!(
            download_filename(Some("my wall\"paper.png"), &url),
            "my wall_paper.png"
        );
        assert_eq!(download_filename(None, &url), "fluffy.png");
        let bare = Url::parse("https://res.cloudinary.com/").unwrap();
        assert_eq!(download_filename(Some("..."), &bare), "wallpaper");
    }

    #[test]
    fn exempt_key_matching_is_exact() {
        let keys = vec!["premium-key-123".to_string()];
        assert!(is_exempt_key("premium-key-123", &keys));
        assert!(!is_exempt_key("premium-key-12", &keys));
        assert!(!is_exempt_key("premium-key-124", &keys));
        assert!(!is_exempt_key("premium-key-123", &[]));
    }

    #[test]
    fn bearer_token_extraction_trims_and_rejects_empty() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer  abc "));
        assert_eq!(bearer_token(&headers), Some("abc"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn device_crop_keeps_caller_adjustments() {
        let cropped = crop::crop_for(1920.0, 1080.0);
        let requested = TransformOptions {
            saturation: Some(20),
            ..TransformOptions::default()
        };
        let merged = apply_device_crop(cropped, requested);
        assert_eq!(merged.width, Some(1920));
        assert_eq!(merged.saturation, Some(20));
        assert!(merged.auto_quality);
    }

    #[test]
    fn api_error_carries_json_envelope_and_header() {
        let response = ApiError::bad_request("url host not allowed").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get("X-Gateway-Error").unwrap(),
            "url host not allowed"
        );
    }
}
