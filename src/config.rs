use anyhow::{Result, anyhow};
use ipnet::IpNet;
use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub cdn: Option<CdnCredentials>,
    pub cdn_timeout: Duration,
    pub cdn_connect_timeout: Duration,
    pub max_proxy_bytes: u64,
    pub default_list_limit: usize,
    pub max_list_limit: usize,
    pub rate_limit_per_minute: u64,
    pub download_rate_limit_per_minute: u64,
    pub download_allowed_hosts: Vec<String>,
    pub download_exempt_keys: Vec<String>,
    pub transform_strict: bool,
    pub trusted_proxies: Vec<IpNet>,
    pub max_in_flight_requests: usize,
}

/// Admin-API credentials for the image CDN. Absent credentials are not an
/// error: listing degrades to empty results so gallery pages render as
/// "no results" instead of crashing.
#[derive(Debug, Clone)]
pub struct CdnCredentials {
    pub cloud_name: String,
    pub api_key: String,
    pub api_secret: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = parse_u16("PORT", 8080);
        let db_path = PathBuf::from(
            env::var("DB_PATH").unwrap_or_else(|_| "/var/lib/wallpaper-gateway/gateway.db".to_string()),
        );

        let cdn = parse_cdn_credentials();
        if cdn.is_none() {
            warn!("CDN credentials unset; listings will be empty and transforms unavailable");
        }
        let cdn_timeout = Duration::from_secs(parse_u64("CDN_TIMEOUT_SECONDS", 30));
        let cdn_connect_timeout = Duration::from_secs(parse_u64("CDN_CONNECT_TIMEOUT_SECONDS", 5));
        let max_proxy_bytes = parse_u64("MAX_PROXY_BYTES", 100 * 1024 * 1024);

        let default_list_limit = parse_usize("DEFAULT_LIST_LIMIT", 30).max(1);
        let max_list_limit = parse_usize("MAX_LIST_LIMIT", 100).max(default_list_limit);

        let rate_limit_per_minute = parse_u64("RATE_LIMIT_PER_MINUTE", 0);
        let download_rate_limit_per_minute = parse_u64("DOWNLOAD_RATE_LIMIT_PER_MINUTE", 30);
        let download_allowed_hosts = parse_list_env("DOWNLOAD_ALLOWED_HOSTS")
            .unwrap_or_else(|| {
                vec![
                    "res.cloudinary.com".to_string(),
                    "images.unsplash.com".to_string(),
                ]
            })
            .into_iter()
            .map(|host| host.to_ascii_lowercase())
            .collect();
        let download_exempt_keys = parse_list_env("DOWNLOAD_EXEMPT_KEYS").unwrap_or_default();

        let transform_strict = parse_bool("TRANSFORM_STRICT", false);
        let trusted_proxies = parse_trusted_proxies("TRUSTED_PROXY_CIDRS")?;
        warn_on_broad_proxy_ranges(&trusted_proxies);
        let max_in_flight_requests = parse_usize("MAX_IN_FLIGHT_REQUESTS", 512);

        Ok(Self {
            host,
            port,
            db_path,
            cdn,
            cdn_timeout,
            cdn_connect_timeout,
            max_proxy_bytes,
            default_list_limit,
            max_list_limit,
            rate_limit_per_minute,
            download_rate_limit_per_minute,
            download_allowed_hosts,
            download_exempt_keys,
            transform_strict,
            trusted_proxies,
            max_in_flight_requests,
        })
    }

    pub fn download_host_allowed(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.download_allowed_hosts.iter().any(|allowed| *allowed == host)
    }
}

fn parse_cdn_credentials() -> Option<CdnCredentials> {
    let cloud_name = non_empty_env("CLOUDINARY_CLOUD_NAME")?;
    let api_key = non_empty_env("CLOUDINARY_API_KEY")?;
    let api_secret = non_empty_env("CLOUDINARY_API_SECRET")?;
    Some(CdnCredentials {
        cloud_name,
        api_key,
        api_secret,
    })
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_u16(key: &str, default: u16) -> u16 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_list_env(key: &str) -> Option<Vec<String>> {
    let raw = env::var(key).ok()?;
    if raw.trim_start().starts_with('[') {
        serde_json::from_str(&raw).ok()
    } else {
        let list = raw
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect::<Vec<_>>();
        if list.is_empty() { None } else { Some(list) }
    }
}

fn parse_trusted_proxies(key: &str) -> Result<Vec<IpNet>> {
    let values = match parse_list_env(key) {
        Some(values) => values,
        None => return Ok(Vec::new()),
    };
    let mut parsed = Vec::new();
    for value in values {
        if let Ok(net) = value.parse::<IpNet>() {
            parsed.push(net);
            continue;
        }
        if let Ok(addr) = value.parse::<IpAddr>() {
            parsed.push(IpNet::from(addr));
            continue;
        }
        return Err(anyhow!("invalid trusted proxy entry in {key}: {value}"));
    }
    Ok(parsed)
}

fn warn_on_broad_proxy_ranges(trusted: &[IpNet]) {
    for net in trusted {
        let prefix = net.prefix_len();
        if net.addr().is_ipv4() {
            if prefix <= 8 {
                warn!(
                    cidr = %net,
                    "trusted proxy range is very broad; clients may spoof IPs"
                );
            }
        } else if prefix <= 32 {
            warn!(
                cidr = %net,
                "trusted proxy range is very broad; clients may spoof IPs"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn with_env_lock<F: FnOnce()>(f: F) {
        let lock = ENV_LOCK.get_or_init(|| Mutex::new(()));
        let _guard = lock.lock().unwrap();
        f();
    }

    #[test]
    fn parse_list_env_csv() {
        with_env_lock(|| {
            unsafe { env::set_var("DOWNLOAD_ALLOWED_HOSTS", "res.cloudinary.com, cdn.example.org , ,") };
            let list = parse_list_env("DOWNLOAD_ALLOWED_HOSTS").unwrap();
            assert_eq!(list, vec!["res.cloudinary.com", "cdn.example.org"]);
            unsafe { env::remove_var("DOWNLOAD_ALLOWED_HOSTS") };
        });
    }

    #[test]
    fn parse_list_env_json() {
        with_env_lock(|| {
            unsafe { env::set_var("DOWNLOAD_ALLOWED_HOSTS", r#"["a.example","b.example"]"#) };
            let list = parse_list_env("DOWNLOAD_ALLOWED_HOSTS").unwrap();
            assert_eq!(list, vec!["a.example", "b.example"]);
            unsafe { env::remove_var("DOWNLOAD_ALLOWED_HOSTS") };
        });
    }

    #[test]
    fn missing_cdn_credentials_degrade_to_none() {
        with_env_lock(|| {
            unsafe { env::remove_var("CLOUDINARY_CLOUD_NAME") };
            unsafe { env::remove_var("CLOUDINARY_API_KEY") };
            unsafe { env::remove_var("CLOUDINARY_API_SECRET") };
            let config = Config::from_env().unwrap();
            assert!(config.cdn.is_none());
        });
    }

    #[test]
    fn cdn_credentials_require_all_three_vars() {
        with_env_lock(|| {
            unsafe { env::set_var("CLOUDINARY_CLOUD_NAME", "demo") };
            unsafe { env::set_var("CLOUDINARY_API_KEY", "key") };
            unsafe { env::remove_var("CLOUDINARY_API_SECRET") };
            assert!(parse_cdn_credentials().is_none());
            unsafe { env::set_var("CLOUDINARY_API_SECRET", "secret") };
            let cdn = parse_cdn_credentials().unwrap();
            assert_eq!(cdn.cloud_name, "demo");
            unsafe { env::remove_var("CLOUDINARY_CLOUD_NAME") };
            unsafe { env::remove_var("CLOUDINARY_API_KEY") };
            unsafe { env::remove_var("CLOUDINARY_API_SECRET") };
        });
    }

    #[test]
    fn default_download_hosts_cover_cdn_and_unsplash() {
        with_env_lock(|| {
            unsafe { env::remove_var("DOWNLOAD_ALLOWED_HOSTS") };
            let config = Config::from_env().unwrap();
            assert!(config.download_host_allowed("res.cloudinary.com"));
            assert!(config.download_host_allowed("Images.Unsplash.com"));
            assert!(!config.download_host_allowed("evil.example"));
        });
    }

    #[test]
    fn invalid_trusted_proxy_entry_is_rejected() {
        with_env_lock(|| {
            unsafe { env::set_var("TRUSTED_PROXY_CIDRS", "10.0.0.0/8, not-a-cidr") };
            assert!(Config::from_env().is_err());
            unsafe { env::remove_var("TRUSTED_PROXY_CIDRS") };
        });
    }
}
