use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use crate::search::DEFAULT_RADIUS_KM;

/// Words filtered out of search results unless overridden.
pub const DEFAULT_BANNED_WORDS: &[&str] = &["fuck", "100"];

/// Command-line flags for the server, each with an environment fallback.
#[derive(Parser, Clone, Debug)]
#[clap(author, version, about = "Geo-tagged post ingestion and proximity search", long_about = None)]
pub struct Args {
    #[clap(long, env = "AROUND_ADDR", default_value = "0.0.0.0:8080")]
    pub addr: SocketAddr,

    #[clap(long, env = "AROUND_WORKER_THREADS")]
    pub worker_threads: Option<usize>,

    #[clap(long, env = "AROUND_ES_URL", default_value = "http://127.0.0.1:9200")]
    pub es_url: String,

    #[clap(long, env = "AROUND_ES_INDEX", default_value = "around")]
    pub es_index: String,

    /// Upper bound on hits requested per geo query.
    #[clap(long, env = "AROUND_ES_MAX_HITS", default_value = "10000")]
    pub es_max_hits: usize,

    #[clap(long, env = "AROUND_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    #[clap(long, env = "AROUND_DISABLE_CACHE")]
    pub disable_cache: bool,

    #[clap(long, env = "AROUND_CACHE_TTL_SECS", default_value = "30")]
    pub cache_ttl_secs: u64,

    #[clap(long, env = "AROUND_CACHE_TIMEOUT_MS", default_value = "500")]
    pub cache_timeout_ms: u64,

    #[clap(long, env = "AROUND_GCS_URL", default_value = "https://storage.googleapis.com")]
    pub gcs_url: String,

    #[clap(long, env = "AROUND_BUCKET", default_value = "post-images")]
    pub bucket: String,

    #[clap(long, env = "AROUND_GCS_TOKEN", hide_env_values = true)]
    pub gcs_token: Option<String>,

    #[clap(long, env = "AROUND_DEFAULT_RADIUS_KM", default_value_t = DEFAULT_RADIUS_KM)]
    pub default_radius_km: f64,

    /// Comma separated; replaces the default list when given.
    #[clap(long, env = "AROUND_BANNED_WORDS", value_delimiter = ',')]
    pub banned_words: Vec<String>,

    #[clap(long, env = "AROUND_IDENTITY_HEADER", default_value = "x-authenticated-user")]
    pub identity_header: String,

    #[clap(long, env = "AROUND_REQUEST_TIMEOUT_SECS", default_value = "30")]
    pub request_timeout_secs: u64,

    #[clap(long, env = "AROUND_MAX_UPLOAD_BYTES", default_value = "33554432")]
    pub max_upload_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub url: String,
    pub index: String,
    pub max_hits: usize,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub url: String,
    pub ttl: Duration,
    pub op_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AssetConfig {
    pub base_url: String,
    pub bucket: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub identity_header: String,
    pub request_timeout: Duration,
    pub max_upload_bytes: u64,
}

/// Process-wide settings, built once at startup and handed to each
/// component's constructor.
#[derive(Debug, Clone)]
pub struct Config {
    pub worker_threads: Option<usize>,
    pub index: IndexConfig,
    pub cache: CacheConfig,
    pub assets: AssetConfig,
    pub server: ServerConfig,
    pub default_radius_km: f64,
    pub banned_words: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_threads: None,
            index: IndexConfig {
                url: "http://127.0.0.1:9200".to_string(),
                index: "around".to_string(),
                max_hits: 10_000,
            },
            cache: CacheConfig {
                enabled: true,
                url: "redis://127.0.0.1:6379".to_string(),
                ttl: Duration::from_secs(30),
                op_timeout: Duration::from_millis(500),
            },
            assets: AssetConfig {
                base_url: "https://storage.googleapis.com".to_string(),
                bucket: "post-images".to_string(),
                token: None,
            },
            server: ServerConfig {
                addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
                identity_header: "x-authenticated-user".to_string(),
                request_timeout: Duration::from_secs(30),
                max_upload_bytes: 32 << 20,
            },
            default_radius_km: DEFAULT_RADIUS_KM,
            banned_words: DEFAULT_BANNED_WORDS.iter().map(|w| w.to_string()).collect(),
        }
    }
}

impl Args {
    pub fn to_config(&self) -> Config {
        let banned_words = if self.banned_words.is_empty() {
            DEFAULT_BANNED_WORDS.iter().map(|w| w.to_string()).collect()
        } else {
            self.banned_words.iter().filter(|w| !w.is_empty()).cloned().collect()
        };

        Config {
            worker_threads: self.worker_threads,
            index: IndexConfig {
                url: self.es_url.trim_end_matches('/').to_string(),
                index: self.es_index.clone(),
                max_hits: self.es_max_hits,
            },
            cache: CacheConfig {
                enabled: !self.disable_cache,
                url: self.redis_url.clone(),
                ttl: Duration::from_secs(self.cache_ttl_secs),
                op_timeout: Duration::from_millis(self.cache_timeout_ms),
            },
            assets: AssetConfig {
                base_url: self.gcs_url.trim_end_matches('/').to_string(),
                bucket: self.bucket.clone(),
                token: self.gcs_token.clone(),
            },
            server: ServerConfig {
                addr: self.addr,
                identity_header: self.identity_header.to_ascii_lowercase(),
                request_timeout: Duration::from_secs(self.request_timeout_secs),
                max_upload_bytes: self.max_upload_bytes,
            },
            default_radius_km: self.default_radius_km,
            banned_words,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_empty_command_line() {
        let args = Args::parse_from(["around"]);
        let config = args.to_config();

        assert_eq!(config.cache.ttl, Duration::from_secs(30));
        assert_eq!(config.default_radius_km, 200.0);
        assert_eq!(config.server.max_upload_bytes, 32 << 20);
        assert_eq!(config.banned_words, vec!["fuck".to_string(), "100".to_string()]);
        assert!(config.cache.enabled);
    }

    #[test]
    fn command_line_defaults_agree_with_config_default() {
        let parsed = Args::parse_from(["around"]).to_config();
        let built = Config::default();

        assert_eq!(parsed.default_radius_km, built.default_radius_km);
        assert_eq!(built.default_radius_km, DEFAULT_RADIUS_KM);
        assert_eq!(parsed.cache.ttl, built.cache.ttl);
        assert_eq!(parsed.cache.op_timeout, built.cache.op_timeout);
        assert_eq!(parsed.index.max_hits, built.index.max_hits);
        assert_eq!(parsed.banned_words, built.banned_words);
    }

    #[test]
    fn banned_words_override_and_urls_trimmed() {
        let args = Args::parse_from([
            "around",
            "--banned-words",
            "spam,,scam",
            "--es-url",
            "http://es:9200/",
            "--disable-cache",
        ]);
        let config = args.to_config();

        assert_eq!(config.banned_words, vec!["spam".to_string(), "scam".to_string()]);
        assert_eq!(config.index.url, "http://es:9200");
        assert!(!config.cache.enabled);
    }
}
