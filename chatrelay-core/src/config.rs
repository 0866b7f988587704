use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::emitter::FlushPolicy;
use crate::error::{CoreResult, RelayError};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerCfg {
    /// Socket address the HTTP listener binds to.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Path of the streaming chat endpoint.
    #[serde(default = "default_route")]
    pub route: String,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            route: default_route(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8000".into()
}
fn default_route() -> String {
    "/ai/chat/stream".into()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UpstreamCfg {
    /// Name of the environment variable that contains the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Name of the environment variable that contains the API URL.
    #[serde(default = "default_api_url_env")]
    pub api_url_env: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Ask the upstream to append a usage block to the final chunk.
    #[serde(default = "default_true")]
    pub include_usage: bool,
}

impl Default for UpstreamCfg {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            api_url_env: default_api_url_env(),
            model: default_model(),
            include_usage: true,
        }
    }
}

fn default_api_key_env() -> String {
    "LLM_API_KEY".into()
}
fn default_api_url_env() -> String {
    "LLM_API_URL".into()
}
fn default_model() -> String {
    "qwen-plus".into()
}
fn default_true() -> bool {
    true
}

/// Credentials and endpoint for one upstream call, resolved from the process
/// environment at request time.
#[derive(Debug)]
pub struct UpstreamSettings {
    pub api_key: SecretString,
    pub endpoint: String,
    pub model: String,
    pub include_usage: bool,
}

impl UpstreamCfg {
    /// Read the API key and URL from the environment. Not cached: operators
    /// may rotate either value while the server is running.
    pub fn resolve(&self) -> CoreResult<UpstreamSettings> {
        let api_key = read_env(&self.api_key_env)?;
        let api_url = read_env(&self.api_url_env)?;
        Ok(UpstreamSettings {
            api_key: SecretString::from(api_key),
            endpoint: completions_endpoint(&api_url)?,
            model: self.model.clone(),
            include_usage: self.include_usage,
        })
    }
}

fn read_env(name: &str) -> CoreResult<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(RelayError::ConfigMissing {
            which: name.to_string(),
        }),
    }
}

/// Accept either a base URL (`https://host/compatible-mode/v1`) or the full
/// chat-completions URL. Only the path is inspected, so query parameters
/// such as `?api-version=...` are kept as given.
pub fn completions_endpoint(api_url: &str) -> CoreResult<String> {
    let mut url = reqwest::Url::parse(api_url).map_err(|e| {
        RelayError::Validation(format!("api url {api_url:?} is not a valid URL: {e}"))
    })?;
    let path = url.path().trim_end_matches('/').to_string();
    if path.ends_with("/chat/completions") {
        url.set_path(&path);
    } else {
        url.set_path(&format!("{path}/chat/completions"));
    }
    Ok(url.into())
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 8000ms). There is no
    /// total request timeout: streams may legitimately run for minutes.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
    #[serde(default = "default_pool_idle_timeout_ms")]
    pub pool_idle_timeout_ms: u64,
    #[serde(default = "default_tcp_keepalive_ms")]
    pub tcp_keepalive_ms: u64,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            pool_max_idle_per_host: None,
            pool_idle_timeout_ms: default_pool_idle_timeout_ms(),
            tcp_keepalive_ms: default_tcp_keepalive_ms(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    8_000
}
fn default_pool_idle_timeout_ms() -> u64 {
    90_000
}
fn default_tcp_keepalive_ms() -> u64 {
    30_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StreamCfg {
    /// Longest upstream line kept in memory; the remainder is dropped.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    /// Cap on how much of an upstream error body is read and echoed.
    #[serde(default = "default_error_excerpt_bytes")]
    pub error_excerpt_bytes: usize,
    #[serde(default)]
    pub flush: FlushPolicy,
}

impl Default for StreamCfg {
    fn default() -> Self {
        Self {
            max_line_bytes: default_max_line_bytes(),
            error_excerpt_bytes: default_error_excerpt_bytes(),
            flush: FlushPolicy::default(),
        }
    }
}

fn default_max_line_bytes() -> usize {
    64 << 10
}
fn default_error_excerpt_bytes() -> usize {
    8 << 10
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CorsCfg {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_allow_origin")]
    pub allow_origin: String,
}

impl Default for CorsCfg {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_origin: default_allow_origin(),
        }
    }
}

fn default_allow_origin() -> String {
    "*".into()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerCfg,
    #[serde(default)]
    pub upstream: UpstreamCfg,
    /// HTTP client configuration (timeouts, pooling). Missing → defaults.
    #[serde(default)]
    pub http: HttpCfg,
    #[serde(default)]
    pub stream: StreamCfg,
    #[serde(default)]
    pub cors: CorsCfg,
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(RelayError::from)?;
        let s = std::str::from_utf8(&bytes).map_err(|e| RelayError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                serde_json::from_str::<Self>(s).map_err(|e| RelayError::Other(e.into()))?
            }
            Some("toml") => toml::from_str::<Self>(s).map_err(|e| RelayError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| RelayError::Other(e.into()))
                .or_else(|_| toml::from_str::<Self>(s).map_err(|e| RelayError::Other(e.into())))?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if !self.server.route.starts_with('/') {
            return Err(RelayError::Validation(format!(
                "server.route must start with '/': {}",
                self.server.route
            )));
        }
        if self.stream.max_line_bytes == 0 {
            return Err(RelayError::Validation(
                "stream.max_line_bytes must be positive".into(),
            ));
        }
        if let FlushPolicy::Threshold(0) = self.stream.flush {
            return Err(RelayError::Validation(
                "stream.flush threshold must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn load_from_json() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("relay.json");
        let json = r#"{
          "server": {"bind": "127.0.0.1:9000"},
          "upstream": {"api_key_env": "MY_KEY", "model": "deepseek-v3.1"},
          "stream": {"max_line_bytes": 1024, "flush": {"threshold": 256}}
        }"#;
        fs::write(&file, json).unwrap();
        let cfg = Config::from_path(&file).unwrap();
        assert_eq!(cfg.server.bind, "127.0.0.1:9000");
        assert_eq!(cfg.server.route, "/ai/chat/stream");
        assert_eq!(cfg.upstream.api_key_env, "MY_KEY");
        assert_eq!(cfg.upstream.api_url_env, "LLM_API_URL");
        assert_eq!(cfg.upstream.model, "deepseek-v3.1");
        assert!(cfg.upstream.include_usage);
        assert_eq!(cfg.stream.max_line_bytes, 1024);
        assert_eq!(cfg.stream.error_excerpt_bytes, 8 << 10);
        assert_eq!(cfg.stream.flush, FlushPolicy::Threshold(256));
        assert_eq!(cfg.http.connect_timeout_ms, 8_000);
        assert_eq!(cfg.http.pool_max_idle_per_host, None);
    }

    #[test]
    fn load_from_toml() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("relay.toml");
        let toml = r#"
[server]
bind = "127.0.0.1:9100"
route = "/chat"

[upstream]
model = "qwen-max"
include_usage = false

[http]
connect_timeout_ms = 2000
pool_max_idle_per_host = 4

[stream]
flush = "every_chunk"

[cors]
enabled = false
"#;
        fs::write(&file, toml).unwrap();
        let cfg = Config::from_path(&file).unwrap();
        assert_eq!(cfg.server.route, "/chat");
        assert_eq!(cfg.upstream.model, "qwen-max");
        assert!(!cfg.upstream.include_usage);
        assert_eq!(cfg.http.connect_timeout_ms, 2_000);
        assert_eq!(cfg.http.pool_max_idle_per_host, Some(4));
        assert_eq!(cfg.stream.flush, FlushPolicy::EveryChunk);
        assert!(!cfg.cors.enabled);
        assert_eq!(cfg.cors.allow_origin, "*");
    }

    #[test]
    fn empty_json_object_yields_defaults() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("empty.json");
        fs::write(&file, "{}").unwrap();
        let cfg = Config::from_path(&file).unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn missing_file_returns_io_error() {
        let missing = std::path::PathBuf::from("/definitely/not/here/chatrelay-missing.json");
        let err = Config::from_path(&missing).unwrap_err();
        match err {
            RelayError::Io(_) => {}
            other => panic!("expected Io error, got: {:?}", other),
        }
    }

    #[test]
    fn bad_utf8_returns_other_error() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("bad.bin");
        fs::write(&file, vec![0xff, 0xfe, 0xfd, 0x00, 0x80]).unwrap();
        let err = Config::from_path(&file).unwrap_err();
        match err {
            RelayError::Other(_) => {}
            other => panic!("expected Other(utf8) error, got: {:?}", other),
        }
    }

    #[test]
    fn unknown_extension_falls_back_to_json_then_toml() {
        let dir = tempdir().unwrap();
        let json_path = dir.path().join("relay.conf");
        fs::write(&json_path, r#"{"upstream":{"model":"m-json"}}"#).unwrap();
        let cfg = Config::from_path(&json_path).unwrap();
        assert_eq!(cfg.upstream.model, "m-json");

        let toml_path = dir.path().join("relay2.conf");
        fs::write(&toml_path, "[upstream]\nmodel = \"m-toml\"\n").unwrap();
        let cfg = Config::from_path(&toml_path).unwrap();
        assert_eq!(cfg.upstream.model, "m-toml");
    }

    #[test]
    fn invalid_route_is_rejected() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("bad_route.json");
        fs::write(&file, r#"{"server":{"route":"chat"}}"#).unwrap();
        let err = Config::from_path(&file).unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
    }

    #[test]
    fn endpoint_accepts_base_or_full_url() {
        assert_eq!(
            completions_endpoint("https://dashscope.aliyuncs.com/compatible-mode/v1").unwrap(),
            "https://dashscope.aliyuncs.com/compatible-mode/v1/chat/completions"
        );
        assert_eq!(
            completions_endpoint("https://api.example.com/v1/chat/completions/").unwrap(),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            completions_endpoint("http://127.0.0.1:8080").unwrap(),
            "http://127.0.0.1:8080/chat/completions"
        );
    }

    #[test]
    fn endpoint_keeps_query_string_out_of_the_path() {
        assert_eq!(
            completions_endpoint("https://api.example.com/v1?api-version=2024-06").unwrap(),
            "https://api.example.com/v1/chat/completions?api-version=2024-06"
        );
        assert_eq!(
            completions_endpoint("https://api.example.com/v1/chat/completions?api-version=x").unwrap(),
            "https://api.example.com/v1/chat/completions?api-version=x"
        );
    }

    #[test]
    fn endpoint_rejects_unparseable_url() {
        let err = completions_endpoint("not a url").unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
    }

    #[test]
    fn resolve_reads_environment_each_time() {
        let cfg = UpstreamCfg {
            api_key_env: "CHATRELAY_TEST_RESOLVE_KEY".into(),
            api_url_env: "CHATRELAY_TEST_RESOLVE_URL".into(),
            ..Default::default()
        };
        // SAFETY: variable names are unique to this test.
        unsafe {
            std::env::remove_var("CHATRELAY_TEST_RESOLVE_KEY");
            std::env::set_var("CHATRELAY_TEST_RESOLVE_URL", "http://localhost:1/v1");
        }
        match cfg.resolve().unwrap_err() {
            RelayError::ConfigMissing { which } => assert_eq!(which, "CHATRELAY_TEST_RESOLVE_KEY"),
            other => panic!("expected ConfigMissing, got: {:?}", other),
        }

        unsafe {
            std::env::set_var("CHATRELAY_TEST_RESOLVE_KEY", "  sk-test-1234  ");
        }
        let settings = cfg.resolve().unwrap();
        assert_eq!(settings.api_key.expose_secret(), "sk-test-1234");
        assert_eq!(settings.endpoint, "http://localhost:1/v1/chat/completions");
        assert_eq!(settings.model, "qwen-plus");

        unsafe {
            std::env::set_var("CHATRELAY_TEST_RESOLVE_URL", "   ");
        }
        match cfg.resolve().unwrap_err() {
            RelayError::ConfigMissing { which } => assert_eq!(which, "CHATRELAY_TEST_RESOLVE_URL"),
            other => panic!("expected ConfigMissing, got: {:?}", other),
        }
    }
}
