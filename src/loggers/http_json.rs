//! Posts run records as JSON to a generic HTTP endpoint.

use std::time::Duration;

use async_trait::async_trait;
use governor::{
    clock::DefaultClock,
    state::{direct::NotKeyed, InMemoryState},
    Quota, RateLimiter,
};
use reqwest::{header::AUTHORIZATION, Client};
use serde::Deserialize;

use crate::error::{AppResult, LoggerError};
use crate::logger::{parse_settings, RunLogger};
use crate::run_info::RunInfo;

/// Settings table for `type = "http_json"`.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpJsonSettings {
    /// Endpoint receiving `POST` requests
    pub url: String,
    /// Sent as `Authorization: Bearer <token>` when set
    #[serde(default)]
    pub bearer_token: Option<String>,
    /// Per-request timeout
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Minimum spacing between posts (0 = unlimited)
    #[serde(default, with = "humantime_serde")]
    pub min_interval: Duration,
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Forwards the serde representation of each record to an HTTP endpoint.
pub struct HttpJsonRunLogger {
    id: String,
    client: Client,
    settings: HttpJsonSettings,
    rate_limiter: Option<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl HttpJsonRunLogger {
    /// Fails if `url` does not parse.
    pub fn new(id: impl Into<String>, settings: HttpJsonSettings) -> AppResult<Self> {
        let id = id.into();
        reqwest::Url::parse(&settings.url).map_err(|e| {
            LoggerError::Configuration(format!("Logger '{id}' has invalid url '{}': {e}", settings.url))
        })?;

        let client = Client::builder().timeout(settings.timeout).build()?;
        let rate_limiter = Quota::with_period(settings.min_interval).map(RateLimiter::direct);

        Ok(Self {
            id,
            client,
            settings,
            rate_limiter,
        })
    }

    /// Factory for `type = "http_json"`.
    pub fn from_config(id: &str, settings: &toml::Value) -> AppResult<Box<dyn RunLogger>> {
        let settings: HttpJsonSettings = parse_settings(id, settings)?;
        Ok(Box::new(Self::new(id, settings)?))
    }
}

#[async_trait]
impl RunLogger for HttpJsonRunLogger {
    fn name(&self) -> &str {
        &self.id
    }

    async fn log_run(&mut self, info: &RunInfo) -> AppResult<()> {
        if let Some(limiter) = &self.rate_limiter {
            limiter.until_ready().await;
        }

        let mut request = self.client.post(&self.settings.url).json(info);
        if let Some(token) = &self.settings.bearer_token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LoggerError::Http(format!(
                "{} returned {status} for run {}: {body}",
                self.settings.url, info.run_number
            )));
        }

        tracing::debug!(
            logger_id = %self.id,
            run_number = info.run_number,
            %status,
            "Posted run record"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Accepts one connection, captures the raw request and answers with `status_line`.
    async fn serve_once(status_line: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw);
                if let Some(split) = text.find("\r\n\r\n") {
                    let content_length = text[..split]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if raw.len() >= split + 4 + content_length {
                        break;
                    }
                }
            }
            let response = format!("{status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            stream.write_all(response.as_bytes()).await.unwrap();
            let _ = tx.send(String::from_utf8_lossy(&raw).into_owned());
        });

        (format!("http://{addr}/runs"), rx)
    }

    fn settings(url: String) -> HttpJsonSettings {
        HttpJsonSettings {
            url,
            bearer_token: None,
            timeout: Duration::from_secs(5),
            min_interval: Duration::ZERO,
        }
    }

    fn sample_run() -> RunInfo {
        let start = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        RunInfo::new(321, start, "physics").with_components(["tpc01"])
    }

    #[tokio::test]
    async fn test_posts_json_with_bearer_token() {
        let (url, captured) = serve_once("HTTP/1.1 200 OK").await;
        let mut s = settings(url);
        s.bearer_token = Some("secret".to_string());
        let mut logger = HttpJsonRunLogger::new("http", s).unwrap();

        logger.log_run(&sample_run()).await.unwrap();

        let request = captured.await.unwrap();
        assert!(request.starts_with("POST /runs HTTP/1.1"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer secret"));
        assert!(request.contains(r#""run_number":321"#));
        assert!(request.contains(r#""components":["tpc01"]"#));
    }

    #[tokio::test]
    async fn test_non_success_status_is_error() {
        let (url, _captured) = serve_once("HTTP/1.1 503 Service Unavailable").await;
        let mut logger = HttpJsonRunLogger::new("http", settings(url)).unwrap();

        let err = logger.log_run(&sample_run()).await.unwrap_err();
        match err {
            LoggerError::Http(msg) => assert!(msg.contains("503")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_invalid_url_rejected() {
        let result = HttpJsonRunLogger::new("http", settings("not a url".to_string()));
        assert!(matches!(result, Err(LoggerError::Configuration(_))));
    }

    #[test]
    fn test_settings_parse_humantime() {
        let value: toml::Value = toml::from_str(
            r#"
            url = "http://localhost:8080/runs"
            timeout = "3s"
            min_interval = "500ms"
            "#,
        )
        .unwrap();
        let parsed: HttpJsonSettings = parse_settings("http", &value).unwrap();
        assert_eq!(parsed.timeout, Duration::from_secs(3));
        assert_eq!(parsed.min_interval, Duration::from_millis(500));
        assert!(parsed.bearer_token.is_none());
    }
}
