use std::time::Duration;

use chrono::Utc;
use harvest_core::error::AppError;
use harvest_core::models::MarketData;
use harvest_core::traits::MarketDataFetcher;
use reqwest::{Client, StatusCode};
use url::Url;

const TICKER_PLACEHOLDER: &str = "{ticker}";

/// Configuration for [`ReqwestMarketDataFetcher`].
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Request URL with a `{ticker}` placeholder.
    pub url_template: String,
    pub api_key: Option<String>,
    /// Logical endpoint name used as the circuit breaker key.
    pub endpoint: String,
    pub timeout: Duration,
}

impl FetcherConfig {
    pub fn new(url_template: impl Into<String>) -> Self {
        Self {
            url_template: url_template.into(),
            api_key: None,
            endpoint: "market-data".to_string(),
            timeout: Duration::from_secs(15),
        }
    }

    /// Read configuration from environment variables.
    ///
    /// - `HARVEST_UPSTREAM_URL` (required, must contain `{ticker}`)
    /// - `HARVEST_UPSTREAM_API_KEY` (optional, sent as a Bearer token)
    /// - `HARVEST_UPSTREAM_ENDPOINT` (optional, defaults to `market-data`)
    /// - `HARVEST_FETCH_TIMEOUT_SECS` (optional, defaults to 15)
    pub fn from_env() -> Result<Self, AppError> {
        let url_template = std::env::var("HARVEST_UPSTREAM_URL").map_err(|_| {
            AppError::ConfigError("HARVEST_UPSTREAM_URL not set. Required for collection.".into())
        })?;
        let mut config = Self::new(url_template);

        config.api_key = std::env::var("HARVEST_UPSTREAM_API_KEY")
            .ok()
            .filter(|k| !k.is_empty());
        if let Ok(endpoint) = std::env::var("HARVEST_UPSTREAM_ENDPOINT")
            && !endpoint.trim().is_empty()
        {
            config.endpoint = endpoint.trim().to_string();
        }
        if let Ok(raw) = std::env::var("HARVEST_FETCH_TIMEOUT_SECS") {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                AppError::ConfigError(format!(
                    "Invalid HARVEST_FETCH_TIMEOUT_SECS '{raw}': must be a positive integer"
                ))
            })?;
            config.timeout = Duration::from_secs(secs.max(1));
        }

        config.validate()?;
        Ok(config)
    }

    /// The template must carry the placeholder and expand to an http(s) URL.
    pub fn validate(&self) -> Result<(), AppError> {
        if !self.url_template.contains(TICKER_PLACEHOLDER) {
            return Err(AppError::ConfigError(format!(
                "Upstream URL '{}' has no {TICKER_PLACEHOLDER} placeholder",
                self.url_template
            )));
        }
        let sample = Url::parse(&self.url_template.replace(TICKER_PLACEHOLDER, "SPY"))
            .map_err(|e| AppError::ConfigError(format!("Invalid upstream URL: {e}")))?;
        match sample.scheme() {
            "http" | "https" => Ok(()),
            scheme => Err(AppError::ConfigError(format!(
                "Upstream URL scheme '{scheme}' is not allowed (only http/https)"
            ))),
        }
    }
}

/// HTTP market data fetcher using reqwest.
///
/// Every request is bounded by the configured timeout. Failures are mapped
/// onto [`AppError`] so the scheduler and circuit breaker can tell transient
/// upstream trouble from permanent payload problems.
#[derive(Clone)]
pub struct ReqwestMarketDataFetcher {
    client: Client,
    config: FetcherConfig,
}

impl ReqwestMarketDataFetcher {
    pub fn new(config: FetcherConfig) -> Result<Self, AppError> {
        config.validate()?;
        let client = Client::builder()
            .user_agent(concat!("Harvest/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self { client, config })
    }

    fn url_for(&self, ticker: &str) -> String {
        let ticker: String = url::form_urlencoded::byte_serialize(ticker.trim().as_bytes()).collect();
        self.config.url_template.replace(TICKER_PLACEHOLDER, &ticker)
    }
}

impl MarketDataFetcher for ReqwestMarketDataFetcher {
    fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    async fn fetch(&self, ticker: &str) -> Result<MarketData, AppError> {
        let url = self.url_for(ticker);
        let mut request = self.client.get(&url);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(self.config.timeout.as_secs())
            } else if e.is_connect() {
                AppError::NetworkError(format!("Connection failed: {e}"))
            } else {
                AppError::HttpError(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, ticker, &body));
        }

        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(self.config.timeout.as_secs())
            } else {
                AppError::NetworkError(format!("Failed to read response body: {e}"))
            }
        })?;

        let payload = parse_payload(&body)?;
        tracing::debug!(ticker = %ticker, endpoint = %self.config.endpoint, "Fetched market data");

        Ok(MarketData {
            ticker: ticker.trim().to_uppercase(),
            payload,
            fetched_at: Utc::now(),
        })
    }
}

/// Map a non-success status onto the error taxonomy.
fn classify_status(status: StatusCode, ticker: &str, body: &str) -> AppError {
    let status_code = status.as_u16();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return AppError::RateLimitExceeded;
    }

    let snippet: String = body.chars().take(200).collect();
    AppError::UpstreamError {
        message: format!("{ticker}: {snippet}"),
        status_code,
        retryable: status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT,
    }
}

/// The scheduler only needs a JSON document; anything else is permanent.
fn parse_payload(body: &str) -> Result<serde_json::Value, AppError> {
    let payload: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| AppError::MalformedResponse(format!("Invalid JSON: {e}")))?;
    if payload.is_null() {
        return Err(AppError::MalformedResponse("Empty payload".into()));
    }
    Ok(payload)
}
