use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::config::TransportConfig;
use crate::error::CanonicalError;

use super::retry_policy::{
    is_retriable_status, is_retriable_transport_message, status_retry_delay,
    transport_retry_delay,
};

fn build_reqwest_client(
    config: &TransportConfig,
    proxy_url: Option<&str>,
) -> Result<reqwest::Client, CanonicalError> {
    let pool_idle_timeout = if config.http_pool_idle_timeout_secs == 0 {
        None
    } else {
        Some(Duration::from_secs(config.http_pool_idle_timeout_secs))
    };

    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(config.http_pool_max_idle_per_host)
        .pool_idle_timeout(pool_idle_timeout)
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_secs(config.connect_timeout))
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(config.timeout));

    if let Some(proxy_url) = proxy_url {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|err| CanonicalError::Transport(format!("Invalid proxy URL: {err}")))?;
        builder = builder.no_proxy().proxy(proxy);
    } else if !config.http_use_env_proxy {
        builder = builder.no_proxy();
    }

    builder
        .build()
        .map_err(|err| CanonicalError::Transport(format!("Failed to build HTTP client: {err}")))
}

/// Pooled HTTP client for upstream streaming requests.
pub struct HttpTransport {
    base_client: reqwest::Client,
    proxy_clients: FxHashMap<String, reqwest::Client>,
    retry_max_attempts: u32,
}

impl HttpTransport {
    /// Create a transport with connection pooling and timeouts from `config`.
    #[must_use]
    pub fn new(config: &TransportConfig) -> Self {
        Self::with_proxies(config, std::iter::empty::<&str>())
    }

    /// Create a transport and eagerly build one client per proxy URL.
    #[must_use]
    pub fn with_proxies<I, S>(config: &TransportConfig, proxy_urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let base_client = match build_reqwest_client(config, None) {
            Ok(client) => client,
            Err(err) => {
                tracing::error!(
                    error = %err,
                    "failed to build configured reqwest client, falling back to default client"
                );
                reqwest::Client::new()
            }
        };

        let mut proxy_clients = FxHashMap::default();
        for proxy_url in proxy_urls {
            let proxy_url = proxy_url.as_ref();
            if proxy_url.is_empty() || proxy_clients.contains_key(proxy_url) {
                continue;
            }
            match build_reqwest_client(config, Some(proxy_url)) {
                Ok(client) => {
                    proxy_clients.insert(proxy_url.to_owned(), client);
                }
                Err(err) => {
                    tracing::error!(
                        proxy_url,
                        error = %err,
                        "failed to build proxy HTTP client, requests will go direct"
                    );
                }
            }
        }

        Self {
            base_client,
            proxy_clients,
            retry_max_attempts: config.retry_max_attempts,
        }
    }

    fn client_for(&self, proxy_url: Option<&str>) -> &reqwest::Client {
        proxy_url
            .and_then(|proxy_url| self.proxy_clients.get(proxy_url))
            .unwrap_or(&self.base_client)
    }

    /// POST a streaming request and return the response once headers arrive.
    ///
    /// Retriable statuses (429/503/529) and retriable transport failures are
    /// retried before any body byte is consumed. The final response is
    /// returned whatever its status; callers map non-2xx themselves.
    ///
    /// # Errors
    ///
    /// Returns [`CanonicalError::Transport`] when the URL is invalid, or when
    /// request execution fails and retries are exhausted.
    pub async fn send_stream(
        &self,
        url: &str,
        headers: &http::HeaderMap,
        body: bytes::Bytes,
        proxy_url: Option<&str>,
    ) -> Result<reqwest::Response, CanonicalError> {
        let url = url::Url::parse(url)
            .map_err(|e| CanonicalError::Transport(format!("Invalid upstream URL: {e}")))?;
        let client = self.client_for(proxy_url);

        let mut attempt = 0;
        loop {
            let mut request = reqwest::Request::new(http::Method::POST, url.clone());
            *request.headers_mut() = headers.clone();
            *request.body_mut() = Some(reqwest::Body::from(body.clone()));

            match client.execute(request).await {
                Ok(response) => {
                    if attempt < self.retry_max_attempts && is_retriable_status(response.status())
                    {
                        let delay = status_retry_delay(response.headers(), attempt);
                        tracing::debug!(
                            status = response.status().as_u16(),
                            retry_attempt = attempt + 1,
                            delay_ms = delay.as_millis(),
                            "retrying upstream request after retriable status"
                        );
                        drop(response);
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Ok(response);
                }
                Err(err) => {
                    let message = err.to_string();
                    if attempt >= self.retry_max_attempts
                        || !is_retriable_transport_message(&message)
                    {
                        tracing::warn!(
                            error = %message,
                            attempts = attempt + 1,
                            "upstream request failed"
                        );
                        return Err(CanonicalError::Transport(message));
                    }

                    let delay = transport_retry_delay(&message, attempt);
                    tracing::debug!(
                        retry_attempt = attempt + 1,
                        delay_ms = delay.as_millis(),
                        error = %message,
                        "retrying upstream request after transport error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
