//! # Origin HTTP Client
//!
//! One [`OriginClient`] per origin endpoint. Requests go through
//! `reqwest-middleware`, so connection resets and 5xx answers are retried with
//! exponential backoff before the caller sees them. Every reply records the
//! local instant its headers arrived and the origin's `Date` header, which is
//! what the drift calibrator needs when the document itself carries no clock.

use chrono::DateTime;
use reqwest::header::{HeaderMap, DATE};
use reqwest::{StatusCode, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};

const AGENT: &str = concat!("drawcast/", env!("CARGO_PKG_VERSION"));
const MIN_BACKOFF: Duration = Duration::from_millis(100);

/// What came back from one origin request.
#[derive(Debug)]
pub struct OriginReply<T> {
    /// Final status after retries.
    pub status: StatusCode,
    /// Decoded body of a 2xx reply.
    pub body: Option<T>,
    /// Raw body of a non-2xx reply, if readable.
    pub error_text: Option<String>,
    /// The origin's `Date` header as epoch milliseconds.
    pub date_ms: Option<i64>,
    /// When the reply headers arrived.
    pub received_at: Instant,
}

impl<T> OriginReply<T> {
    /// True for 2xx replies.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// `date_ms` aged by the time spent since the headers arrived.
    pub fn origin_now_ms(&self) -> Option<i64> {
        self.date_ms
            .map(|at| at + self.received_at.elapsed().as_millis() as i64)
    }
}

/// HTTP client bound to one origin URL and its fixed request headers.
#[derive(Clone)]
pub struct OriginClient {
    http: ClientWithMiddleware,
    url: Url,
    headers: HeaderMap,
}

impl OriginClient {
    /// Builds a client for `url`. `timeout` bounds each attempt and
    /// `max_retries` caps the transient retries.
    ///
    /// # Errors
    /// Fails when `url` is not absolute or the TLS backend cannot start.
    pub fn new(
        url: &str,
        headers: HeaderMap,
        timeout: Duration,
        max_retries: u32,
    ) -> anyhow::Result<Self> {
        let url = Url::parse(url)?;
        let backoff = ExponentialBackoff::builder()
            .retry_bounds(MIN_BACKOFF, timeout.max(MIN_BACKOFF))
            .build_with_max_retries(max_retries);
        let inner = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(AGENT)
            .build()?;

        Ok(Self {
            http: ClientBuilder::new(inner)
                .with(RetryTransientMiddleware::new_with_policy(backoff))
                .build(),
            url,
            headers,
        })
    }

    /// The origin URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// `GET`s the origin URL and decodes a JSON body.
    ///
    /// Non-2xx statuses are returned as replies, not errors; only transport
    /// failures and undecodable 2xx bodies are errors.
    pub async fn get_json<T: DeserializeOwned>(&self) -> anyhow::Result<OriginReply<T>> {
        let response = self
            .http
            .get(self.url.clone())
            .headers(self.headers.clone())
            .send()
            .await?;
        let received_at = Instant::now();
        let status = response.status();
        let date_ms = http_date_ms(response.headers());

        let (body, error_text) = if status.is_success() {
            (Some(response.json::<T>().await?), None)
        } else {
            (None, response.text().await.ok())
        };
        Ok(OriginReply {
            status,
            body,
            error_text,
            date_ms,
            received_at,
        })
    }
}

/// Parses an RFC 2822 `Date` header.
pub fn http_date_ms(headers: &HeaderMap) -> Option<i64> {
    let raw = headers.get(DATE)?.to_str().ok()?;
    DateTime::parse_from_rfc2822(raw)
        .ok()
        .map(|d| d.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn rejects_relative_urls() {
        assert!(OriginClient::new("draws/latest", HeaderMap::new(), Duration::from_secs(1), 0).is_err());
    }

    #[test]
    fn date_header_is_read_as_epoch_ms() {
        let mut headers = HeaderMap::new();
        headers.insert(DATE, HeaderValue::from_static("Mon, 02 Mar 2026 21:30:00 GMT"));
        assert_eq!(http_date_ms(&headers), Some(1_772_487_000_000));

        headers.insert(DATE, HeaderValue::from_static("yesterday"));
        assert_eq!(http_date_ms(&headers), None);
    }
}
