// REST client for the ride backend, rate limited on the client side

use super::{BackendError, OrderBackend};
use crate::config::BackendConfig;
use crate::orders::{HistoryPage, Order, OrderRequest, OrderStatus};
use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Jitter, Quota, RateLimiter};
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AcceptBody<'a> {
    driver_id: &'a str,
}

#[derive(Serialize)]
struct CancelBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

#[derive(Serialize)]
struct StatusBody {
    status: OrderStatus,
}

/// What a 409 means depends on the call
#[derive(Clone, Copy)]
enum ConflictMeaning {
    AlreadyClaimed,
    Plain,
}

pub struct HttpOrderBackend {
    client: Client,
    base_url: Url,
    token: RwLock<Option<String>>,
    rate_limiter: Arc<DefaultDirectRateLimiter>,
}

impl std::fmt::Debug for HttpOrderBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpOrderBackend")
            .field("base_url", &self.base_url.as_str())
            .field("has_token", &self.token.read().is_some())
            .finish()
    }
}

impl HttpOrderBackend {
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(BackendError::from)?;

        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst_capacity).unwrap_or(per_second);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(per_second).allow_burst(burst)));

        let base_url = Url::parse(&config.base_url).map_err(|e| BackendError::InvalidUrl {
            message: format!("{}: {e}", config.base_url),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(BackendError::InvalidUrl {
                message: config.base_url.clone(),
            });
        }

        Ok(Self {
            client,
            base_url,
            token: RwLock::new(config.token.clone()),
            rate_limiter,
        })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str().trim_end_matches('/')
    }

    /// Replace the bearer token after the surrounding app re-authenticates
    pub fn set_token(&self, token: Option<String>) {
        *self.token.write() = token;
    }

    /// Append path segments to the base URL. Each segment is percent-encoded,
    /// so an order id can never reach a different route.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.token.read().as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        order_id: Option<&str>,
        conflict: ConflictMeaning,
    ) -> Result<T, BackendError> {
        self.rate_limiter
            .until_ready_with_jitter(Jitter::up_to(Duration::from_millis(50)))
            .await;

        let response = self.authorize(request).send().await?;
        let response = Self::check_status(response, order_id, conflict).await?;
        response.json::<T>().await.map_err(|e| BackendError::Decode {
            message: e.to_string(),
        })
    }

    async fn send_empty(
        &self,
        request: RequestBuilder,
        order_id: Option<&str>,
    ) -> Result<(), BackendError> {
        self.rate_limiter
            .until_ready_with_jitter(Jitter::up_to(Duration::from_millis(50)))
            .await;

        let response = self.authorize(request).send().await?;
        Self::check_status(response, order_id, ConflictMeaning::Plain).await?;
        Ok(())
    }

    async fn check_status(
        response: Response,
        order_id: Option<&str>,
        conflict: ConflictMeaning,
    ) -> Result<Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        debug!(status = status.as_u16(), body = %body, "Backend returned error status");

        Err(match (status, conflict) {
            (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, _) => BackendError::Unauthorized,
            (StatusCode::NOT_FOUND, _) => BackendError::NotFound {
                order_id: order_id.unwrap_or_default().to_string(),
            },
            (StatusCode::CONFLICT, ConflictMeaning::AlreadyClaimed) => BackendError::AlreadyClaimed {
                order_id: order_id.unwrap_or_default().to_string(),
            },
            _ => BackendError::Http {
                status: status.as_u16(),
                message: body,
            },
        })
    }
}

#[async_trait]
impl OrderBackend for HttpOrderBackend {
    async fn create_order(&self, request: &OrderRequest) -> Result<Order, BackendError> {
        let builder = self.client.post(self.url(&["orders"])).json(request);
        self.send(builder, None, ConflictMeaning::Plain).await
    }

    async fn get_order(&self, order_id: &str) -> Result<Order, BackendError> {
        let builder = self.client.get(self.url(&["orders", order_id]));
        self.send(builder, Some(order_id), ConflictMeaning::Plain).await
    }

    async fn accept_order(&self, order_id: &str, driver_id: &str) -> Result<Order, BackendError> {
        let builder = self
            .client
            .post(self.url(&["orders", order_id, "accept"]))
            .json(&AcceptBody { driver_id });
        self.send(builder, Some(order_id), ConflictMeaning::AlreadyClaimed).await
    }

    async fn cancel_order(&self, order_id: &str, reason: Option<String>) -> Result<(), BackendError> {
        let builder = self
            .client
            .post(self.url(&["orders", order_id, "cancel"]))
            .json(&CancelBody { reason });
        self.send_empty(builder, Some(order_id)).await
    }

    async fn update_order_status(&self, order_id: &str, status: OrderStatus) -> Result<Order, BackendError> {
        let builder = self
            .client
            .patch(self.url(&["orders", order_id, "status"]))
            .json(&StatusBody { status });
        self.send(builder, Some(order_id), ConflictMeaning::Plain).await
    }

    async fn list_order_history(&self, cursor: Option<String>, limit: u32) -> Result<HistoryPage, BackendError> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor));
        }
        let builder = self.client.get(self.url(&["orders", "history"])).query(&query);
        self.send(builder, None, ConflictMeaning::Plain).await
    }

    async fn list_available_orders(&self) -> Result<Vec<Order>, BackendError> {
        let builder = self.client.get(self.url(&["orders", "available"]));
        self.send(builder, None, ConflictMeaning::Plain).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_url: &str) -> BackendConfig {
        BackendConfig {
            base_url: base_url.to_string(),
            token: Some("secret".to_string()),
            requests_per_second: 0,
            burst_capacity: 0,
        }
    }

    #[test]
    fn test_urls_are_joined_without_double_slashes() {
        for base in ["https://api.example.test/v1/", "https://api.example.test/v1"] {
            let backend = HttpOrderBackend::new(&config(base)).unwrap();
            assert_eq!(backend.base_url(), "https://api.example.test/v1");
            assert_eq!(
                backend.url(&["orders", "42"]).as_str(),
                "https://api.example.test/v1/orders/42"
            );
            assert_eq!(
                backend.url(&["orders", "history"]).as_str(),
                "https://api.example.test/v1/orders/history"
            );
        }
    }

    #[test]
    fn test_order_ids_are_escaped_as_one_segment() {
        let backend = HttpOrderBackend::new(&config("https://api.example.test/v1")).unwrap();
        let url = backend.url(&["orders", "a/b?c#d", "accept"]);

        assert_eq!(url.as_str(), "https://api.example.test/v1/orders/a%2Fb%3Fc%23d/accept");
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);
    }

    #[test]
    fn test_unusable_base_url_is_refused() {
        for base in ["not a url", "mailto:ops@example.test"] {
            let err = HttpOrderBackend::new(&config(base)).unwrap_err();
            assert!(matches!(err, BackendError::InvalidUrl { .. }), "{base}");
        }
    }

    #[test]
    fn test_token_can_be_replaced() {
        let backend = HttpOrderBackend::new(&config("https://api.example.test")).unwrap();
        backend.set_token(None);
        assert!(backend.token.read().is_none());
        backend.set_token(Some("fresh".to_string()));
        assert_eq!(backend.token.read().as_deref(), Some("fresh"));
    }

    #[test]
    fn test_request_bodies_use_camel_case() {
        let body = serde_json::to_string(&AcceptBody { driver_id: "d-7" }).unwrap();
        assert_eq!(body, r#"{"driverId":"d-7"}"#);
        let body = serde_json::to_string(&StatusBody { status: OrderStatus::DriverEnRoute }).unwrap();
        assert_eq!(body, r#"{"status":"driverEnRoute"}"#);
        let body = serde_json::to_string(&CancelBody { reason: None }).unwrap();
        assert_eq!(body, "{}");
    }
}
