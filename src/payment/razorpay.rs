//! Client for the hosted gateway's orders API (`POST /orders`, `GET /orders/{id}`),
//! authenticated with the key id and key secret over HTTP basic auth.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};

use super::{GatewayError, GatewayOrder, PaymentGateway};
use crate::limits::*;
use crate::model::{Minor, now_ms};

pub const DEFAULT_BASE_URL: &str = "https://api.razorpay.com/v1";

pub struct RazorpayGateway {
    client: Client,
    base_url: String,
    key_id: String,
    key_secret: String,
    currency: String,
}

impl RazorpayGateway {
    pub fn new(
        base_url: &str,
        key_id: impl Into<String>,
        key_secret: impl Into<String>,
        currency: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Unreachable(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            key_id: key_id.into(),
            key_secret: key_secret.into(),
            currency: currency.into(),
        })
    }
}

#[derive(Serialize)]
struct CreateOrderBody<'a> {
    amount: Minor,
    currency: &'a str,
    receipt: String,
}

#[derive(Deserialize)]
struct OrderBody {
    id: String,
    amount: Minor,
    currency: String,
    #[serde(default)]
    receipt: Option<String>,
}

impl From<OrderBody> for GatewayOrder {
    fn from(o: OrderBody) -> Self {
        GatewayOrder {
            id: o.id,
            amount_minor: o.amount,
            currency: o.currency,
            receipt: o.receipt.unwrap_or_default(),
        }
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    description: String,
}

fn transport(e: reqwest::Error) -> GatewayError {
    GatewayError::Unreachable(e.to_string())
}

/// Server-side failures and throttling are the gateway being unavailable; any other
/// non-success status is a refusal.
async fn status_error(resp: Response) -> GatewayError {
    let status = resp.status();
    let detail = resp
        .json::<ErrorEnvelope>()
        .await
        .map(|e| e.error.description)
        .unwrap_or_default();
    let msg = if detail.is_empty() { status.to_string() } else { format!("{status}: {detail}") };
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        GatewayError::Unreachable(msg)
    } else {
        GatewayError::Rejected(msg)
    }
}

/// Only ids that can name an order go into the request path.
fn plausible_order_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_GATEWAY_ID_LEN
        && id.bytes().all(|c| c.is_ascii_alphanumeric() || c == b'_')
}

#[async_trait]
impl PaymentGateway for RazorpayGateway {
    async fn create_order(&self, amount_minor: Minor) -> Result<GatewayOrder, GatewayError> {
        if amount_minor <= 0 || amount_minor > MAX_AMOUNT_MINOR {
            return Err(GatewayError::Rejected(format!("invalid amount {amount_minor}")));
        }
        let body = CreateOrderBody {
            amount: amount_minor,
            currency: &self.currency,
            receipt: format!("receipt_{}", now_ms()),
        };
        let resp = self
            .client
            .post(format!("{}/orders", self.base_url))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }
        let order: OrderBody = resp.json().await.map_err(transport)?;
        tracing::debug!("gateway order {} for {amount_minor}", order.id);
        Ok(order.into())
    }

    async fn fetch_order(&self, order_id: &str) -> Result<Option<GatewayOrder>, GatewayError> {
        if !plausible_order_id(order_id) {
            return Ok(None);
        }
        let resp = self
            .client
            .get(format!("{}/orders/{order_id}", self.base_url))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .send()
            .await
            .map_err(transport)?;
        match resp.status() {
            s if s.is_success() => {
                let order: OrderBody = resp.json().await.map_err(transport)?;
                Ok(Some(order.into()))
            }
            // Unknown ids are answered with 400 BAD_REQUEST_ERROR.
            StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => Ok(None),
            _ => Err(status_error(resp).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::extract::{Path, State};
    use axum::http::HeaderMap;
    use axum::http::header::AUTHORIZATION;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use dashmap::DashMap;
    use serde_json::{Value, json};

    const KEY_ID: &str = "rzp_test_key";
    const KEY_SECRET: &str = "gw-secret";
    /// base64("rzp_test_key:gw-secret")
    const EXPECTED_AUTH: &str = "Basic cnpwX3Rlc3Rfa2V5Omd3LXNlY3JldA==";

    type Orders = Arc<DashMap<String, Value>>;

    fn authorized(headers: &HeaderMap) -> bool {
        headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) == Some(EXPECTED_AUTH)
    }

    fn api_error(status: StatusCode, description: &str) -> axum::response::Response {
        let body = json!({ "error": { "code": "BAD_REQUEST_ERROR", "description": description } });
        (status, Json(body)).into_response()
    }

    async fn create(
        State(orders): State<Orders>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> axum::response::Response {
        if !authorized(&headers) {
            return api_error(StatusCode::UNAUTHORIZED, "Authentication failed");
        }
        let id = format!("order_{}", orders.len() + 1);
        let order = json!({
            "id": id,
            "entity": "order",
            "amount": body["amount"],
            "currency": body["currency"],
            "receipt": body["receipt"],
            "status": "created",
        });
        orders.insert(id, order.clone());
        Json(order).into_response()
    }

    async fn fetch(
        State(orders): State<Orders>,
        headers: HeaderMap,
        Path(id): Path<String>,
    ) -> axum::response::Response {
        if !authorized(&headers) {
            return api_error(StatusCode::UNAUTHORIZED, "Authentication failed");
        }
        match orders.get(&id) {
            Some(order) => Json(order.value().clone()).into_response(),
            None => api_error(StatusCode::BAD_REQUEST, "The id provided does not exist"),
        }
    }

    async fn unavailable() -> axum::response::Response {
        api_error(StatusCode::SERVICE_UNAVAILABLE, "upstream maintenance")
    }

    /// Local stand-in for the orders API; returns its address.
    async fn start_orders_api() -> std::net::SocketAddr {
        let app = Router::new()
            .route("/v1/orders", post(create))
            .route("/v1/orders/{id}", get(fetch))
            .route("/down/orders", post(unavailable))
            .route("/down/orders/{id}", get(unavailable))
            .with_state(Orders::default());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        addr
    }

    fn gateway(base_url: &str, secret: &str) -> RazorpayGateway {
        RazorpayGateway::new(base_url, KEY_ID, secret, "INR", Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn creates_and_fetches_orders() {
        let addr = start_orders_api().await;
        let gw = gateway(&format!("http://{addr}/v1/"), KEY_SECRET);

        let order = gw.create_order(3100).await.unwrap();
        assert_eq!(order.id, "order_1");
        assert_eq!(order.amount_minor, 3100);
        assert_eq!(order.currency, "INR");
        assert!(order.receipt.starts_with("receipt_"));

        assert_eq!(gw.fetch_order("order_1").await.unwrap(), Some(order));
        assert_eq!(gw.fetch_order("order_404").await.unwrap(), None);
        assert_eq!(gw.fetch_order("../orders").await.unwrap(), None);
    }

    #[tokio::test]
    async fn bad_credentials_are_rejected() {
        let addr = start_orders_api().await;
        let gw = gateway(&format!("http://{addr}/v1"), "wrong");
        let err = gw.create_order(1500).await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected(ref m) if m.contains("Authentication failed")));
    }

    #[tokio::test]
    async fn invalid_amount_never_leaves_the_process() {
        // Nothing listens here; a request would fail as unreachable.
        let gw = gateway("http://127.0.0.1:9", KEY_SECRET);
        assert!(matches!(gw.create_order(0).await, Err(GatewayError::Rejected(_))));
    }

    #[tokio::test]
    async fn server_errors_are_unreachable() {
        let addr = start_orders_api().await;
        let gw = gateway(&format!("http://{addr}/down"), KEY_SECRET);
        assert!(matches!(gw.create_order(1500).await, Err(GatewayError::Unreachable(_))));
        assert!(matches!(gw.fetch_order("order_1").await, Err(GatewayError::Unreachable(_))));
    }

    #[tokio::test]
    async fn connection_refused_is_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let gw = gateway(&format!("http://{addr}/v1"), KEY_SECRET);
        assert!(matches!(gw.create_order(1500).await, Err(GatewayError::Unreachable(_))));
        assert!(matches!(gw.fetch_order("order_1").await, Err(GatewayError::Unreachable(_))));
    }
}
