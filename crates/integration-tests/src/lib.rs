//! Integration tests for cartsync.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p cartsync-integration-tests
//! ```
//!
//! No external services are needed: [`MockCartService`] runs an axum cart
//! service on an ephemeral local port, and every test drives a real
//! [`CartSession`](cartsync::CartSession) against it over HTTP.
//!
//! # Test Categories
//!
//! - `cart_sync` - response shapes, mutations, fallbacks, persistence
//! - `credentials` - token refresh, coalescing, logout/login, checkout gate

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::extract::{Path as UrlPath, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use cartsync::{RetryPolicy, SyncConfig};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{Value, json};
use url::Url;

/// Build a JWT-shaped token expiring `expires_in` seconds from now.
#[must_use]
pub fn jwt(subject: &str, expires_in: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = json!({
        "sub": subject,
        "exp": chrono::Utc::now().timestamp() + expires_in,
    });
    let body = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{header}.{body}.signature")
}

// =============================================================================
// Mock State
// =============================================================================

/// Which of the accepted response shapes the mock answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Shape {
    /// `{ success, cart: { items, totalItems, subtotal } }`
    #[default]
    Explicit,
    /// `{ success, data: [ { _id, product: {...}, quantity } ] }`
    Records,
    /// `{ success, data: { items, totalQuantity, totalPrice } }`
    Flat,
    /// `{ success, data: { ... } }` with nothing cart-like inside
    Unrecognized,
}

/// Injected failure for cart endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// HTTP 401
    Unauthorized,
    /// HTTP 500
    ServerError,
    /// HTTP 200 with an HTML body
    Malformed,
    /// HTTP 200 with `success: false`
    Rejected,
}

/// A line held by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockLine {
    pub id: String,
    pub product_id: String,
    pub name: String,
    pub price: Decimal,
    pub quantity: u32,
}

/// A request seen by the mock.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: &'static str,
    pub path: String,
    pub authorization: Option<String>,
}

#[derive(Default)]
struct MockInner {
    lines: Vec<MockLine>,
    shape: Shape,
    accepted_token: Option<String>,
    issue_token: Option<String>,
    failure: Option<Failure>,
    requests: Vec<RecordedRequest>,
    next_id: u64,
}

impl MockInner {
    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(accepted) = &self.accepted_token else {
            return false;
        };
        let Some(value) = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
        else {
            return false;
        };
        let bare = value.strip_prefix("Bearer ").unwrap_or(value);
        bare == accepted
    }

    fn cart_body(&self) -> Value {
        let total_items: u32 = self.lines.iter().map(|l| l.quantity).sum();
        let subtotal: Decimal = self
            .lines
            .iter()
            .map(|l| l.price * Decimal::from(l.quantity))
            .sum();

        match self.shape {
            Shape::Explicit => json!({
                "success": true,
                "cart": {
                    "items": self.lines.iter().map(|l| json!({
                        "id": l.id,
                        "productId": l.product_id,
                        "name": l.name,
                        "unitPrice": l.price,
                        "quantity": l.quantity,
                    })).collect::<Vec<_>>(),
                    "totalItems": total_items,
                    "subtotal": subtotal,
                }
            }),
            Shape::Records => json!({
                "success": true,
                "data": self.lines.iter().map(|l| json!({
                    "_id": l.id,
                    "product": {"_id": l.product_id, "name": l.name, "price": l.price},
                    "quantity": l.quantity,
                })).collect::<Vec<_>>(),
            }),
            Shape::Flat => json!({
                "success": true,
                "data": {
                    "items": self.lines.iter().map(|l| json!({
                        "lineId": l.id,
                        "product_id": l.product_id,
                        "title": l.name,
                        "price": l.price,
                        "qty": l.quantity,
                    })).collect::<Vec<_>>(),
                    "totalQuantity": total_items,
                    "totalPrice": subtotal,
                }
            }),
            Shape::Unrecognized => json!({
                "success": true,
                "data": {"basket": "elsewhere"},
            }),
        }
    }
}

type Shared = Arc<Mutex<MockInner>>;

fn lock(shared: &Shared) -> MutexGuard<'_, MockInner> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// MockCartService
// =============================================================================

/// An in-process cart service.
#[derive(Clone)]
pub struct MockCartService {
    shared: Shared,
    addr: SocketAddr,
}

impl MockCartService {
    /// Bind an ephemeral port and start serving.
    ///
    /// # Panics
    ///
    /// Panics if no local port can be bound.
    pub async fn start() -> Self {
        let shared: Shared = Arc::new(Mutex::new(MockInner::default()));

        let app = Router::new()
            .route("/api/cart", get(get_cart))
            .route("/api/cart/items", post(add_item))
            .route("/api/cart/items/{id}", put(update_item).delete(delete_item))
            .route("/api/auth/refresh", post(refresh_token))
            .with_state(shared.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock cart service");
        let addr = listener
            .local_addr()
            .expect("Failed to read mock cart service address");

        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { shared, addr }
    }

    /// Base URL of the mock API, ending with `/`.
    ///
    /// # Panics
    ///
    /// Panics if the bound address does not form a URL.
    #[must_use]
    pub fn base_url(&self) -> Url {
        Url::parse(&format!("http://{}/api/", self.addr)).expect("Mock base URL is valid")
    }

    /// Session configuration against this mock with test-sized delays.
    #[must_use]
    pub fn config(&self, data_dir: &Path) -> SyncConfig {
        let mut config = SyncConfig::new(self.base_url());
        config.data_dir = data_dir.to_path_buf();
        config.retry = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
        };
        config.credential_timeout = Duration::from_secs(2);
        config.request_timeout = Duration::from_secs(5);
        config.debounce = Duration::from_millis(30);
        config.settle_delay = Duration::from_millis(5);
        config
    }

    /// Accept this token on cart endpoints.
    pub fn accept_token(&self, token: &str) {
        lock(&self.shared).accepted_token = Some(token.to_string());
    }

    /// Issue (and then accept) this token from the refresh endpoint.
    pub fn issue_token(&self, token: &str) {
        lock(&self.shared).issue_token = Some(token.to_string());
    }

    /// Answer cart requests in `shape`.
    pub fn set_shape(&self, shape: Shape) {
        lock(&self.shared).shape = shape;
    }

    /// Fail every cart request until [`recover`](Self::recover).
    pub fn fail_with(&self, failure: Failure) {
        lock(&self.shared).failure = Some(failure);
    }

    /// Stop failing.
    pub fn recover(&self) {
        lock(&self.shared).failure = None;
    }

    /// Seed a server-side line.
    pub fn seed_line(&self, id: &str, product_id: &str, price: Decimal, quantity: u32) {
        lock(&self.shared).lines.push(MockLine {
            id: id.to_string(),
            product_id: product_id.to_string(),
            name: format!("Product {product_id}"),
            price,
            quantity,
        });
    }

    /// Lines currently held server-side.
    #[must_use]
    pub fn lines(&self) -> Vec<MockLine> {
        lock(&self.shared).lines.clone()
    }

    /// Every request seen so far.
    #[must_use]
    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.shared).requests.clone()
    }

    /// Number of requests matching `method` and `path`.
    #[must_use]
    pub fn count(&self, method: &str, path: &str) -> usize {
        lock(&self.shared)
            .requests
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }
}

// =============================================================================
// Handlers
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddBody {
    product_id: String,
    quantity: u32,
}

#[derive(Deserialize)]
struct QuantityBody {
    quantity: u32,
}

/// Record, authorize and fail as configured, then apply `change`.
fn handle(
    shared: &Shared,
    method: &'static str,
    path: String,
    headers: &HeaderMap,
    change: impl FnOnce(&mut MockInner) -> Result<(), String>,
) -> Response {
    let mut inner = lock(shared);
    inner.requests.push(RecordedRequest {
        method,
        path,
        authorization: headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    });

    if !inner.authorized(headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"success": false, "message": "Unauthorized"})),
        )
            .into_response();
    }

    match inner.failure {
        Some(Failure::Unauthorized) => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"success": false, "message": "Token revoked"})),
            )
                .into_response();
        }
        Some(Failure::ServerError) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded").into_response();
        }
        Some(Failure::Malformed) => {
            return (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/html")],
                "<html><body>Maintenance</body></html>",
            )
                .into_response();
        }
        Some(Failure::Rejected) => {
            return Json(json!({"success": false, "message": "Rejected by policy"})).into_response();
        }
        None => {}
    }

    if let Err(message) = change(&mut inner) {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"success": false, "message": message})),
        )
            .into_response();
    }

    Json(inner.cart_body()).into_response()
}

async fn get_cart(State(shared): State<Shared>, headers: HeaderMap) -> Response {
    handle(&shared, "GET", "/cart".to_string(), &headers, |_| Ok(()))
}

async fn add_item(
    State(shared): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<AddBody>,
) -> Response {
    handle(&shared, "POST", "/cart/items".to_string(), &headers, |inner| {
        if let Some(line) = inner
            .lines
            .iter_mut()
            .find(|l| l.product_id == body.product_id)
        {
            line.quantity = (line.quantity + body.quantity).min(99);
            return Ok(());
        }
        inner.next_id += 1;
        let id = format!("srv-{}", inner.next_id);
        inner.lines.push(MockLine {
            id,
            name: format!("Product {}", body.product_id),
            product_id: body.product_id,
            price: Decimal::new(500, 2),
            quantity: body.quantity,
        });
        Ok(())
    })
}

async fn update_item(
    State(shared): State<Shared>,
    UrlPath(id): UrlPath<String>,
    headers: HeaderMap,
    Json(body): Json<QuantityBody>,
) -> Response {
    let path = format!("/cart/items/{id}");
    handle(&shared, "PUT", path, &headers, |inner| {
        let line = inner
            .lines
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or_else(|| format!("No line {id}"))?;
        line.quantity = body.quantity;
        Ok(())
    })
}

async fn delete_item(
    State(shared): State<Shared>,
    UrlPath(id): UrlPath<String>,
    headers: HeaderMap,
) -> Response {
    let path = format!("/cart/items/{id}");
    handle(&shared, "DELETE", path, &headers, |inner| {
        inner.lines.retain(|l| l.id != id);
        Ok(())
    })
}

async fn refresh_token(State(shared): State<Shared>, headers: HeaderMap) -> Response {
    let mut inner = lock(&shared);
    inner.requests.push(RecordedRequest {
        method: "POST",
        path: "/auth/refresh".to_string(),
        authorization: headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    });

    match inner.issue_token.clone() {
        Some(token) => {
            inner.accepted_token = Some(token.clone());
            Json(json!({"success": true, "data": {"accessToken": token}})).into_response()
        }
        None => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"success": false, "message": "No session"})),
        )
            .into_response(),
    }
}
