//! HTTP surface.
//!
//! ```text
//! GET  /health
//! GET  /slots?date=YYYY-MM-DD
//! POST /payments/orders
//! POST /bookings
//! GET  /bookings
//! POST /bookings/{id}/cancel
//! GET  /owner/bookings?startDate&endDate&status
//! ```
//!
//! Identity arrives from the session layer in front of this service as
//! `x-user-id` / `x-user-role` headers.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequestParts, MatchedPath, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::availability::{free_spans, mark_booked};
use crate::calendar::{SlotCalendar, parse_date};
use crate::error::ReservationError;
use crate::model::*;
use crate::observability;
use crate::payment::{GatewayOrder, PaymentGateway, PaymentProof};
use crate::reservation::{Proposal, ReservationCommitter};
use crate::store::{BookingFilter, BookingStore};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

/// Source of "now" for handlers.
pub type Clock = Arc<dyn Fn() -> Ms + Send + Sync>;

#[derive(Clone)]
pub struct AppState {
    pub committer: Arc<ReservationCommitter>,
    pub store: Arc<dyn BookingStore>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub calendar: SlotCalendar,
    pub clock: Clock,
}

impl AppState {
    fn now(&self) -> Ms {
        (self.clock)()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/slots", get(get_slots))
        .route("/payments/orders", post(create_order))
        .route("/bookings", post(create_booking).get(my_bookings))
        .route("/bookings/{id}/cancel", post(cancel_booking))
        .route("/owner/bookings", get(owner_bookings))
        .layer(middleware::from_fn(track_metrics))
        .with_state(state)
}

/// Count and time every routed request by its route template and status.
async fn track_metrics(request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".into());
    let start = Instant::now();
    let response = next.run(request).await;
    let status = response.status().as_u16().to_string();
    metrics::histogram!(observability::HTTP_REQUEST_DURATION_SECONDS, "route" => route.clone())
        .record(start.elapsed().as_secs_f64());
    metrics::counter!(observability::HTTP_REQUESTS_TOTAL, "route" => route, "status" => status)
        .increment(1);
    response
}

// ── Errors ───────────────────────────────────────────────

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

impl ReservationError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ReservationError::InvalidInput(_)
            | ReservationError::SignatureMismatch
            | ReservationError::PolicyViolation { .. }
            | ReservationError::InvalidState(_) => StatusCode::BAD_REQUEST,
            ReservationError::Unauthorized => StatusCode::UNAUTHORIZED,
            ReservationError::Forbidden => StatusCode::FORBIDDEN,
            ReservationError::NotFound(_) => StatusCode::NOT_FOUND,
            ReservationError::SlotConflict(_) => StatusCode::CONFLICT,
            ReservationError::GatewayError(_) => StatusCode::BAD_GATEWAY,
            ReservationError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ReservationError {
    fn into_response(self) -> Response {
        let error = match &self {
            ReservationError::InternalError(detail) => {
                tracing::error!("request failed: {detail}");
                "internal error".to_string()
            }
            ReservationError::GatewayError(detail) => {
                tracing::warn!("payment gateway failure: {detail}");
                "payment gateway unavailable".to_string()
            }
            other => other.to_string(),
        };
        let body = ErrorBody { error, kind: self.kind() };
        (self.status_code(), Json(body)).into_response()
    }
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ReservationError> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| ReservationError::invalid(e.body_text()))
}

fn query_params<T>(query: Result<Query<T>, QueryRejection>) -> Result<T, ReservationError> {
    query
        .map(|Query(v)| v)
        .map_err(|e| ReservationError::invalid(e.body_text()))
}

// ── Identity ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Owner,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
}

impl<S: Send + Sync> FromRequestParts<S> for Identity {
    type Rejection = ReservationError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty() && s.len() <= crate::limits::MAX_USER_ID_LEN)
            .ok_or(ReservationError::Unauthorized)?;
        let role = match parts.headers.get(USER_ROLE_HEADER).map(|v| v.to_str()) {
            None => Role::User,
            Some(Ok(r)) if r.eq_ignore_ascii_case("USER") => Role::User,
            Some(Ok(r)) if r.eq_ignore_ascii_case("OWNER") => Role::Owner,
            Some(_) => return Err(ReservationError::Unauthorized),
        };
        Ok(Identity { user_id: user_id.to_string(), role })
    }
}

// ── DTOs ─────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SlotDto {
    pub hour: u32,
    pub label: String,
    pub start_instant: DateTime<Utc>,
    pub end_instant: DateTime<Utc>,
    pub price_per_hour_minor: Minor,
    pub booked: bool,
}

impl From<&TimeSlot> for SlotDto {
    fn from(s: &TimeSlot) -> Self {
        SlotDto {
            hour: s.hour,
            label: s.label.clone(),
            start_instant: to_utc(s.span.start),
            end_instant: to_utc(s.span.end),
            price_per_hour_minor: s.price_per_hour_minor,
            booked: s.booked,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RangeDto {
    pub start_instant: DateTime<Utc>,
    pub end_instant: DateTime<Utc>,
}

impl From<&Span> for RangeDto {
    fn from(s: &Span) -> Self {
        RangeDto { start_instant: to_utc(s.start), end_instant: to_utc(s.end) }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotsResponse {
    pub date: NaiveDate,
    pub bookings: Vec<RangeDto>,
    /// Unbooked stretches of the date's session.
    pub free: Vec<RangeDto>,
    pub slots: Vec<SlotDto>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentDto {
    pub id: Ulid,
    pub gateway_order_id: String,
    pub gateway_payment_id: String,
    pub amount_minor: Minor,
    pub status: PaymentStatus,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BookingDto {
    pub id: Ulid,
    pub user_id: String,
    pub resource_date: NaiveDate,
    pub start_instant: DateTime<Utc>,
    pub end_instant: DateTime<Utc>,
    pub slot_count: u32,
    pub amount_minor: Minor,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment: Option<PaymentDto>,
}

impl BookingDto {
    fn new(b: &Booking, payment: Option<&Payment>) -> Self {
        BookingDto {
            id: b.id,
            user_id: b.user_id.clone(),
            resource_date: b.resource_date,
            start_instant: to_utc(b.span.start),
            end_instant: to_utc(b.span.end),
            slot_count: b.slot_count,
            amount_minor: b.amount_minor,
            status: b.status,
            created_at: to_utc(b.created_at),
            payment: payment.map(|p| PaymentDto {
                id: p.id,
                gateway_order_id: p.gateway_order_id.clone(),
                gateway_payment_id: p.gateway_payment_id.clone(),
                amount_minor: p.amount_minor,
                status: p.status,
            }),
        }
    }
}

impl From<&BookingRecord> for BookingDto {
    fn from(r: &BookingRecord) -> Self {
        BookingDto::new(&r.booking, r.payment.as_ref())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BookingEnvelope {
    pub booking: BookingDto,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub amount_minor: Minor,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBookingRequest {
    pub resource_date: String,
    pub start_instant: DateTime<Utc>,
    pub end_instant: DateTime<Utc>,
    pub amount_minor: Minor,
    #[serde(flatten)]
    pub proof: PaymentProof,
}

#[derive(Debug, Deserialize)]
pub struct SlotsQuery {
    pub date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerQuery {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub status: Option<String>,
}

// ── Handlers ─────────────────────────────────────────────

async fn health() -> &'static str {
    "ok"
}

/// Slots of the session opening on `date`, plus every confirmed range overlapping
/// that session or the next one.
async fn get_slots(
    State(state): State<AppState>,
    query: Result<Query<SlotsQuery>, QueryRejection>,
) -> Result<Json<SlotsResponse>, ReservationError> {
    let raw = query_params(query)?
        .date
        .ok_or_else(|| ReservationError::invalid("date is required"))?;
    let date = parse_date(&raw)?;

    let slots = state.calendar.slots(date);
    let session = state.calendar.session_span(date);
    let next_day = date
        .checked_add_days(Days::new(1))
        .ok_or_else(|| ReservationError::invalid("date out of range"))?;
    let cover = match (session, state.calendar.session_span(next_day)) {
        (Some(a), Some(b)) => Some(Span::new(a.start, b.end)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    };
    let taken: Vec<Span> = match cover {
        Some(span) => state
            .store
            .confirmed_overlapping(span)
            .await?
            .into_iter()
            .map(|b| b.span)
            .collect(),
        None => Vec::new(),
    };

    let free = session.map(|s| free_spans(&s, &taken)).unwrap_or_default();
    let slots = mark_booked(slots, &taken);
    Ok(Json(SlotsResponse {
        date,
        bookings: taken.iter().map(RangeDto::from).collect(),
        free: free.iter().map(RangeDto::from).collect(),
        slots: slots.iter().map(SlotDto::from).collect(),
    }))
}

async fn create_order(
    State(state): State<AppState>,
    identity: Identity,
    payload: Result<Json<CreateOrderRequest>, JsonRejection>,
) -> Result<Json<GatewayOrder>, ReservationError> {
    let req = json_body(payload)?;
    if req.amount_minor <= 0 || req.amount_minor > crate::limits::MAX_AMOUNT_MINOR {
        return Err(ReservationError::invalid("amount must be positive"));
    }
    let order = state.gateway.create_order(req.amount_minor).await?;
    tracing::info!("order {} created for {} by {}", order.id, order.amount_minor, identity.user_id);
    Ok(Json(order))
}

async fn create_booking(
    State(state): State<AppState>,
    identity: Identity,
    payload: Result<Json<CreateBookingRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<BookingEnvelope>), ReservationError> {
    let req = json_body(payload)?;
    let proposal = Proposal {
        resource_date: parse_date(&req.resource_date)?,
        start: from_utc(&req.start_instant),
        end: from_utc(&req.end_instant),
        amount_minor: req.amount_minor,
        user_id: identity.user_id,
    };
    let booking = state
        .committer
        .propose_and_commit(&proposal, &req.proof, state.now())
        .await?;
    let record = state.store.get_booking(booking.id).await?;
    let dto = match &record {
        Some(r) => BookingDto::from(r),
        None => BookingDto::new(&booking, None),
    };
    Ok((StatusCode::CREATED, Json(BookingEnvelope { booking: dto })))
}

async fn my_bookings(
    State(state): State<AppState>,
    identity: Identity,
) -> Result<Json<Vec<BookingDto>>, ReservationError> {
    let records = state.store.bookings_for_user(&identity.user_id).await?;
    Ok(Json(records.iter().map(BookingDto::from).collect()))
}

async fn cancel_booking(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
) -> Result<Json<BookingEnvelope>, ReservationError> {
    let id = Ulid::from_string(&id)
        .map_err(|_| ReservationError::invalid(format!("invalid booking id {id:?}")))?;
    let booking = state.committer.cancel(id, &identity.user_id, state.now()).await?;
    let record = state.store.get_booking(booking.id).await?;
    let dto = match &record {
        Some(r) => BookingDto::from(r),
        None => BookingDto::new(&booking, None),
    };
    Ok(Json(BookingEnvelope { booking: dto }))
}

async fn owner_bookings(
    State(state): State<AppState>,
    identity: Identity,
    query: Result<Query<OwnerQuery>, QueryRejection>,
) -> Result<Json<Vec<BookingDto>>, ReservationError> {
    if identity.role != Role::Owner {
        return Err(ReservationError::Forbidden);
    }
    let q = query_params(query)?;
    let filter = BookingFilter {
        from: q.start_date.as_deref().map(parse_date).transpose()?,
        to: q.end_date.as_deref().map(parse_date).transpose()?,
        status: match q.status.as_deref() {
            None | Some("") => None,
            Some(s) if s.eq_ignore_ascii_case("all") => None,
            Some(s) => Some(s.parse().map_err(ReservationError::InvalidInput)?),
        },
    };
    if let (Some(from), Some(to)) = (filter.from, filter.to)
        && to < from
    {
        return Err(ReservationError::invalid("end date before start date"));
    }
    let records = state.store.list_bookings(&filter).await?;
    Ok(Json(records.iter().map(BookingDto::from).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request as HttpRequest;

    fn parts(headers: &[(&str, &str)]) -> Parts {
        let mut builder = HttpRequest::builder().uri("/");
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(()).unwrap().into_parts().0
    }

    async fn identity(headers: &[(&str, &str)]) -> Result<Identity, ReservationError> {
        Identity::from_request_parts(&mut parts(headers), &()).await
    }

    #[tokio::test]
    async fn identity_requires_user_header() {
        assert!(matches!(identity(&[]).await, Err(ReservationError::Unauthorized)));
        assert!(matches!(identity(&[(USER_ID_HEADER, "  ")]).await, Err(ReservationError::Unauthorized)));
    }

    #[tokio::test]
    async fn identity_roles() {
        let id = identity(&[(USER_ID_HEADER, "alice")]).await.unwrap();
        assert_eq!(id, Identity { user_id: "alice".into(), role: Role::User });
        let id = identity(&[(USER_ID_HEADER, "bob"), (USER_ROLE_HEADER, "owner")]).await.unwrap();
        assert_eq!(id.role, Role::Owner);
        assert!(identity(&[(USER_ID_HEADER, "eve"), (USER_ROLE_HEADER, "root")]).await.is_err());
    }

    #[test]
    fn status_mapping() {
        let cases = [
            (ReservationError::invalid("x"), StatusCode::BAD_REQUEST),
            (ReservationError::SignatureMismatch, StatusCode::BAD_REQUEST),
            (ReservationError::PolicyViolation { starts_at: 0, cutoff_ms: 0 }, StatusCode::BAD_REQUEST),
            (ReservationError::InvalidState(BookingStatus::Cancelled), StatusCode::BAD_REQUEST),
            (ReservationError::Unauthorized, StatusCode::UNAUTHORIZED),
            (ReservationError::Forbidden, StatusCode::FORBIDDEN),
            (ReservationError::NotFound(Ulid::nil()), StatusCode::NOT_FOUND),
            (ReservationError::SlotConflict(vec![]), StatusCode::CONFLICT),
            (ReservationError::GatewayError("down".into()), StatusCode::BAD_GATEWAY),
            (ReservationError::InternalError("disk".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(err.status_code(), status, "{err}");
        }
    }

    #[test]
    fn booking_request_shape() {
        let raw = r#"{
            "resourceDate": "2026-02-12",
            "startInstant": "2026-02-12T16:30:00Z",
            "endInstant": "2026-02-12T18:30:00Z",
            "amountMinor": 3100,
            "gatewayOrderId": "order_1",
            "gatewayPaymentId": "pay_1",
            "gatewaySignature": "ab"
        }"#;
        let req: CreateBookingRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.amount_minor, 3100);
        assert_eq!(req.proof.gateway_payment_id, "pay_1");
        assert_eq!(from_utc(&req.end_instant) - from_utc(&req.start_instant), 2 * HOUR_MS);
    }
}
