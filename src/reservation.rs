//! The reservation core: turn a paid proposal into a confirmed booking, exactly once,
//! or reject it without writing anything.
//!
//! Concurrency control is the store transaction. The committer itself holds no
//! mutable state, so any number of instances may run against one store.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::calendar::{Quote, SlotCalendar};
use crate::error::ReservationError;
use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::payment::{PaymentGateway, PaymentProof, ProofVerifier};
use crate::policy::CancellationPolicy;
use crate::store::{BookingStore, CancelOutcome, StoreError};

/// What the client asks for. Instants are UTC milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub resource_date: NaiveDate,
    pub start: Ms,
    pub end: Ms,
    pub amount_minor: Minor,
    pub user_id: String,
}

/// Outcome of one transaction attempt.
enum Attempt {
    /// The store gave up on the transaction; the whole attempt may be repeated.
    Aborted(&'static str),
    Failed(ReservationError),
}

impl From<StoreError> for Attempt {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Aborted(why) => Attempt::Aborted(why),
            StoreError::ExclusionViolation(_) => Attempt::Failed(ReservationError::SlotConflict(vec![])),
            StoreError::UniqueViolation("payment.gateway_payment_id") => Attempt::Failed(
                ReservationError::invalid("payment already applied to a booking"),
            ),
            other => {
                error!("reservation commit failed: {other}");
                Attempt::Failed(other.into())
            }
        }
    }
}

pub struct ReservationCommitter {
    store: Arc<dyn BookingStore>,
    gateway: Arc<dyn PaymentGateway>,
    verifier: ProofVerifier,
    calendar: SlotCalendar,
    policy: CancellationPolicy,
}

impl ReservationCommitter {
    pub fn new(
        store: Arc<dyn BookingStore>,
        gateway: Arc<dyn PaymentGateway>,
        verifier: ProofVerifier,
        calendar: SlotCalendar,
        policy: CancellationPolicy,
    ) -> Self {
        Self {
            store,
            gateway,
            verifier,
            calendar,
            policy,
        }
    }

    /// Validate, verify payment, then re-check overlap and insert in one transaction.
    pub async fn propose_and_commit(
        &self,
        proposal: &Proposal,
        proof: &PaymentProof,
        now: Ms,
    ) -> Result<Booking, ReservationError> {
        let (span, quote) = self.validate(proposal, proof)?;
        self.verify_payment(proposal, proof).await?;

        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            match self.try_commit(proposal, span, quote, proof, now).await {
                Ok(booking) => {
                    metrics::counter!(observability::RESERVATIONS_COMMITTED_TOTAL).increment(1);
                    info!(
                        "booking {} confirmed for {} [{}, {}) amount {}",
                        booking.id, booking.user_id, span.start, span.end, booking.amount_minor
                    );
                    return Ok(booking);
                }
                Err(Attempt::Failed(e)) => {
                    if matches!(e, ReservationError::SlotConflict(_)) {
                        metrics::counter!(observability::SLOT_CONFLICTS_TOTAL).increment(1);
                    }
                    return Err(e);
                }
                Err(Attempt::Aborted(why)) => {
                    metrics::counter!(observability::COMMIT_RETRIES_TOTAL).increment(1);
                    debug!("commit attempt {attempt} aborted: {why}");
                    if attempt < MAX_COMMIT_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(
                            COMMIT_RETRY_BACKOFF_MS * attempt as u64,
                        ))
                        .await;
                    }
                }
            }
        }

        metrics::counter!(observability::SLOT_CONFLICTS_TOTAL).increment(1);
        let taken = self
            .store
            .confirmed_overlapping(span)
            .await
            .map(|bs| bs.into_iter().map(|b| b.span).collect())
            .unwrap_or_default();
        Err(ReservationError::SlotConflict(taken))
    }

    fn validate(
        &self,
        proposal: &Proposal,
        proof: &PaymentProof,
    ) -> Result<(Span, Quote), ReservationError> {
        if proposal.user_id.is_empty() || proposal.user_id.len() > MAX_USER_ID_LEN {
            return Err(ReservationError::invalid("invalid user id"));
        }
        if proposal.start >= proposal.end {
            return Err(ReservationError::invalid("start must be before end"));
        }
        if proposal.start < MIN_VALID_TIMESTAMP_MS || proposal.end > MAX_VALID_TIMESTAMP_MS {
            return Err(ReservationError::invalid("timestamp out of range"));
        }
        if proposal.amount_minor <= 0 || proposal.amount_minor > MAX_AMOUNT_MINOR {
            return Err(ReservationError::invalid("amount must be positive"));
        }
        for id in [&proof.gateway_order_id, &proof.gateway_payment_id] {
            if id.is_empty() || id.len() > MAX_GATEWAY_ID_LEN {
                return Err(ReservationError::invalid("invalid gateway id"));
            }
        }

        let span = Span::new(proposal.start, proposal.end);
        let quote = self.calendar.quote(proposal.resource_date, &span)?;
        if quote.slot_count > MAX_SLOTS_PER_BOOKING {
            return Err(ReservationError::invalid("too many slots in one booking"));
        }
        if quote.amount_minor != proposal.amount_minor {
            return Err(ReservationError::invalid(format!(
                "amount {} does not match slot prices {}",
                proposal.amount_minor, quote.amount_minor
            )));
        }
        Ok((span, quote))
    }

    async fn verify_payment(
        &self,
        proposal: &Proposal,
        proof: &PaymentProof,
    ) -> Result<(), ReservationError> {
        if !self.verifier.verify(proof) {
            metrics::counter!(observability::SIGNATURE_MISMATCHES_TOTAL).increment(1);
            warn!(
                "payment signature mismatch: user={} order={} payment={}",
                proposal.user_id, proof.gateway_order_id, proof.gateway_payment_id
            );
            return Err(ReservationError::SignatureMismatch);
        }

        let order = self
            .gateway
            .fetch_order(&proof.gateway_order_id)
            .await?
            .ok_or_else(|| ReservationError::invalid("unknown payment order"))?;
        if order.amount_minor != proposal.amount_minor {
            warn!(
                "order {} was created for {}, booking claims {}",
                order.id, order.amount_minor, proposal.amount_minor
            );
            return Err(ReservationError::invalid("payment amount does not match booking"));
        }
        Ok(())
    }

    async fn try_commit(
        &self,
        proposal: &Proposal,
        span: Span,
        quote: Quote,
        proof: &PaymentProof,
        now: Ms,
    ) -> Result<Booking, Attempt> {
        let mut txn = self.store.begin().await?;

        let taken = txn.confirmed_overlapping(span).await?;
        if !taken.is_empty() {
            // Dropping `txn` rolls back.
            return Err(Attempt::Failed(ReservationError::SlotConflict(
                taken.into_iter().map(|b| b.span).collect(),
            )));
        }

        let booking = Booking {
            id: Ulid::new(),
            user_id: proposal.user_id.clone(),
            resource_date: proposal.resource_date,
            span,
            slot_count: quote.slot_count,
            amount_minor: quote.amount_minor,
            status: BookingStatus::Confirmed,
            created_at: now,
        };
        let payment = Payment {
            id: Ulid::new(),
            booking_id: booking.id,
            gateway_order_id: proof.gateway_order_id.clone(),
            gateway_payment_id: proof.gateway_payment_id.clone(),
            gateway_signature: proof.gateway_signature.clone(),
            amount_minor: quote.amount_minor,
            status: PaymentStatus::Paid,
        };
        txn.insert_reservation(booking.clone(), payment)?;
        txn.commit().await?;
        Ok(booking)
    }

    /// Cancel a confirmed booking owned by `requester_id`, if the policy allows it at `now`.
    pub async fn cancel(
        &self,
        booking_id: Ulid,
        requester_id: &str,
        now: Ms,
    ) -> Result<Booking, ReservationError> {
        let record = self
            .store
            .get_booking(booking_id)
            .await?
            .ok_or(ReservationError::NotFound(booking_id))?;
        let booking = record.booking;
        if booking.user_id != requester_id {
            return Err(ReservationError::Forbidden);
        }
        if booking.status != BookingStatus::Confirmed {
            return Err(ReservationError::InvalidState(booking.status));
        }
        if !self.policy.allows(booking.span.start, now) {
            return Err(ReservationError::PolicyViolation {
                starts_at: booking.span.start,
                cutoff_ms: self.policy.cutoff_ms(),
            });
        }

        match self.store.cancel_if_confirmed(booking_id).await? {
            CancelOutcome::Cancelled(b) => {
                metrics::counter!(observability::CANCELLATIONS_TOTAL).increment(1);
                info!("booking {booking_id} cancelled by {requester_id}");
                Ok(b)
            }
            CancelOutcome::NotConfirmed(status) => Err(ReservationError::InvalidState(status)),
            CancelOutcome::NotFound => Err(ReservationError::NotFound(booking_id)),
        }
    }
}
