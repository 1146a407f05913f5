//! Payment proofs and the gateway seam.
//!
//! A proof is the triple the gateway hands the client after a successful charge:
//! order id, payment id, and `hex(HMAC-SHA256(secret, order_id + "|" + payment_id))`.
//! The core never talks to the gateway's checkout; it only checks proofs and asks the
//! gateway what an order was created for.

use async_trait::async_trait;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use ulid::Ulid;

use crate::limits::*;
use crate::model::Minor;

mod razorpay;

pub use razorpay::{DEFAULT_BASE_URL, RazorpayGateway};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentProof {
    pub gateway_order_id: String,
    pub gateway_payment_id: String,
    pub gateway_signature: String,
}

/// Checks proofs against the shared gateway secret.
#[derive(Clone)]
pub struct ProofVerifier {
    secret: Vec<u8>,
}

impl std::fmt::Debug for ProofVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProofVerifier").finish_non_exhaustive()
    }
}

impl ProofVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self { secret: secret.into() }
    }

    fn mac(&self, order_id: &str, payment_id: &str) -> HmacSha256 {
        // HMAC accepts keys of any length.
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .unwrap_or_else(|_| unreachable!("HMAC-SHA256 takes any key length"));
        mac.update(order_id.as_bytes());
        mac.update(b"|");
        mac.update(payment_id.as_bytes());
        mac
    }

    /// Lowercase hex signature for `order_id|payment_id`.
    pub fn sign(&self, order_id: &str, payment_id: &str) -> String {
        hex::encode(self.mac(order_id, payment_id).finalize().into_bytes())
    }

    /// True iff the proof's signature is exactly the lowercase hex HMAC of its ids.
    pub fn verify(&self, proof: &PaymentProof) -> bool {
        let sig = proof.gateway_signature.as_bytes();
        if sig.len() != SIGNATURE_HEX_LEN
            || !sig.iter().all(|c| c.is_ascii_digit() || (b'a'..=b'f').contains(c))
        {
            return false;
        }
        let Ok(raw) = hex::decode(sig) else {
            return false;
        };
        self.mac(&proof.gateway_order_id, &proof.gateway_payment_id)
            .verify_slice(&raw)
            .is_ok()
    }
}

// ── Gateway ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayOrder {
    pub id: String,
    pub amount_minor: Minor,
    pub currency: String,
    pub receipt: String,
}

#[derive(Debug)]
pub enum GatewayError {
    Unreachable(String),
    Rejected(String),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::Unreachable(msg) => write!(f, "gateway unreachable: {msg}"),
            GatewayError::Rejected(msg) => write!(f, "gateway rejected request: {msg}"),
        }
    }
}

impl std::error::Error for GatewayError {}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_order(&self, amount_minor: Minor) -> Result<GatewayOrder, GatewayError>;

    /// `None` if the gateway has never issued `order_id`.
    async fn fetch_order(&self, order_id: &str) -> Result<Option<GatewayOrder>, GatewayError>;
}

/// In-process gateway for local runs and tests. Orders live in memory; proofs are
/// signed with the same secret the verifier uses.
pub struct SandboxGateway {
    currency: String,
    verifier: ProofVerifier,
    orders: DashMap<String, GatewayOrder>,
}

impl SandboxGateway {
    pub fn new(currency: impl Into<String>, verifier: ProofVerifier) -> Self {
        Self {
            currency: currency.into(),
            verifier,
            orders: DashMap::new(),
        }
    }

    /// Simulate a successful checkout for `order_id`.
    pub fn capture(&self, order_id: &str) -> PaymentProof {
        let payment_id = format!("pay_{}", Ulid::new());
        let signature = self.verifier.sign(order_id, &payment_id);
        PaymentProof {
            gateway_order_id: order_id.to_string(),
            gateway_payment_id: payment_id,
            gateway_signature: signature,
        }
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn create_order(&self, amount_minor: Minor) -> Result<GatewayOrder, GatewayError> {
        if amount_minor <= 0 || amount_minor > MAX_AMOUNT_MINOR {
            return Err(GatewayError::Rejected(format!("invalid amount {amount_minor}")));
        }
        let id = Ulid::new();
        let order = GatewayOrder {
            id: format!("order_{id}"),
            amount_minor,
            currency: self.currency.clone(),
            receipt: format!("receipt_{}", id.timestamp_ms()),
        };
        self.orders.insert(order.id.clone(), order.clone());
        tracing::debug!("sandbox order {} for {amount_minor}", order.id);
        Ok(order)
    }

    async fn fetch_order(&self, order_id: &str) -> Result<Option<GatewayOrder>, GatewayError> {
        if order_id.len() > MAX_GATEWAY_ID_LEN {
            return Ok(None);
        }
        Ok(self.orders.get(order_id).map(|o| o.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proof(order: &str, payment: &str, sig: String) -> PaymentProof {
        PaymentProof {
            gateway_order_id: order.into(),
            gateway_payment_id: payment.into(),
            gateway_signature: sig,
        }
    }

    #[test]
    fn signature_matches_reference_hmac() {
        // Reference: HMAC-SHA256("secret", "order_1|pay_1")
        let v = ProofVerifier::new("secret");
        let mut mac = HmacSha256::new_from_slice(b"secret").unwrap();
        mac.update(b"order_1|pay_1");
        let expected = hex::encode(mac.finalize().into_bytes());
        assert_eq!(v.sign("order_1", "pay_1"), expected);
        assert_eq!(expected.len(), SIGNATURE_HEX_LEN);
    }

    #[test]
    fn valid_proof_verifies() {
        let v = ProofVerifier::new("secret");
        let sig = v.sign("order_1", "pay_1");
        assert!(v.verify(&proof("order_1", "pay_1", sig)));
    }

    #[test]
    fn tampered_signature_rejected() {
        let v = ProofVerifier::new("secret");
        let mut sig = v.sign("order_1", "pay_1");
        let flipped = if sig.ends_with('0') { '1' } else { '0' };
        sig.pop();
        sig.push(flipped);
        assert!(!v.verify(&proof("order_1", "pay_1", sig)));
    }

    #[test]
    fn swapped_ids_rejected() {
        let v = ProofVerifier::new("secret");
        let sig = v.sign("order_1", "pay_1");
        assert!(!v.verify(&proof("pay_1", "order_1", sig)));
    }

    #[test]
    fn uppercase_hex_rejected() {
        let v = ProofVerifier::new("secret");
        let sig = v.sign("order_1", "pay_1").to_uppercase();
        assert!(!v.verify(&proof("order_1", "pay_1", sig)));
    }

    #[test]
    fn wrong_secret_rejected() {
        let sig = ProofVerifier::new("other").sign("order_1", "pay_1");
        assert!(!ProofVerifier::new("secret").verify(&proof("order_1", "pay_1", sig)));
    }

    #[test]
    fn malformed_signature_rejected() {
        let v = ProofVerifier::new("secret");
        assert!(!v.verify(&proof("order_1", "pay_1", String::new())));
        assert!(!v.verify(&proof("order_1", "pay_1", "zz".repeat(32))));
    }

    #[tokio::test]
    async fn sandbox_orders_and_captures() {
        let v = ProofVerifier::new("secret");
        let gw = SandboxGateway::new("INR", v.clone());
        let order = gw.create_order(3100).await.unwrap();
        assert_eq!(order.amount_minor, 3100);
        assert_eq!(order.currency, "INR");
        assert_eq!(gw.fetch_order(&order.id).await.unwrap(), Some(order.clone()));
        assert_eq!(gw.fetch_order("order_missing").await.unwrap(), None);

        let p = gw.capture(&order.id);
        assert!(v.verify(&p));
    }

    #[tokio::test]
    async fn sandbox_rejects_non_positive_amount() {
        let gw = SandboxGateway::new("INR", ProofVerifier::new("secret"));
        assert!(matches!(gw.create_order(0).await, Err(GatewayError::Rejected(_))));
        assert!(gw.create_order(-5).await.is_err());
    }
}
