use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::PaymentSettings;

/// Digest signature over the canonical `key=value&...` string plus the
/// shared secret. The processor recomputes this server-side.
pub fn sign_params(fields: &[(&str, String)], secret_key: &str) -> String {
    let canonical = fields
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&");

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher.update(secret_key.as_bytes());
    BASE64.encode(hasher.finalize())
}

pub fn verify_signature(fields: &[(&str, String)], secret_key: &str, signature: &str) -> bool {
    sign_params(fields, secret_key) == signature
}

/// The signed purchase payload handed to the payment processor for an order.
pub fn signed_purchase_params(
    payment: &PaymentSettings,
    order_id: Uuid,
    amount: i64,
    signed_at: DateTime<Utc>,
) -> Map<String, Value> {
    let fields = [
        ("access_key", payment.access_key.clone()),
        ("amount", amount.to_string()),
        ("currency", payment.currency.clone()),
        ("order_number", order_id.to_string()),
        (
            "signed_date_time",
            signed_at.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        ),
    ];
    let signature = sign_params(&fields, &payment.secret_key);

    let mut params = Map::new();
    for (key, value) in fields {
        params.insert(key.to_string(), Value::String(value));
    }
    params.insert("signature".to_string(), Value::String(signature));
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn settings() -> PaymentSettings {
        PaymentSettings {
            purchase_endpoint: "https://pay.example.com/purchase".to_string(),
            access_key: "access-key".to_string(),
            secret_key: "secret-key".to_string(),
            currency: "usd".to_string(),
        }
    }

    fn fields() -> Vec<(&'static str, String)> {
        vec![
            ("amount", "30".to_string()),
            ("currency", "usd".to_string()),
        ]
    }

    #[test]
    fn signing_is_deterministic() {
        assert_eq!(
            sign_params(&fields(), "secret"),
            sign_params(&fields(), "secret")
        );
    }

    #[test]
    fn signature_verifies_and_rejects_tampering() {
        let signature = sign_params(&fields(), "secret");
        assert!(verify_signature(&fields(), "secret", &signature));

        let mut tampered = fields();
        tampered[0].1 = "3000".to_string();
        assert!(!verify_signature(&tampered, "secret", &signature));
        assert!(!verify_signature(&fields(), "other-secret", &signature));
    }

    #[test]
    fn purchase_params_carry_signed_fields() {
        let order_id = Uuid::nil();
        let signed_at = Utc.with_ymd_and_hms(2013, 4, 1, 12, 0, 0).unwrap();
        let params = signed_purchase_params(&settings(), order_id, 30, signed_at);

        assert_eq!(params["amount"], Value::String("30".to_string()));
        assert_eq!(params["currency"], Value::String("usd".to_string()));
        assert_eq!(
            params["signed_date_time"],
            Value::String("2013-04-01T12:00:00Z".to_string())
        );

        let fields = [
            ("access_key", "access-key".to_string()),
            ("amount", "30".to_string()),
            ("currency", "usd".to_string()),
            ("order_number", order_id.to_string()),
            ("signed_date_time", "2013-04-01T12:00:00Z".to_string()),
        ];
        let signature = params["signature"].as_str().unwrap();
        assert!(verify_signature(&fields, "secret-key", signature));
    }
}
