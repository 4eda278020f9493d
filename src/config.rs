use std::env;

use anyhow::{Context, Result};

const DEFAULT_TIMEDTEXT_ENDPOINT: &str = "http://video.google.com/timedtext";
const DEFAULT_TIMEDTEXT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_CURRENCY: &str = "usd";

/// Process-wide settings, read once from the environment at startup.
#[derive(Clone, Debug)]
pub struct Settings {
    pub payment: PaymentSettings,
    pub timedtext: TimedTextSettings,
}

/// Payment-processor handoff configuration for the verification flow.
#[derive(Clone, Debug)]
pub struct PaymentSettings {
    pub purchase_endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub currency: String,
}

/// Third-party timed-text host probed and fetched by the transcript workflow.
#[derive(Clone, Debug)]
pub struct TimedTextSettings {
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let purchase_endpoint = env::var("PAYMENT_PURCHASE_ENDPOINT")
            .context("PAYMENT_PURCHASE_ENDPOINT env var is missing")?;
        let access_key =
            env::var("PAYMENT_ACCESS_KEY").context("PAYMENT_ACCESS_KEY env var is missing")?;
        let secret_key =
            env::var("PAYMENT_SECRET_KEY").context("PAYMENT_SECRET_KEY env var is missing")?;
        let currency = env::var("PAYMENT_CURRENCY").unwrap_or_else(|_| DEFAULT_CURRENCY.to_string());

        let endpoint = env::var("TIMEDTEXT_ENDPOINT")
            .unwrap_or_else(|_| DEFAULT_TIMEDTEXT_ENDPOINT.to_string());
        let timeout_secs = env::var("TIMEDTEXT_TIMEOUT_SECS")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(DEFAULT_TIMEDTEXT_TIMEOUT_SECS);

        Ok(Self {
            payment: PaymentSettings {
                purchase_endpoint,
                access_key,
                secret_key,
                currency,
            },
            timedtext: TimedTextSettings {
                endpoint,
                timeout_secs,
            },
        })
    }
}
