// ============================================================================
// File: src/payment.rs
// Checkout sessions and webhook signature verification
// ============================================================================

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use sha2::Sha256;

use crate::config::{PaymentConfig, Product, Products};

type HmacSha256 = Hmac<Sha256>;

pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductKind {
    Consultation,
    Concierge,
    Negotiation,
}

impl ProductKind {
    pub fn product<'a>(&self, products: &'a Products) -> &'a Product {
        match self {
            Self::Consultation => &products.consultation,
            Self::Concierge => &products.concierge,
            Self::Negotiation => &products.negotiation,
        }
    }
}

/// Product whose metadata `service` tag matches
pub fn product_for_service<'a>(products: &'a Products, service: &str) -> Option<&'a Product> {
    [&products.consultation, &products.concierge, &products.negotiation]
        .into_iter()
        .find(|p| p.service == service)
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CustomerDetails {
    pub email: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: Option<String>,
    pub payment_status: Option<String>,
    pub customer_details: Option<CustomerDetails>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CheckoutSession {
    pub fn is_paid(&self) -> bool {
        self.payment_status.as_deref() == Some("paid")
    }

    pub fn customer_email(&self) -> Option<&str> {
        self.customer_details.as_ref().and_then(|c| c.email.as_deref())
    }

    pub fn service(&self) -> Option<&str> {
        self.metadata.get("service").map(String::as_str)
    }
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Hosted checkout for one unit of `product`, redirecting back to `origin`
    async fn create_checkout_session(&self, product: &Product, origin: &str) -> Result<CheckoutSession>;

    async fn retrieve_session(&self, session_id: &str) -> Result<CheckoutSession>;
}

pub struct StripeClient {
    client: Client,
    base_url: String,
    secret_key: String,
}

impl StripeClient {
    pub fn new(base_url: &str, secret_key: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            secret_key,
        }
    }

    /// Some(client) when a secret key is configured
    pub fn from_config(config: &PaymentConfig) -> Option<Self> {
        let key = config.secret_key.as_deref().filter(|k| !k.trim().is_empty())?;
        Some(Self::new(&config.base_url, key.to_string()))
    }

    async fn parse(response: reqwest::Response) -> Result<CheckoutSession> {
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Payment API error: HTTP {}\nResponse: {}", status, error_text));
        }
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| anyhow!("Failed to parse checkout session: {}", e))
    }
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn create_checkout_session(&self, product: &Product, origin: &str) -> Result<CheckoutSession> {
        let origin = origin.trim_end_matches('/');
        let form: Vec<(&str, String)> = vec![
            ("payment_method_types[0]", "card".to_string()),
            ("line_items[0][price_data][currency]", product.currency.clone()),
            ("line_items[0][price_data][product_data][name]", product.name.clone()),
            ("line_items[0][price_data][product_data][description]", product.description.clone()),
            ("line_items[0][price_data][unit_amount]", product.amount_cents.to_string()),
            ("line_items[0][quantity]", "1".to_string()),
            ("mode", "payment".to_string()),
            ("success_url", format!("{}{}", origin, product.success_path)),
            ("cancel_url", format!("{}{}", origin, product.cancel_path)),
            ("metadata[service]", product.service.clone()),
        ];

        let response = self
            .client
            .post(format!("{}/checkout/sessions", self.base_url))
            .bearer_auth(&self.secret_key)
            .form(&form)
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn retrieve_session(&self, session_id: &str) -> Result<CheckoutSession> {
        if session_id.is_empty() || !session_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(anyhow!("Invalid checkout session id"));
        }
        let response = self
            .client
            .get(format!("{}/checkout/sessions/{}", self.base_url, session_id))
            .bearer_auth(&self.secret_key)
            .send()
            .await?;
        Self::parse(response).await
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SignatureError {
    #[error("signature header is malformed")]
    MalformedHeader,
    #[error("signature timestamp is outside the tolerance window")]
    Expired,
    #[error("no signature matches the payload")]
    Mismatch,
    #[error("payload is not a valid event: {0}")]
    InvalidPayload(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

/// Checks `t=<unix>,v1=<hex>` signature headers over `"<t>.<payload>"`
pub struct WebhookVerifier {
    key: HmacSha256,
    tolerance_secs: u64,
}

impl WebhookVerifier {
    pub fn new(secret: &str, tolerance_secs: i64) -> Result<Self> {
        let key = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| anyhow!("Invalid webhook secret: {}", e))?;
        Ok(Self { key, tolerance_secs: tolerance_secs.unsigned_abs() })
    }

    /// None when no webhook secret is configured
    pub fn from_config(config: &PaymentConfig) -> Result<Option<Self>> {
        config
            .webhook_secret
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(|secret| Self::new(secret, config.signature_tolerance_secs))
            .transpose()
    }

    pub fn verify(&self, payload: &[u8], header: &str, now: i64) -> Result<WebhookEvent, SignatureError> {
        let mut timestamp: Option<i64> = None;
        let mut signatures: Vec<Vec<u8>> = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", t)) => timestamp = t.parse().ok(),
                Some(("v1", sig)) => {
                    if let Ok(bytes) = hex::decode(sig) {
                        signatures.push(bytes);
                    }
                }
                _ => {}
            }
        }
        let timestamp = timestamp.ok_or(SignatureError::MalformedHeader)?;
        if signatures.is_empty() {
            return Err(SignatureError::MalformedHeader);
        }
        if now.abs_diff(timestamp) > self.tolerance_secs {
            return Err(SignatureError::Expired);
        }

        let matched = signatures.iter().any(|sig| self.mac(timestamp, payload).verify_slice(sig).is_ok());
        if !matched {
            return Err(SignatureError::Mismatch);
        }

        serde_json::from_slice(payload).map_err(|e| SignatureError::InvalidPayload(e.to_string()))
    }

    /// Header value a sender would attach to `payload` at `timestamp`
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> String {
        let mac = self.mac(timestamp, payload);
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    fn mac(&self, timestamp: i64, payload: &[u8]) -> HmacSha256 {
        let mut mac = self.key.clone();
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        mac
    }
}
