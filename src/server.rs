// ============================================================================
// File: src/server.rs
// HTTP surface: routing, request validation and application state
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::{AUTHORIZATION, ORIGIN};
use axum::http::HeaderMap;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::ChatTokens;
use crate::catalog::Catalog;
use crate::config::{Config, Products};
use crate::email::{ConciergeLead, EmailSender, Mailer, ResendClient, ServiceDetails};
use crate::error::AdvisorError;
use crate::llm_client::{ChatProvider, LLMClient};
use crate::models::Message;
use crate::orchestrator::{AdvisorOrchestrator, ChatTurn};
use crate::payment::{
    product_for_service, CheckoutSession, PaymentProvider, ProductKind, StripeClient, WebhookVerifier,
    CHECKOUT_COMPLETED,
};
use crate::response::RecommendationPayload;
use crate::search_client::{ListingSearch, ListingSource};
use crate::vehicle::VehicleNormalizer;

const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<AdvisorOrchestrator>,
    pub payments: Option<Arc<dyn PaymentProvider>>,
    pub webhook: Option<Arc<WebhookVerifier>>,
    pub mailer: Arc<Mailer>,
    pub tokens: Arc<ChatTokens>,
    pub products: Arc<Products>,
    pub public_base_url: Arc<str>,
}

impl AppState {
    /// Wires the production providers described by `config`
    pub fn from_config(config: &Config) -> Result<Self> {
        let chat: Arc<dyn ChatProvider> = Arc::new(LLMClient::new(&config.llm));
        if config.llm.api_key.is_none() {
            tracing::warn!("chat provider API key not configured, recommendations will use fallbacks");
        }

        let normalizer = VehicleNormalizer::new(config.normalizer.clone());
        let catalog = Arc::new(Catalog::builtin(&normalizer, &config.extraction.home_region));
        let search = ListingSearch::from_config(&config.search, catalog.clone() as Arc<dyn ListingSource>)?;
        let orchestrator = AdvisorOrchestrator::new(config, chat, search, catalog)?;

        let payments = StripeClient::from_config(&config.payment)
            .map(|client| Arc::new(client) as Arc<dyn PaymentProvider>);
        if payments.is_none() {
            tracing::warn!("payment secret key not configured, checkout endpoints will fail");
        }
        let webhook = WebhookVerifier::from_config(&config.payment)?.map(Arc::new);
        if webhook.is_none() {
            tracing::warn!("webhook secret not configured, webhook calls will be rejected");
        }

        let sender = ResendClient::from_config(&config.email)
            .map(|client| Arc::new(client) as Arc<dyn EmailSender>);
        let mailer = Mailer::new(&config.email, sender)?;
        if !mailer.is_enabled() {
            tracing::warn!("email API key not configured, emails will only be logged");
        }

        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            payments,
            webhook,
            mailer: Arc::new(mailer),
            tokens: Arc::new(ChatTokens::from_secret(config.server.chat_token_secret.as_deref())?),
            products: Arc::new(config.payment.products.clone()),
            public_base_url: config.server.public_base_url.as_str().into(),
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(chat))
        .route("/api/recommendations", post(recommendations))
        .route("/api/create-payment", post(create_consultation_payment))
        .route("/api/create-upsell-payment", post(create_concierge_payment))
        .route("/api/create-negotiation-payment", post(create_negotiation_payment))
        .route("/api/verify-payment", post(verify_payment))
        .route("/api/submit-concierge", post(submit_concierge))
        .route("/api/submit-service-details", post(submit_service_details))
        .route("/webhook", post(webhook))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Binds the configured port and serves until Ctrl-C
pub async fn serve(port: u16, state: AppState) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "car advisor listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutting down gracefully");
        })
        .await?;
    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy", "timestamp": chrono::Utc::now().to_rfc3339() }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationBody {
    #[serde(default)]
    messages: Vec<Message>,
    chat_token: Option<String>,
}

impl ConversationBody {
    /// Token from the body, or from an `Authorization: Bearer` header
    fn authorize(&self, headers: &HeaderMap, tokens: &ChatTokens) -> Result<String, AdvisorError> {
        let bearer = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        let token = self
            .chat_token
            .as_deref()
            .or(bearer)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| AdvisorError::Unauthorized("A chat token is required".to_string()))?;
        tokens.verify(token.trim())
    }

    fn require_messages(&self) -> Result<(), AdvisorError> {
        if self.messages.is_empty() {
            return Err(AdvisorError::Validation("messages are required".to_string()));
        }
        Ok(())
    }
}

async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ConversationBody>,
) -> Result<Json<ChatTurn>, AdvisorError> {
    let session_id = body.authorize(&headers, &state.tokens)?;
    body.require_messages()?;
    tracing::debug!(%session_id, messages = body.messages.len(), "chat request");

    let turn = state.orchestrator.chat_turn(&body.messages).await?;
    Ok(Json(turn))
}

async fn recommendations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ConversationBody>,
) -> Result<Json<RecommendationPayload>, AdvisorError> {
    let session_id = body.authorize(&headers, &state.tokens)?;
    body.require_messages()?;
    tracing::info!(%session_id, messages = body.messages.len(), "recommendation request");

    Ok(Json(state.orchestrator.recommend(&body.messages).await))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckoutResponse {
    session_id: String,
    url: Option<String>,
}

async fn create_consultation_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<CheckoutResponse>, AdvisorError> {
    create_checkout(&state, &headers, ProductKind::Consultation).await
}

async fn create_concierge_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<CheckoutResponse>, AdvisorError> {
    create_checkout(&state, &headers, ProductKind::Concierge).await
}

async fn create_negotiation_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<CheckoutResponse>, AdvisorError> {
    create_checkout(&state, &headers, ProductKind::Negotiation).await
}

async fn create_checkout(
    state: &AppState,
    headers: &HeaderMap,
    kind: ProductKind,
) -> Result<Json<CheckoutResponse>, AdvisorError> {
    let payments = state.payments.as_ref().ok_or(AdvisorError::ConfigurationMissing("payment provider"))?;
    let product = kind.product(&state.products);
    let origin = headers
        .get(ORIGIN)
        .and_then(|v| v.to_str().ok())
        .filter(|o| o.starts_with("http://") || o.starts_with("https://"))
        .unwrap_or(&*state.public_base_url);

    let session = payments
        .create_checkout_session(product, origin)
        .await
        .map_err(|e| AdvisorError::upstream("payment provider", e))?;
    tracing::info!(product = %product.name, session_id = %session.id, "checkout session created");

    Ok(Json(CheckoutResponse { session_id: session.id, url: session.url }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyBody {
    session_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponse {
    success: bool,
    chat_token: String,
    customer_email: Option<String>,
}

async fn verify_payment(
    State(state): State<AppState>,
    Json(body): Json<VerifyBody>,
) -> Result<Json<VerifyResponse>, AdvisorError> {
    let session_id = body
        .session_id
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| AdvisorError::Validation("sessionId is required".to_string()))?;
    let payments = state.payments.as_ref().ok_or(AdvisorError::ConfigurationMissing("payment provider"))?;

    let session = payments
        .retrieve_session(session_id.trim())
        .await
        .map_err(|e| AdvisorError::upstream("payment provider", e))?;
    if !session.is_paid() {
        tracing::info!(session_id = %session.id, status = ?session.payment_status, "payment not completed");
        return Err(AdvisorError::Validation("Payment not completed".to_string()));
    }

    Ok(Json(VerifyResponse {
        success: true,
        chat_token: state.tokens.issue(&session.id),
        customer_email: session.customer_email().map(str::to_string),
    }))
}

async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AdvisorError> {
    let verifier = state
        .webhook
        .as_ref()
        .ok_or_else(|| AdvisorError::Validation("Webhook signing is not configured".to_string()))?;
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AdvisorError::Validation("Missing signature header".to_string()))?;

    let event = verifier
        .verify(&body, signature, chrono::Utc::now().timestamp())
        .map_err(|e| {
            tracing::warn!(error = %e, "webhook signature rejected");
            AdvisorError::Validation(format!("Webhook Error: {}", e))
        })?;

    if event.kind == CHECKOUT_COMPLETED {
        match serde_json::from_value::<CheckoutSession>(event.data.object) {
            Ok(session) => confirm_checkout(&state, &session),
            Err(e) => tracing::warn!(error = %e, "completed checkout carried no readable session"),
        }
    } else {
        tracing::info!(kind = %event.kind, "webhook event ignored");
    }

    Ok(Json(json!({ "received": true })))
}

fn confirm_checkout(state: &AppState, session: &CheckoutSession) {
    tracing::info!(session_id = %session.id, service = ?session.service(), "checkout completed");

    let Some(email) = session.customer_email() else {
        tracing::warn!(session_id = %session.id, "completed checkout has no customer email");
        return;
    };
    let product = session
        .service()
        .and_then(|s| product_for_service(&state.products, s))
        .unwrap_or(&state.products.consultation);

    match state.mailer.payment_confirmation(email, product, &session.id) {
        Ok(message) => state.mailer.dispatch(message),
        Err(e) => tracing::error!(error = %e, "failed to build confirmation email"),
    }
}

#[derive(Debug, Serialize)]
struct LeadResponse {
    success: bool,
    message: &'static str,
}

async fn submit_concierge(
    State(state): State<AppState>,
    Json(lead): Json<ConciergeLead>,
) -> Result<Json<LeadResponse>, AdvisorError> {
    lead.validate()?;
    tracing::info!(email = ?lead.email, "concierge lead received");

    match state.mailer.concierge_emails(&lead) {
        Ok(emails) => emails.into_iter().for_each(|email| state.mailer.dispatch(email)),
        Err(e) => tracing::error!(error = %e, "failed to build lead emails"),
    }

    Ok(Json(LeadResponse { success: true, message: "Information received successfully" }))
}

async fn submit_service_details(
    State(state): State<AppState>,
    Json(details): Json<ServiceDetails>,
) -> Result<Json<LeadResponse>, AdvisorError> {
    details.validate()?;
    tracing::info!(email = ?details.email, vehicle = ?details.vehicle, "service details received");

    match state.mailer.service_details_emails(&details) {
        Ok(emails) => emails.into_iter().for_each(|email| state.mailer.dispatch(email)),
        Err(e) => tracing::error!(error = %e, "failed to build lead emails"),
    }

    Ok(Json(LeadResponse { success: true, message: "Service details received successfully" }))
}
