// ============================================================================
// File: tests/api.rs
// HTTP surface exercised end to end with in-process providers
// ============================================================================

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tower::ServiceExt;

use car_advisor::auth::ChatTokens;
use car_advisor::catalog::Catalog;
use car_advisor::config::{Config, Product};
use car_advisor::email::{EmailSender, Mailer, OutgoingEmail};
use car_advisor::llm_client::{ChatProvider, ChatReply, ChatRequest, StructuredCall};
use car_advisor::orchestrator::AdvisorOrchestrator;
use car_advisor::payment::{CheckoutSession, CustomerDetails, PaymentProvider, WebhookVerifier};
use car_advisor::search_client::{ListingSearch, ListingSource, SyntheticSource};
use car_advisor::server::{router, AppState};
use car_advisor::vehicle::VehicleNormalizer;

const TOKEN_SECRET: &str = "test-secret";
const WEBHOOK_SECRET: &str = "whsec_test";

/// Answers chat turns with `text` and structured calls with `structured`;
/// either one missing behaves like an unavailable provider.
#[derive(Default)]
struct FakeChat {
    text: Option<String>,
    structured: Option<Value>,
}

#[async_trait]
impl ChatProvider for FakeChat {
    async fn complete(&self, request: ChatRequest) -> Result<ChatReply> {
        match (&request.schema, &self.structured, &self.text) {
            (Some(schema), Some(arguments), _) => Ok(ChatReply {
                text: None,
                structured: Some(StructuredCall { name: schema.name.clone(), arguments: arguments.to_string() }),
                tokens_used: 10,
            }),
            (None, _, Some(text)) => Ok(ChatReply { text: Some(text.clone()), structured: None, tokens_used: 10 }),
            _ => Err(anyhow!("provider unavailable")),
        }
    }
}

#[derive(Default)]
struct FakePayments {
    origins: Mutex<Vec<String>>,
}

#[async_trait]
impl PaymentProvider for FakePayments {
    async fn create_checkout_session(&self, product: &Product, origin: &str) -> Result<CheckoutSession> {
        self.origins.lock().unwrap().push(origin.to_string());
        Ok(CheckoutSession {
            id: format!("cs_{}", product.service),
            url: Some(format!("https://checkout.test/{}", product.amount_cents)),
            payment_status: None,
            customer_details: None,
            metadata: Default::default(),
        })
    }

    async fn retrieve_session(&self, session_id: &str) -> Result<CheckoutSession> {
        let paid = session_id == "cs_paid";
        Ok(CheckoutSession {
            id: session_id.to_string(),
            url: None,
            payment_status: Some(if paid { "paid" } else { "unpaid" }.to_string()),
            customer_details: Some(CustomerDetails { email: Some("buyer@example.com".to_string()), name: None }),
            metadata: Default::default(),
        })
    }
}

#[derive(Default)]
struct RecordingSender {
    sent: Mutex<Vec<OutgoingEmail>>,
}

#[async_trait]
impl EmailSender for RecordingSender {
    async fn send(&self, email: &OutgoingEmail) -> Result<()> {
        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}

impl RecordingSender {
    async fn wait_for(&self, count: usize) -> Vec<OutgoingEmail> {
        for _ in 0..50 {
            if self.sent.lock().unwrap().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.sent.lock().unwrap().clone()
    }
}

struct Harness {
    app: Router,
    payments: Arc<FakePayments>,
    emails: Arc<RecordingSender>,
}

fn harness(chat: FakeChat) -> Harness {
    let config = Config::default();
    let normalizer = VehicleNormalizer::new(config.normalizer.clone());
    let catalog = Arc::new(Catalog::builtin(&normalizer, &config.extraction.home_region));
    let search = ListingSearch::new(
        vec![catalog.clone() as Arc<dyn ListingSource>, Arc::new(SyntheticSource)],
        config.search.max_results,
    );
    let orchestrator = AdvisorOrchestrator::new(&config, Arc::new(chat), search, catalog).unwrap();

    let payments = Arc::new(FakePayments::default());
    let emails = Arc::new(RecordingSender::default());
    let state = AppState {
        orchestrator: Arc::new(orchestrator),
        payments: Some(payments.clone()),
        webhook: Some(Arc::new(WebhookVerifier::new(WEBHOOK_SECRET, 300).unwrap())),
        mailer: Arc::new(Mailer::new(&config.email, Some(emails.clone())).unwrap()),
        tokens: Arc::new(ChatTokens::new(TOKEN_SECRET).unwrap()),
        products: Arc::new(config.payment.products.clone()),
        public_base_url: "https://advisor.test".into(),
    };

    Harness { app: router(state), payments, emails }
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn token() -> String {
    ChatTokens::new(TOKEN_SECRET).unwrap().issue("cs_paid")
}

fn buyer_conversation() -> Value {
    json!([
        { "role": "user", "content": "Hi, I want to buy a car" },
        { "role": "assistant", "content": "Great! What kind of vehicle and budget?" },
        { "role": "user", "content": "A Honda sedan, ideally under $30,000" },
        { "role": "assistant", "content": "Where are you located?" },
        { "role": "user", "content": "I live in Des Moines and I'm ready to buy this month" },
        { "role": "assistant", "content": "Perfect, let me find your ideal matches." }
    ])
}

#[tokio::test]
async fn test_health_reports_healthy() {
    let fixture = harness(FakeChat::default());

    let (status, body) = send(&fixture.app, Request::get("/health").body(Body::empty()).unwrap()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert!(body["timestamp"].as_str().unwrap().contains('T'));
}

#[tokio::test]
async fn test_chat_requires_token() {
    let fixture = harness(FakeChat { text: Some("Hello".to_string()), structured: None });
    let messages = json!([{ "role": "user", "content": "hi" }]);

    let (missing, _) = send(&fixture.app, post_json("/api/chat", json!({ "messages": messages }))).await;
    let forged = ChatTokens::new("someone-else").unwrap().issue("cs_paid");
    let (invalid, body) = send(
        &fixture.app,
        post_json("/api/chat", json!({ "messages": messages, "chatToken": forged })),
    )
    .await;

    assert_eq!(missing, StatusCode::UNAUTHORIZED);
    assert_eq!(invalid, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_chat_turn_flags_readiness() {
    let fixture = harness(FakeChat {
        text: Some("Perfect! I have enough information to find your ideal matches.".to_string()),
        structured: None,
    });
    let messages = json!([{ "role": "user", "content": "I need a car" }]);

    let (status, body) = send(
        &fixture.app,
        post_json("/api/chat", json!({ "messages": messages, "chatToken": token() })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["readyForRecommendations"], true);
    assert!(body.get("recommendation").is_none());
}

#[tokio::test]
async fn test_chat_accepts_bearer_header_and_rejects_empty_history() {
    let fixture = harness(FakeChat { text: Some("Hello".to_string()), structured: None });
    let request = Request::builder()
        .method("POST")
        .uri("/api/chat")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", token()))
        .body(Body::from(json!({ "messages": [] }).to_string()))
        .unwrap();

    let (status, _) = send(&fixture.app, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_chat_upstream_failure_is_500() {
    let fixture = harness(FakeChat::default());
    let messages = json!([{ "role": "user", "content": "hi" }]);

    let (status, body) = send(
        &fixture.app,
        post_json("/api/chat", json!({ "messages": messages, "chatToken": token() })),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "Failed to reach chat provider");
}

#[tokio::test]
async fn test_recommendations_degrade_to_three_catalog_picks() {
    let fixture = harness(FakeChat::default());

    let (status, body) = send(
        &fixture.app,
        post_json("/api/recommendations", json!({ "messages": buyer_conversation(), "chatToken": token() })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let vehicles = body["vehicles"].as_array().unwrap();
    assert_eq!(vehicles.len(), 3);
    for vehicle in vehicles {
        assert!(vehicle["price"].as_u64().unwrap() <= 30_000);
        assert!(vehicle["imageUrl"].as_str().unwrap().starts_with("https://images.unsplash.com/"));
    }
    assert_eq!(body["meta"]["listingSource"], "catalog");
    assert_eq!(body["meta"]["strategy"], "static_fallback");
    assert_eq!(body["meta"]["criteria"]["maxPrice"], 30_000);
}

#[tokio::test]
async fn test_recommendations_pad_structured_answer_to_three() {
    let structured = json!({
        "comparisonType": "model_comparison",
        "explanation": "Two strong Honda-friendly sedans near your budget.",
        "vehicles": [
            { "make": "Honda", "model": "Accord", "year": 2024, "trim": "EX", "price": 29500,
              "imageUrl": "http://evil.example/x.png" },
            { "make": "Hyundai", "model": "Sonata", "year": 2024, "price": 28900 }
        ]
    });
    let fixture = harness(FakeChat { text: None, structured: Some(structured) });

    let (status, body) = send(
        &fixture.app,
        post_json("/api/recommendations", json!({ "messages": buyer_conversation(), "chatToken": token() })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let vehicles = body["vehicles"].as_array().unwrap();
    assert_eq!(vehicles.len(), 3);
    assert_eq!(vehicles[0]["model"], "Accord");
    assert_eq!(vehicles[0]["price"], 29_500);
    assert!(!vehicles[0]["imageUrl"].as_str().unwrap().contains("evil.example"));
    assert_eq!(body["comparisonType"], "model_comparison");
    assert_eq!(body["meta"]["strategy"], "structured");
}

#[tokio::test]
async fn test_create_payment_uses_request_origin() {
    let fixture = harness(FakeChat::default());
    let request = Request::builder()
        .method("POST")
        .uri("/api/create-payment")
        .header("origin", "https://shop.example")
        .body(Body::empty())
        .unwrap();

    let (status, body) = send(&fixture.app, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sessionId"], "cs_ai_car_advisor");
    assert_eq!(body["url"], "https://checkout.test/2900");
    assert_eq!(fixture.payments.origins.lock().unwrap().clone(), vec!["https://shop.example".to_string()]);
}

#[tokio::test]
async fn test_upsell_products_fall_back_to_public_origin() {
    let fixture = harness(FakeChat::default());
    let empty = || Request::builder().method("POST");

    let (concierge_status, concierge) =
        send(&fixture.app, empty().uri("/api/create-upsell-payment").body(Body::empty()).unwrap()).await;
    let (_, negotiation) =
        send(&fixture.app, empty().uri("/api/create-negotiation-payment").body(Body::empty()).unwrap()).await;

    assert_eq!(concierge_status, StatusCode::OK);
    assert_eq!(concierge["url"], "https://checkout.test/54900");
    assert_eq!(negotiation["url"], "https://checkout.test/19900");
    assert_eq!(
        fixture.payments.origins.lock().unwrap().clone(),
        vec!["https://advisor.test".to_string(), "https://advisor.test".to_string()]
    );
}

#[tokio::test]
async fn test_verify_payment_issues_chat_token() {
    let fixture = harness(FakeChat::default());

    let (status, body) = send(&fixture.app, post_json("/api/verify-payment", json!({ "sessionId": "cs_paid" }))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["customerEmail"], "buyer@example.com");
    let issued = body["chatToken"].as_str().unwrap();
    assert_eq!(ChatTokens::new(TOKEN_SECRET).unwrap().verify(issued).unwrap(), "cs_paid");
}

#[tokio::test]
async fn test_verify_payment_rejects_unpaid_and_missing() {
    let fixture = harness(FakeChat::default());

    let (unpaid, body) = send(&fixture.app, post_json("/api/verify-payment", json!({ "sessionId": "cs_open" }))).await;
    let (missing, _) = send(&fixture.app, post_json("/api/verify-payment", json!({}))).await;

    assert_eq!(unpaid, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Payment not completed");
    assert_eq!(missing, StatusCode::BAD_REQUEST);
}

fn completed_event() -> Vec<u8> {
    json!({
        "id": "evt_1",
        "type": "checkout.session.completed",
        "data": { "object": {
            "id": "cs_paid",
            "payment_status": "paid",
            "customer_details": { "email": "buyer@example.com" },
            "metadata": { "service": "premium_concierge" }
        } }
    })
    .to_string()
    .into_bytes()
}

fn webhook_request(payload: Vec<u8>, signature: Option<String>) -> Request<Body> {
    let mut builder = Request::builder().method("POST").uri("/webhook");
    if let Some(signature) = signature {
        builder = builder.header("stripe-signature", signature);
    }
    builder.body(Body::from(payload)).unwrap()
}

#[tokio::test]
async fn test_signed_webhook_sends_confirmation() {
    let fixture = harness(FakeChat::default());
    let payload = completed_event();
    let signature = WebhookVerifier::new(WEBHOOK_SECRET, 300).unwrap()
        .sign(&payload, chrono::Utc::now().timestamp());

    let (status, body) = send(&fixture.app, webhook_request(payload, Some(signature))).await;
    let sent = fixture.emails.wait_for(1).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "received": true }));
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, vec!["buyer@example.com".to_string()]);
    assert_eq!(sent[0].subject, "Payment confirmed: Premium Car Concierge Service");
    assert!(sent[0].html.contains("$549.00"));
}

#[tokio::test]
async fn test_invalid_webhook_signature_has_no_side_effects() {
    let fixture = harness(FakeChat::default());
    let payload = completed_event();
    let forged = WebhookVerifier::new("not-the-secret", 300).unwrap()
        .sign(&payload, chrono::Utc::now().timestamp());

    let (forged_status, _) = send(&fixture.app, webhook_request(payload.clone(), Some(forged))).await;
    let (missing_status, _) = send(&fixture.app, webhook_request(payload, None)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(forged_status, StatusCode::BAD_REQUEST);
    assert_eq!(missing_status, StatusCode::BAD_REQUEST);
    assert!(fixture.emails.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_concierge_lead_notifies_customer_and_team() {
    let fixture = harness(FakeChat::default());
    let lead = json!({
        "firstName": "Ada",
        "lastName": "Lovelace",
        "email": "ada@example.com",
        "budget": "$40,000",
        "mustHaves": "AWD"
    });

    let (status, body) = send(&fixture.app, post_json("/api/submit-concierge", lead)).await;
    let sent = fixture.emails.wait_for(2).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(sent.len(), 2);
    let recipients: Vec<String> = sent.iter().flat_map(|e| e.to.clone()).collect();
    assert!(recipients.contains(&"ada@example.com".to_string()));
    assert!(recipients.contains(&Config::default().email.team_address));
}

#[tokio::test]
async fn test_lead_forms_validate_required_fields() {
    let fixture = harness(FakeChat::default());

    let (concierge, body) = send(
        &fixture.app,
        post_json("/api/submit-concierge", json!({ "firstName": "Ada", "email": "ada@example.com" })),
    )
    .await;
    let (service, _) = send(
        &fixture.app,
        post_json("/api/submit-service-details", json!({ "email": "buyer@example.com" })),
    )
    .await;

    assert_eq!(concierge, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "lastName is required");
    assert_eq!(service, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_service_details_accepted() {
    let fixture = harness(FakeChat::default());
    let details = json!({
        "email": "buyer@example.com",
        "vehicle": "2024 Honda Accord Sport",
        "targetPrice": "$26,500",
        "zipCode": "50309"
    });

    let (status, body) = send(&fixture.app, post_json("/api/submit-service-details", details)).await;
    let sent = fixture.emails.wait_for(2).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(sent.len(), 2);
}
