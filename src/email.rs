// ============================================================================
// File: src/email.rs
// Transactional email: lead forms, templates and fire-and-forget delivery
// ============================================================================

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use handlebars::Handlebars;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::{EmailConfig, Product};
use crate::error::AdvisorError;

const PAYMENT_CONFIRMATION: &str = "payment_confirmation";
const CONCIERGE_ACK: &str = "concierge_ack";
const CONCIERGE_TEAM: &str = "concierge_team";
const SERVICE_ACK: &str = "service_ack";
const SERVICE_TEAM: &str = "service_team";

const TEMPLATES: &[(&str, &str)] = &[
    (
        PAYMENT_CONFIRMATION,
        "<h2>Thank you for your purchase!</h2>\
         <p>Your payment for <strong>{{product}}</strong> ({{amount}}) was received.</p>\
         <p>Reference: {{session_id}}</p>\
         <p>Head back to your advisor session any time to continue.</p>",
    ),
    (
        CONCIERGE_ACK,
        "<h2>Hi {{first_name}},</h2>\
         <p>Thanks for choosing our concierge service. A specialist will reach out \
         within one business day by {{preferred_contact}}.</p>\
         <p>Budget: {{budget}}<br>Timeline: {{timeline}}</p>",
    ),
    (
        CONCIERGE_TEAM,
        "<h2>New concierge client</h2>\
         <p><strong>{{first_name}} {{last_name}}</strong> &lt;{{email}}&gt;</p>\
         <ul>\
         <li>Phone: {{phone}}</li>\
         <li>Budget: {{budget}}</li>\
         <li>Timeline: {{timeline}}</li>\
         <li>Preferred contact: {{preferred_contact}}</li>\
         <li>Current vehicle: {{current_vehicle}}</li>\
         <li>Must-haves: {{must_haves}}</li>\
         <li>Additional info: {{additional_info}}</li>\
         </ul>",
    ),
    (
        SERVICE_ACK,
        "<h2>Hi {{name}},</h2>\
         <p>We received the details for your <strong>{{vehicle}}</strong> and will start \
         negotiating on your behalf. Expect an update within two business days.</p>",
    ),
    (
        SERVICE_TEAM,
        "<h2>New negotiation request</h2>\
         <ul>\
         <li>Customer: {{name}} &lt;{{email}}&gt;</li>\
         <li>Vehicle: {{vehicle}}</li>\
         <li>Target price: {{target_price}}</li>\
         <li>ZIP code: {{zip_code}}</li>\
         <li>Trade-in: {{trade_in}}</li>\
         <li>Notes: {{notes}}</li>\
         <li>Checkout session: {{session_id}}</li>\
         </ul>",
    ),
];

const NOT_PROVIDED: &str = "Not provided";

/// Concierge intake form
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConciergeLead {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub budget: Option<String>,
    pub timeline: Option<String>,
    pub preferred_contact: Option<String>,
    pub current_vehicle: Option<String>,
    pub must_haves: Option<String>,
    pub additional_info: Option<String>,
}

impl ConciergeLead {
    pub fn validate(&self) -> Result<(), AdvisorError> {
        require(&self.first_name, "firstName")?;
        require(&self.last_name, "lastName")?;
        require_email(&self.email)
    }
}

/// Vehicle details submitted after buying the negotiation service
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDetails {
    pub email: Option<String>,
    pub vehicle: Option<String>,
    pub name: Option<String>,
    pub session_id: Option<String>,
    pub target_price: Option<String>,
    pub zip_code: Option<String>,
    pub trade_in: Option<String>,
    pub notes: Option<String>,
}

impl ServiceDetails {
    pub fn validate(&self) -> Result<(), AdvisorError> {
        require_email(&self.email)?;
        require(&self.vehicle, "vehicle")
    }
}

fn require(value: &Option<String>, field: &str) -> Result<(), AdvisorError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(()),
        _ => Err(AdvisorError::Validation(format!("{} is required", field))),
    }
}

fn require_email(value: &Option<String>) -> Result<(), AdvisorError> {
    require(value, "email")?;
    let email = value.as_deref().unwrap_or_default().trim();
    match email.split_once('@') {
        Some((user, domain)) if !user.is_empty() && domain.contains('.') => Ok(()),
        _ => Err(AdvisorError::Validation("email is not a valid address".to_string())),
    }
}

fn or_default(value: &Option<String>) -> &str {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty()).unwrap_or(NOT_PROVIDED)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingEmail {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<()>;
}

/// Client for a Resend-compatible `POST /emails` API
pub struct ResendClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl ResendClient {
    pub fn new(base_url: &str, api_key: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    pub fn from_config(config: &EmailConfig) -> Option<Self> {
        let key = config.api_key.as_deref().filter(|k| !k.trim().is_empty())?;
        Some(Self::new(&config.base_url, key.to_string()))
    }
}

#[async_trait]
impl EmailSender for ResendClient {
    async fn send(&self, email: &OutgoingEmail) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/emails", self.base_url))
            .bearer_auth(&self.api_key)
            .json(email)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Email API error: HTTP {}\nResponse: {}", status, error_text));
        }
        Ok(())
    }
}

/// Renders templates and hands emails to the sender in the background.
/// Without a sender every email is logged and dropped.
pub struct Mailer {
    sender: Option<Arc<dyn EmailSender>>,
    templates: Handlebars<'static>,
    from: String,
    team_address: String,
}

impl Mailer {
    pub fn new(config: &EmailConfig, sender: Option<Arc<dyn EmailSender>>) -> Result<Self> {
        let mut templates = Handlebars::new();
        templates.set_strict_mode(true);
        for (name, source) in TEMPLATES {
            templates
                .register_template_string(name, *source)
                .map_err(|e| anyhow!("Invalid email template '{}': {}", name, e))?;
        }

        Ok(Self {
            sender,
            templates,
            from: config.from.clone(),
            team_address: config.team_address.clone(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    pub fn payment_confirmation(&self, to: &str, product: &Product, session_id: &str) -> Result<OutgoingEmail> {
        let amount = format!("${}.{:02}", product.amount_cents / 100, product.amount_cents % 100);
        let html = self.render(
            PAYMENT_CONFIRMATION,
            &json!({ "product": product.name, "amount": amount, "session_id": session_id }),
        )?;
        Ok(self.email(to, format!("Payment confirmed: {}", product.name), html))
    }

    /// Customer acknowledgement followed by the team notification
    pub fn concierge_emails(&self, lead: &ConciergeLead) -> Result<[OutgoingEmail; 2]> {
        let first_name = or_default(&lead.first_name);
        let last_name = or_default(&lead.last_name);
        let email = or_default(&lead.email);
        let context = json!({
            "first_name": first_name,
            "last_name": last_name,
            "email": email,
            "phone": or_default(&lead.phone),
            "budget": or_default(&lead.budget),
            "timeline": or_default(&lead.timeline),
            "preferred_contact": or_default(&lead.preferred_contact),
            "current_vehicle": or_default(&lead.current_vehicle),
            "must_haves": or_default(&lead.must_haves),
            "additional_info": or_default(&lead.additional_info),
        });

        let ack = self.email(
            email,
            "Welcome to the concierge service".to_string(),
            self.render(CONCIERGE_ACK, &context)?,
        );
        let team = self.email(
            &self.team_address,
            format!("New concierge client: {} {}", first_name, last_name),
            self.render(CONCIERGE_TEAM, &context)?,
        );
        Ok([ack, team])
    }

    pub fn service_details_emails(&self, details: &ServiceDetails) -> Result<[OutgoingEmail; 2]> {
        let email = or_default(&details.email);
        let vehicle = or_default(&details.vehicle);
        let name = details.name.as_deref().map(str::trim).filter(|n| !n.is_empty()).unwrap_or("there");
        let context = json!({
            "name": name,
            "email": email,
            "vehicle": vehicle,
            "target_price": or_default(&details.target_price),
            "zip_code": or_default(&details.zip_code),
            "trade_in": or_default(&details.trade_in),
            "notes": or_default(&details.notes),
            "session_id": or_default(&details.session_id),
        });

        let ack = self.email(
            email,
            format!("We're on it: {}", vehicle),
            self.render(SERVICE_ACK, &context)?,
        );
        let team = self.email(
            &self.team_address,
            format!("Negotiation request: {}", vehicle),
            self.render(SERVICE_TEAM, &context)?,
        );
        Ok([ack, team])
    }

    /// Sends in a background task; failures are logged, never returned
    pub fn dispatch(&self, email: OutgoingEmail) {
        let Some(sender) = self.sender.clone() else {
            tracing::info!(to = ?email.to, subject = %email.subject, "email disabled, skipping");
            return;
        };

        tokio::spawn(async move {
            match sender.send(&email).await {
                Ok(()) => tracing::info!(to = ?email.to, subject = %email.subject, "email sent"),
                Err(e) => tracing::error!(to = ?email.to, error = %e, "failed to send email"),
            }
        });
    }

    fn render(&self, template: &str, context: &serde_json::Value) -> Result<String> {
        self.templates
            .render(template, context)
            .map_err(|e| anyhow!("Failed to render email '{}': {}", template, e))
    }

    fn email(&self, to: &str, subject: String, html: String) -> OutgoingEmail {
        OutgoingEmail { from: self.from.clone(), to: vec![to.to_string()], subject, html }
    }
}
