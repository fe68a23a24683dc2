// ============================================================================
// File: src/config.rs
// Configuration structures, environment overrides and validation
// ============================================================================

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Main configuration structure loaded from config.json
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub search: SearchConfig,
    pub extraction: ExtractionConfig,
    pub normalizer: NormalizerConfig,
    pub payment: PaymentConfig,
    pub email: EmailConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,

    /// Origin used for checkout redirects when the request carries none
    pub public_base_url: String,

    /// Secret for signing chat tokens; a random one is generated when absent
    pub chat_token_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            public_base_url: "http://localhost:3000".to_string(),
            chat_token_secret: None,
        }
    }
}

/// Chat-completion provider settings
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub chat_max_tokens: usize,
    pub chat_temperature: f32,
    pub analysis_max_tokens: usize,
    pub analysis_temperature: f32,

    /// Token budget for the conversation history sent upstream
    pub history_token_budget: usize,

    /// Attach a recommendation payload to chat turns once the conversation is ready
    pub inline_recommendations: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            chat_max_tokens: 500,
            chat_temperature: 0.7,
            analysis_max_tokens: 1000,
            analysis_temperature: 0.3,
            history_token_budget: 6000,
            inline_recommendations: false,
        }
    }
}

/// Listing search settings
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SearchConfig {
    /// Key for the search API; the engine-backed adapter is disabled without it
    pub api_key: Option<String>,
    pub engine_url: String,
    pub scrape_url: String,
    pub timeout_secs: u64,
    pub max_results: usize,
    pub allowed_domains: Vec<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            engine_url: "https://api.search.brave.com/res/v1/web/search".to_string(),
            scrape_url: "https://html.duckduckgo.com/html/".to_string(),
            timeout_secs: 8,
            max_results: 8,
            allowed_domains: strings(&[
                "cars.com",
                "autotrader.com",
                "cargurus.com",
                "carfax.com",
                "edmunds.com",
                "truecar.com",
                "carvana.com",
                "kbb.com",
            ]),
        }
    }
}

/// Vocabulary and thresholds for criteria extraction
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ExtractionConfig {
    pub gazetteer: Vec<String>,
    pub home_region: String,
    pub vehicle_types: Vec<String>,
    pub brands: Vec<String>,
    pub descriptors: Vec<String>,
    pub purchase_intent: Vec<String>,
    pub default_term: String,
    pub max_terms: usize,

    /// Without a recognized location, more than this many messages are needed
    pub location_message_threshold: usize,

    /// More than this many messages are always needed
    pub min_messages: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            gazetteer: strings(&[
                "Des Moines",
                "West Des Moines",
                "Ankeny",
                "Urbandale",
                "Ames",
                "Cedar Rapids",
                "Iowa City",
                "Davenport",
                "Sioux City",
                "Omaha",
                "Kansas City",
                "Minneapolis",
                "Chicago",
            ]),
            home_region: "Des Moines, IA".to_string(),
            vehicle_types: strings(&[
                "suv",
                "sedan",
                "truck",
                "pickup",
                "minivan",
                "van",
                "hatchback",
                "coupe",
                "convertible",
                "wagon",
                "crossover",
                "ev",
                "electric",
                "hybrid",
            ]),
            brands: strings(&[
                "toyota",
                "honda",
                "mazda",
                "ford",
                "chevrolet",
                "chevy",
                "nissan",
                "hyundai",
                "kia",
                "subaru",
                "volkswagen",
                "bmw",
                "audi",
                "lexus",
                "tesla",
                "jeep",
                "ram",
                "gmc",
                "land rover",
                "mercedes-benz",
            ]),
            descriptors: strings(&[
                "reliable",
                "affordable",
                "luxury",
                "family",
                "fuel efficient",
                "safe",
                "sporty",
                "used",
                "new",
                "certified",
                "awd",
            ]),
            purchase_intent: strings(&[
                "$",
                "budget",
                "price",
                "afford",
                "buy",
                "buying",
                "purchase",
                "lease",
                "finance",
                "payment",
                "spend",
                "under",
            ]),
            default_term: "reliable car".to_string(),
            max_terms: 3,
            location_message_threshold: 4,
            min_messages: 2,
        }
    }
}

/// Defaults used when filling incomplete vehicle records
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct NormalizerConfig {
    pub postal_code: String,
    pub image_pool: Vec<String>,
    pub price_min: u32,
    pub price_max: u32,
    pub default_year: u16,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            postal_code: "50309".to_string(),
            image_pool: strings(&[
                "https://images.unsplash.com/photo-1549317661-bd32c8ce0db2?w=800",
                "https://images.unsplash.com/photo-1503376780353-7e6692767b70?w=800",
                "https://images.unsplash.com/photo-1494976388531-d1058494cdd8?w=800",
            ]),
            price_min: 30_000,
            price_max: 50_000,
            default_year: 2024,
        }
    }
}

/// A product sold through the payment provider
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Product {
    pub name: String,
    pub description: String,
    pub amount_cents: u64,
    pub currency: String,
    pub success_path: String,
    pub cancel_path: String,
    pub service: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct Products {
    pub consultation: Product,
    pub concierge: Product,
    pub negotiation: Product,
}

impl Default for Products {
    fn default() -> Self {
        Self {
            consultation: Product {
                name: "AI Car Advisor Consultation".to_string(),
                description: "Personalized car recommendations from our AI expert with 64 years of automotive experience".to_string(),
                amount_cents: 2_900,
                currency: "usd".to_string(),
                success_path: "/chat?session_id={CHECKOUT_SESSION_ID}".to_string(),
                cancel_path: "/".to_string(),
                service: "ai_car_advisor".to_string(),
            },
            concierge: Product {
                name: "Premium Car Concierge Service".to_string(),
                description: "Complete car buying service: sourcing, negotiation, and delivery. Skip the dealership entirely.".to_string(),
                amount_cents: 54_900,
                currency: "usd".to_string(),
                success_path: "/concierge-success?session_id={CHECKOUT_SESSION_ID}".to_string(),
                cancel_path: "/chat".to_string(),
                service: "premium_concierge".to_string(),
            },
            negotiation: Product {
                name: "Dealer Negotiation Service".to_string(),
                description: "We negotiate the out-the-door price with the dealer on your behalf.".to_string(),
                amount_cents: 19_900,
                currency: "usd".to_string(),
                success_path: "/negotiation-success?session_id={CHECKOUT_SESSION_ID}".to_string(),
                cancel_path: "/chat".to_string(),
                service: "negotiation".to_string(),
            },
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct PaymentConfig {
    pub secret_key: Option<String>,
    pub webhook_secret: Option<String>,
    pub base_url: String,

    /// Maximum age of a webhook signature timestamp
    pub signature_tolerance_secs: i64,
    pub products: Products,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            secret_key: None,
            webhook_secret: None,
            base_url: "https://api.stripe.com/v1".to_string(),
            signature_tolerance_secs: 300,
            products: Products::default(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct EmailConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub from: String,

    /// Inbox that receives new-lead notifications
    pub team_address: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.resend.com".to_string(),
            from: "NextCar Advisor <advisor@nextcar.example>".to_string(),
            team_address: "team@nextcar.example".to_string(),
        }
    }
}

impl Config {
    /// Load the JSON file at `path` (defaults when it does not exist), then
    /// apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = fs::read_to_string(path)
                .map_err(|e| anyhow!("Failed to read config file: {}", e))?;
            serde_json::from_str(&content).map_err(|e| anyhow!("Failed to parse config: {}", e))?
        } else {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            Config::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Overlay secrets and deployment settings from a key lookup (the
    /// process environment in production).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("OPENAI_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = get("OPENAI_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = get("STRIPE_SECRET_KEY") {
            self.payment.secret_key = Some(v);
        }
        if let Some(v) = get("STRIPE_WEBHOOK_SECRET") {
            self.payment.webhook_secret = Some(v);
        }
        if let Some(v) = get("SEARCH_API_KEY") {
            self.search.api_key = Some(v);
        }
        if let Some(v) = get("EMAIL_API_KEY") {
            self.email.api_key = Some(v);
        }
        if let Some(v) = get("CHAT_TOKEN_SECRET") {
            self.server.chat_token_secret = Some(v);
        }
        if let Some(v) = get("PUBLIC_BASE_URL") {
            self.server.public_base_url = v;
        }
        if let Some(port) = get("PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.normalizer.image_pool.is_empty() {
            return Err(anyhow!("At least one image URL is required in normalizer.image_pool"));
        }

        if self.normalizer.price_min == 0 || self.normalizer.price_min > self.normalizer.price_max {
            return Err(anyhow!(
                "Price range {}..={} is invalid",
                self.normalizer.price_min,
                self.normalizer.price_max
            ));
        }

        if self.extraction.gazetteer.is_empty() || self.extraction.home_region.trim().is_empty() {
            return Err(anyhow!("A gazetteer and a home region are required"));
        }

        if self.extraction.default_term.trim().is_empty() || self.extraction.max_terms == 0 {
            return Err(anyhow!("A default search term and a positive max_terms are required"));
        }

        if self.search.max_results == 0 {
            return Err(anyhow!("search.max_results must be positive"));
        }

        let products = &self.payment.products;
        for product in [&products.consultation, &products.concierge, &products.negotiation] {
            if product.amount_cents == 0 {
                return Err(anyhow!("Product '{}' must have a positive amount", product.name));
            }
        }

        Ok(())
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
