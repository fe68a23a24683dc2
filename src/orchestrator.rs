// ============================================================================
// File: src/orchestrator.rs
// Chat turns and the recommendation pipeline
// ============================================================================

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tiktoken_rs::{cl100k_base, CoreBPE};

use crate::catalog::Catalog;
use crate::config::{Config, LlmConfig};
use crate::criteria::{CriteriaExtractor, SearchCriteria};
use crate::error::AdvisorError;
use crate::llm_client::{ChatProvider, ChatRequest, StructuredSchema};
use crate::models::Message;
use crate::response::{assemble, PipelineMeta, RecommendationPayload};
use crate::search_client::{ListingCandidate, ListingSearch};
use crate::selector::{default_explanation, ComparisonType, RecommendationSelector, Tagging};
use crate::vehicle::{PartialVehicleRecord, VehicleNormalizer};

const SYSTEM_PROMPT: &str = "You are an expert automotive advisor with 64 years of combined industry experience. \
You help people find the perfect car based on their specific needs, budget, and lifestyle.

Your conversation style should be:
- Friendly and professional
- Ask targeted questions to understand their needs
- Provide expert insights about different vehicles
- Focus on practical considerations (budget, usage, features, reliability)

Key areas to explore:
1. Budget range (total budget or monthly payment preference)
2. Primary use (daily commuting, family trips, weekend adventures, etc.)
3. Size requirements (number of passengers, cargo needs)
4. Fuel preference (gas, hybrid, electric, diesel)
5. Important features (safety, technology, comfort, performance)
6. Brand preferences or concerns
7. New vs used preference
8. Timeline for purchase
9. Where they live, so we can search nearby dealers

After gathering enough information (usually 3-4 exchanges), say: \"Perfect! I have enough information to find your ideal matches. \
Let me search our current inventory and market data to find the 3 best vehicles for your specific needs.\"

Do not provide specific car recommendations in the chat. Focus on understanding their needs through conversation.";

const RECOMMENDATION_PROMPT: &str = "You are an expert automotive advisor. Using the conversation and the current \
listings below, call recommend_vehicles with exactly 3 vehicles that best fit the buyer. Prefer vehicles from the \
listings; use realistic market prices and specifications. Never invent image or listing URLs. Keep the explanation \
under 30 words.";

const HANDOFF_PHRASES: [&str; 3] = [
    "ready to provide recommendations",
    "find your ideal matches",
    "search our current inventory",
];
const READY_MESSAGE_COUNT: usize = 6;
const RECOMMEND_TOOL: &str = "recommend_vehicles";

/// Assistant reply to one chat turn
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurn {
    pub message: String,
    pub ready_for_recommendations: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<RecommendationPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StructuredRecommendation {
    comparison_type: Option<String>,
    explanation: Option<String>,
    #[serde(default)]
    vehicles: Vec<PartialVehicleRecord>,
}

pub struct AdvisorOrchestrator {
    llm: LlmConfig,
    chat: Arc<dyn ChatProvider>,
    extractor: CriteriaExtractor,
    search: ListingSearch,
    normalizer: VehicleNormalizer,
    selector: RecommendationSelector,
    brands: Vec<String>,
    vehicle_types: Vec<String>,
    bpe: Option<CoreBPE>,
}

impl AdvisorOrchestrator {
    pub fn new(
        config: &Config,
        chat: Arc<dyn ChatProvider>,
        search: ListingSearch,
        catalog: Arc<Catalog>,
    ) -> anyhow::Result<Self> {
        let bpe = match cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                tracing::warn!(error = %e, "tokenizer unavailable, estimating history size");
                None
            }
        };
        let mut brands = config.extraction.brands.clone();
        brands.extend(catalog.brands().into_iter().map(|b| b.to_lowercase()));

        Ok(Self {
            llm: config.llm.clone(),
            extractor: CriteriaExtractor::new(&config.extraction)?,
            search,
            normalizer: VehicleNormalizer::new(config.normalizer.clone()),
            selector: RecommendationSelector::new(
                chat.clone(),
                catalog,
                config.llm.analysis_max_tokens,
                config.llm.analysis_temperature,
            ),
            chat,
            brands,
            vehicle_types: config.extraction.vehicle_types.clone(),
            bpe,
        })
    }

    pub async fn chat_turn(&self, messages: &[Message]) -> Result<ChatTurn, AdvisorError> {
        let reply = self
            .chat
            .complete(ChatRequest {
                system_prompt: Some(SYSTEM_PROMPT.to_string()),
                messages: self.trim_history(messages, SYSTEM_PROMPT),
                schema: None,
                max_tokens: self.llm.chat_max_tokens,
                temperature: self.llm.chat_temperature,
            })
            .await
            .map_err(|e| AdvisorError::upstream("chat provider", e))?;

        let message = reply.text.unwrap_or_default();
        let lowered = message.to_lowercase();
        let ready = self.extractor.is_ready(messages)
            || HANDOFF_PHRASES.iter().any(|p| lowered.contains(p))
            || messages.len() >= READY_MESSAGE_COUNT;

        tracing::info!(
            messages = messages.len(),
            tokens = reply.tokens_used,
            ready,
            "chat turn completed"
        );

        let recommendation = if ready && self.llm.inline_recommendations {
            Some(self.recommend(messages).await)
        } else {
            None
        };

        Ok(ChatTurn { message, ready_for_recommendations: ready, recommendation })
    }

    /// Runs extraction, listing search, structured extraction, normalization
    /// and selection. Every stage degrades instead of failing.
    pub async fn recommend(&self, messages: &[Message]) -> RecommendationPayload {
        let criteria = self.extractor.extract(messages);
        let outcome = self.search.search(&criteria).await;
        tracing::info!(
            source = outcome.source,
            candidates = outcome.candidates.len(),
            query = %criteria.query(),
            "listing search finished"
        );

        let structured = match self.structured_vehicles(messages, &criteria, &outcome.candidates).await {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!(error = %e, "structured recommendation unavailable");
                None
            }
        };

        let (partials, upstream) = match structured {
            Some(s) => (s.vehicles, Some((s.comparison_type, s.explanation))),
            None => (
                outcome
                    .candidates
                    .iter()
                    .map(|c| PartialVehicleRecord::from_listing(c, &self.brands, &self.vehicle_types))
                    .collect(),
                None,
            ),
        };

        let normalized = {
            let mut rng = StdRng::from_entropy();
            self.normalizer.normalize(partials, &criteria.location, &mut rng)
        };

        let tagging = upstream.map(|(comparison_type, explanation)| Tagging {
            comparison_type: comparison_type
                .as_deref()
                .and_then(ComparisonType::parse)
                .unwrap_or_else(|| ComparisonType::infer(&normalized)),
            explanation: explanation
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| default_explanation(&criteria)),
        });

        let normalized_count = normalized.len();
        let selection = self.selector.select(normalized, tagging, &criteria, messages).await;

        assemble(
            selection.result,
            PipelineMeta {
                listing_source: outcome.source,
                candidate_count: outcome.candidates.len(),
                normalized_count,
                strategy: selection.strategy,
                criteria,
            },
        )
    }

    async fn structured_vehicles(
        &self,
        messages: &[Message],
        criteria: &SearchCriteria,
        candidates: &[ListingCandidate],
    ) -> Result<StructuredRecommendation, AdvisorError> {
        let system_prompt = format!("{}\n\n{}", RECOMMENDATION_PROMPT, listing_context(criteria, candidates));
        let reply = self
            .chat
            .complete(ChatRequest {
                messages: self.trim_history(messages, &system_prompt),
                system_prompt: Some(system_prompt),
                schema: Some(recommendation_schema()),
                max_tokens: self.llm.analysis_max_tokens,
                temperature: self.llm.analysis_temperature,
            })
            .await
            .map_err(|e| AdvisorError::upstream("chat provider", e))?;

        let call = reply.structured.ok_or_else(|| {
            AdvisorError::MalformedStructuredResponse("model answered in plain text".into())
        })?;
        let parsed: StructuredRecommendation = serde_json::from_str(&call.arguments)
            .map_err(|e| AdvisorError::MalformedStructuredResponse(e.to_string()))?;
        if parsed.vehicles.is_empty() {
            return Err(AdvisorError::MalformedStructuredResponse("no vehicles returned".into()));
        }
        Ok(parsed)
    }

    /// Most recent messages that fit the history budget next to `system_prompt`;
    /// the latest message is always kept.
    fn trim_history(&self, messages: &[Message], system_prompt: &str) -> Vec<Message> {
        let budget = self.llm.history_token_budget.saturating_sub(self.count_tokens(system_prompt));
        let mut used = 0;
        let mut kept = 0;
        for message in messages.iter().rev() {
            let cost = self.count_tokens(&message.content);
            if kept > 0 && used + cost > budget {
                break;
            }
            used += cost;
            kept += 1;
        }
        if kept < messages.len() {
            tracing::debug!(dropped = messages.len() - kept, "trimmed conversation history");
        }
        messages[messages.len() - kept..].to_vec()
    }

    fn count_tokens(&self, text: &str) -> usize {
        match &self.bpe {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            None => text.len() / 4,
        }
    }
}

fn listing_context(criteria: &SearchCriteria, candidates: &[ListingCandidate]) -> String {
    let mut context = format!("Buyer search: {}\n\nCurrent listings:\n", criteria.query());
    if candidates.is_empty() {
        context.push_str("(none found)\n");
    }
    for (i, c) in candidates.iter().enumerate() {
        context.push_str(&format!(
            "{}. {} | {} | {} | {}\n",
            i + 1,
            c.title,
            c.price_text.as_deref().unwrap_or("price unknown"),
            c.source_name,
            c.snippet
        ));
    }
    context
}

fn recommendation_schema() -> StructuredSchema {
    let text = serde_json::json!({ "type": "string" });
    let number = serde_json::json!({ "type": "number" });
    let list = serde_json::json!({ "type": "array", "items": { "type": "string" } });

    StructuredSchema {
        name: RECOMMEND_TOOL.to_string(),
        description: "Return the three vehicles that best match the buyer".to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "comparisonType": {
                    "type": "string",
                    "enum": ["same_vehicle", "trim_comparison", "model_comparison", "ev_comparison"]
                },
                "explanation": text,
                "vehicles": {
                    "type": "array",
                    "minItems": 1,
                    "maxItems": 3,
                    "items": {
                        "type": "object",
                        "properties": {
                            "make": text, "model": text, "year": number, "trim": text,
                            "price": number, "mileage": number, "location": text, "dealership": text,
                            "dealershipRating": number, "reliabilityRating": number, "safetyRating": number,
                            "estimated5yrCost": number, "engine": text, "transmission": text,
                            "drivetrain": text, "mpgCity": number, "mpgHighway": number,
                            "keyFeatures": list, "pros": list, "cons": list, "whyRecommended": text
                        },
                        "required": ["make", "model", "year", "price"]
                    }
                }
            },
            "required": ["comparisonType", "explanation", "vehicles"]
        }),
    }
}
