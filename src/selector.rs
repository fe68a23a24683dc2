// ============================================================================
// File: src/selector.rs
// Narrowing candidates to exactly three ranked recommendations
// ============================================================================

use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;
use crate::criteria::SearchCriteria;
use crate::error::AdvisorError;
use crate::llm_client::{ChatProvider, ChatRequest};
use crate::models::{Message, Role};
use crate::vehicle::VehicleRecord;

pub const RECOMMENDATION_COUNT: usize = 3;
const EXPLANATION_WORDS: usize = 30;
const FALLBACK_SCORES: [u8; RECOMMENDATION_COUNT] = [90, 85, 80];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonType {
    SameVehicle,
    TrimComparison,
    ModelComparison,
    EvComparison,
}

impl ComparisonType {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_lowercase().replace([' ', '-'], "_").as_str() {
            "same_vehicle" => Some(Self::SameVehicle),
            "trim_comparison" => Some(Self::TrimComparison),
            "model_comparison" => Some(Self::ModelComparison),
            "ev_comparison" => Some(Self::EvComparison),
            _ => None,
        }
    }

    /// Best guess from the vehicles themselves
    pub fn infer(vehicles: &[VehicleRecord]) -> Self {
        let Some(first) = vehicles.first() else {
            return Self::ModelComparison;
        };
        if vehicles.iter().all(|v| v.same_model(first)) {
            if vehicles.iter().all(|v| v.trim.eq_ignore_ascii_case(&first.trim)) {
                return Self::SameVehicle;
            }
            return Self::TrimComparison;
        }
        let electric = |v: &VehicleRecord| {
            let powertrain = format!("{} {}", v.engine, v.drivetrain).to_lowercase();
            powertrain.contains("electric") || powertrain.split_whitespace().any(|w| w == "ev")
        };
        if vehicles.iter().all(electric) {
            return Self::EvComparison;
        }
        Self::ModelComparison
    }
}

/// Comparison type and explanation already decided upstream
#[derive(Debug, Clone, PartialEq)]
pub struct Tagging {
    pub comparison_type: ComparisonType,
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationResult {
    pub comparison_type: ComparisonType,
    pub explanation: String,
    pub vehicles: Vec<VehicleRecord>,
}

/// How the final three were chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    Structured,
    Summarized,
    StaticFallback,
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub result: RecommendationResult,
    pub strategy: SelectionStrategy,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SummaryResponse {
    comparison_type: Option<String>,
    explanation: Option<String>,
    #[serde(default)]
    recommendations: Vec<Pick>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Pick {
    #[serde(alias = "carIndex")]
    index: usize,
    match_score: Option<f64>,
    why_perfect_match: Option<String>,
    budget_fit: Option<String>,
    potential_concerns: Option<String>,
}

pub struct RecommendationSelector {
    chat: Arc<dyn ChatProvider>,
    catalog: Arc<Catalog>,
    max_tokens: usize,
    temperature: f32,
}

impl RecommendationSelector {
    pub fn new(chat: Arc<dyn ChatProvider>, catalog: Arc<Catalog>, max_tokens: usize, temperature: f32) -> Self {
        Self { chat, catalog, max_tokens, temperature }
    }

    pub async fn select(
        &self,
        candidates: Vec<VehicleRecord>,
        tagging: Option<Tagging>,
        criteria: &SearchCriteria,
        conversation: &[Message],
    ) -> Selection {
        if let Some(tagging) = tagging.filter(|_| !candidates.is_empty()) {
            return Selection {
                result: RecommendationResult {
                    comparison_type: tagging.comparison_type,
                    explanation: limit_words(&tagging.explanation, EXPLANATION_WORDS),
                    vehicles: fill_to_three(candidates, &self.catalog),
                },
                strategy: SelectionStrategy::Structured,
            };
        }

        let pool = if candidates.is_empty() {
            self.catalog.entries().iter().map(|e| e.vehicle.clone()).collect()
        } else {
            candidates
        };

        match self.summarize(&pool, criteria, conversation).await {
            Ok(result) => Selection { result, strategy: SelectionStrategy::Summarized },
            Err(e) => {
                tracing::warn!(error = %e, "recommendation summary unusable, using static picks");
                Selection { result: self.static_fallback(), strategy: SelectionStrategy::StaticFallback }
            }
        }
    }

    /// Always structurally valid, independent of every upstream call
    pub fn static_fallback(&self) -> RecommendationResult {
        let vehicles: Vec<VehicleRecord> = self
            .catalog
            .entries()
            .iter()
            .zip(FALLBACK_SCORES)
            .map(|(entry, score)| VehicleRecord {
                rationale: Some(entry.fallback_rationale.clone()),
                match_score: Some(score),
                ..entry.vehicle.clone()
            })
            .collect();
        let vehicles = fill_to_three(vehicles, &self.catalog);

        RecommendationResult {
            comparison_type: ComparisonType::infer(&vehicles),
            explanation: "Three dependable, well-reviewed picks that balance reliability, fuel economy and value.".to_string(),
            vehicles,
        }
    }

    async fn summarize(
        &self,
        pool: &[VehicleRecord],
        criteria: &SearchCriteria,
        conversation: &[Message],
    ) -> Result<RecommendationResult> {
        let prompt = analysis_prompt(pool, criteria, conversation)?;
        let reply = self
            .chat
            .complete(ChatRequest {
                system_prompt: None,
                messages: vec![Message::user(prompt)],
                schema: None,
                max_tokens: self.max_tokens,
                temperature: self.temperature,
            })
            .await
            .map_err(|e| AdvisorError::upstream("chat provider", e))?;

        let text = reply
            .text
            .ok_or_else(|| AdvisorError::MalformedStructuredResponse("summary has no text".into()))?;
        let summary = parse_summary(&text)?;

        let mut picked: Vec<VehicleRecord> = Vec::new();
        let mut used: Vec<usize> = Vec::new();
        for pick in summary.recommendations {
            if used.contains(&pick.index) {
                continue;
            }
            let Some(vehicle) = pool.get(pick.index) else {
                continue;
            };
            used.push(pick.index);
            picked.push(apply_pick(vehicle.clone(), pick));
        }
        if picked.is_empty() {
            return Err(
                AdvisorError::MalformedStructuredResponse("summary picked no valid vehicle".into()).into(),
            );
        }

        let vehicles = fill_to_three(picked, &self.catalog);
        let comparison_type = summary
            .comparison_type
            .as_deref()
            .and_then(ComparisonType::parse)
            .unwrap_or_else(|| ComparisonType::infer(&vehicles));
        let explanation = summary
            .explanation
            .filter(|e| !e.trim().is_empty())
            .unwrap_or_else(|| default_explanation(criteria));

        Ok(RecommendationResult {
            comparison_type,
            explanation: limit_words(&explanation, EXPLANATION_WORDS),
            vehicles,
        })
    }
}

/// Truncates to three, or pads with catalog vehicles not already present.
/// Catalog vehicles are reused only when the catalog runs out.
pub fn fill_to_three(mut vehicles: Vec<VehicleRecord>, catalog: &Catalog) -> Vec<VehicleRecord> {
    vehicles.truncate(RECOMMENDATION_COUNT);

    let padding = |v: &VehicleRecord, rationale: &str| VehicleRecord {
        rationale: v.rationale.clone().or_else(|| Some(rationale.to_string())),
        ..v.clone()
    };

    for entry in catalog.entries() {
        if vehicles.len() >= RECOMMENDATION_COUNT {
            break;
        }
        if !vehicles.iter().any(|v| v.same_model(&entry.vehicle)) {
            vehicles.push(padding(&entry.vehicle, &entry.fallback_rationale));
        }
    }
    for entry in catalog.entries().iter().cycle().take(RECOMMENDATION_COUNT) {
        if vehicles.len() >= RECOMMENDATION_COUNT {
            break;
        }
        vehicles.push(padding(&entry.vehicle, &entry.fallback_rationale));
    }
    vehicles
}

fn apply_pick(mut vehicle: VehicleRecord, pick: Pick) -> VehicleRecord {
    let why = pick.why_perfect_match.filter(|s| !s.trim().is_empty());
    let budget = pick.budget_fit.filter(|s| !s.trim().is_empty());
    vehicle.rationale = match (why, budget) {
        (Some(why), Some(budget)) => Some(format!("{} {}", why, budget)),
        (Some(why), None) => Some(why),
        (None, Some(budget)) => Some(budget),
        (None, None) => vehicle.rationale,
    };
    if let Some(concern) = pick.potential_concerns.filter(|s| !s.trim().is_empty()) {
        if !vehicle.cons.contains(&concern) {
            vehicle.cons.insert(0, concern);
        }
    }
    vehicle.match_score = pick
        .match_score
        .filter(|s| (0.0..=100.0).contains(s))
        .map(|s| s.round() as u8)
        .or(vehicle.match_score);
    vehicle
}

fn analysis_prompt(pool: &[VehicleRecord], criteria: &SearchCriteria, conversation: &[Message]) -> Result<String> {
    let summary = conversation
        .iter()
        .filter(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let cars = serde_json::to_string_pretty(pool)?;

    Ok(format!(
        r#"Based on this conversation about car preferences: "{summary}"

Search criteria: {terms} near {location}{budget}

Available cars: {cars}

Select the 3 best matches and explain why each car fits their needs. For each recommendation, provide:
1. Why this specific car matches their requirements
2. How it fits their stated budget and usage
3. Any potential concerns they should know about

Respond with JSON only, using this structure:
{{
  "comparisonType": "same_vehicle | trim_comparison | model_comparison | ev_comparison",
  "explanation": "One sentence of at most 30 words",
  "recommendations": [
    {{
      "carIndex": 0,
      "matchScore": 95,
      "whyPerfectMatch": "Detailed explanation of why this car fits their needs",
      "budgetFit": "How it fits their budget",
      "potentialConcerns": "Any drawbacks they should consider"
    }}
  ]
}}"#,
        terms = criteria.query_terms.join(", "),
        location = criteria.location,
        budget = criteria.max_price.map(|p| format!(", budget ${}", p)).unwrap_or_default(),
    ))
}

/// Accepts bare JSON or JSON wrapped in prose or code fences
fn parse_summary(text: &str) -> Result<SummaryResponse> {
    let start = text.find('{');
    let end = text.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &text[s..=e],
        _ => return Err(AdvisorError::MalformedStructuredResponse("no JSON object in summary".into()).into()),
    };
    serde_json::from_str(json)
        .map_err(|e| anyhow!(AdvisorError::MalformedStructuredResponse(e.to_string())))
}

pub fn default_explanation(criteria: &SearchCriteria) -> String {
    let budget = criteria.max_price.map(|p| format!(" under ${}", p)).unwrap_or_default();
    format!(
        "The three best matches for a {} near {}{}, ranked by overall fit.",
        criteria.query_terms.join(" "),
        criteria.location,
        budget
    )
}

fn limit_words(text: &str, max_words: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= max_words {
        return words.join(" ");
    }
    format!("{}…", words[..max_words].join(" "))
}
