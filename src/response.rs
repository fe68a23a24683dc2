// ============================================================================
// File: src/response.rs
// Shapes a recommendation result into the payload returned to callers
// ============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::criteria::SearchCriteria;
use crate::selector::{ComparisonType, RecommendationResult, SelectionStrategy};
use crate::vehicle::VehicleRecord;

/// Diagnostic facts about one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineMeta {
    pub listing_source: &'static str,
    pub candidate_count: usize,
    pub normalized_count: usize,
    pub strategy: SelectionStrategy,
    pub criteria: SearchCriteria,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationPayload {
    pub comparison_type: ComparisonType,
    pub explanation: String,
    pub vehicles: Vec<VehicleRecord>,
    pub meta: PipelineMeta,
    pub generated_at: DateTime<Utc>,
}

pub fn assemble(result: RecommendationResult, meta: PipelineMeta) -> RecommendationPayload {
    RecommendationPayload {
        comparison_type: result.comparison_type,
        explanation: result.explanation,
        vehicles: result.vehicles,
        meta,
        generated_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_assemble_serializes_camel_case() {
        let fixture = RecommendationResult {
            comparison_type: ComparisonType::EvComparison,
            explanation: "Electric picks".to_string(),
            vehicles: Vec::new(),
        };
        let meta = PipelineMeta {
            listing_source: "synthetic",
            candidate_count: 2,
            normalized_count: 0,
            strategy: SelectionStrategy::StaticFallback,
            criteria: SearchCriteria {
                query_terms: vec!["ev".to_string()],
                location: "Ames".to_string(),
                max_price: None,
            },
        };

        let actual = serde_json::to_value(assemble(fixture, meta)).unwrap();

        assert_eq!(actual["comparisonType"], "ev_comparison");
        assert_eq!(actual["meta"]["listingSource"], "synthetic");
        assert_eq!(actual["meta"]["strategy"], "static_fallback");
        assert_eq!(actual["meta"]["criteria"]["queryTerms"][0], "ev");
        assert!(actual["generatedAt"].is_string());
    }
}
