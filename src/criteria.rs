// ============================================================================
// File: src/criteria.rs
// Search criteria extraction from free-form conversation text
// ============================================================================

use anyhow::Result;
use regex::{Regex, RegexBuilder};
use serde::Serialize;

use crate::config::ExtractionConfig;
use crate::models::Message;

/// What to look for, derived from the whole conversation on every request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchCriteria {
    pub query_terms: Vec<String>,
    pub location: String,
    pub max_price: Option<u32>,
}

impl SearchCriteria {
    /// Query string sent to search engines
    pub fn query(&self) -> String {
        let mut query = format!("{} for sale near {}", self.query_terms.join(" "), self.location);
        if let Some(max) = self.max_price {
            query.push_str(&format!(" under ${}", max));
        }
        query
    }
}

pub struct CriteriaExtractor {
    gazetteer: Vec<String>,
    places: Regex,
    price: Regex,
    terms: Regex,
    vehicle_words: Regex,
    purchase_words: Regex,
    home_region: String,
    default_term: String,
    max_terms: usize,
    location_message_threshold: usize,
    min_messages: usize,
}

impl CriteriaExtractor {
    pub fn new(config: &ExtractionConfig) -> Result<Self> {
        let vocabulary: Vec<String> = config
            .vehicle_types
            .iter()
            .chain(&config.brands)
            .chain(&config.descriptors)
            .cloned()
            .collect();
        let vehicle_words: Vec<String> =
            config.vehicle_types.iter().chain(&config.brands).cloned().collect();

        Ok(Self {
            gazetteer: config.gazetteer.clone(),
            places: alternation(&config.gazetteer)?,
            price: RegexBuilder::new(r"\$\s?(\d{1,3}(?:,\d{3})+|\d+)(?:\s?(k)\b)?")
                .case_insensitive(true)
                .build()?,
            terms: alternation(&vocabulary)?,
            vehicle_words: alternation(&vehicle_words)?,
            purchase_words: alternation(&config.purchase_intent)?,
            home_region: config.home_region.clone(),
            default_term: config.default_term.clone(),
            max_terms: config.max_terms,
            location_message_threshold: config.location_message_threshold,
            min_messages: config.min_messages,
        })
    }

    pub fn extract(&self, messages: &[Message]) -> SearchCriteria {
        let text = joined(messages);

        let location = self.find_location(&text).unwrap_or_else(|| self.home_region.clone());
        let max_price = self.find_price(&text);

        let mut query_terms: Vec<String> = Vec::new();
        for m in self.terms.find_iter(&text) {
            let term = m.as_str().to_lowercase();
            if !query_terms.contains(&term) {
                query_terms.push(term);
                if query_terms.len() >= self.max_terms {
                    break;
                }
            }
        }
        if query_terms.is_empty() {
            query_terms.push(self.default_term.clone());
        }

        SearchCriteria { query_terms, location, max_price }
    }

    /// Whether the conversation carries enough detail to run a search
    pub fn is_ready(&self, messages: &[Message]) -> bool {
        let text = joined(messages);
        let count = messages.len();

        let has_location = self.places.is_match(&text);
        let has_vehicle = self.vehicle_words.is_match(&text);
        let has_intent = self.purchase_words.is_match(&text) || self.price.is_match(&text);

        (has_location || count > self.location_message_threshold)
            && has_vehicle
            && has_intent
            && count > self.min_messages
    }

    fn find_location(&self, text: &str) -> Option<String> {
        let found = self.places.find(text)?.as_str();
        self.gazetteer
            .iter()
            .find(|place| place.eq_ignore_ascii_case(found))
            .cloned()
            .or_else(|| Some(found.to_string()))
    }

    fn find_price(&self, text: &str) -> Option<u32> {
        let caps = self.price.captures(text)?;
        let digits = caps.get(1)?.as_str().replace(',', "");
        let mut value: u32 = digits.parse().ok()?;
        if caps.get(2).is_some() {
            value = value.checked_mul(1000)?;
        }
        (value > 0).then_some(value)
    }
}

fn joined(messages: &[Message]) -> String {
    messages.iter().map(|m| m.content.as_str()).collect::<Vec<_>>().join("\n")
}

/// Case-insensitive alternation over `terms`, longest first so that
/// "West Des Moines" wins over "Des Moines" at the same position. Word
/// boundaries are only applied next to alphanumeric ends, which keeps
/// symbols such as "$" matchable.
fn alternation(terms: &[String]) -> Result<Regex> {
    let mut sorted: Vec<&String> = terms.iter().filter(|t| !t.trim().is_empty()).collect();
    if sorted.is_empty() {
        return Ok(Regex::new(r"[^\s\S]")?);
    }
    sorted.sort_by_key(|t| std::cmp::Reverse(t.len()));

    let branches: Vec<String> = sorted
        .iter()
        .map(|term| {
            let term = term.trim();
            let starts_word = term.chars().next().is_some_and(char::is_alphanumeric);
            let ends_word = term.chars().last().is_some_and(char::is_alphanumeric);
            format!(
                "{}{}{}",
                if starts_word { r"\b" } else { "" },
                regex::escape(term),
                if ends_word { r"\b" } else { "" }
            )
        })
        .collect();

    Ok(RegexBuilder::new(&format!("(?:{})", branches.join("|")))
        .case_insensitive(true)
        .build()?)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn extractor() -> CriteriaExtractor {
        CriteriaExtractor::new(&ExtractionConfig::default()).unwrap()
    }

    #[test]
    fn test_extracts_location_price_and_terms() {
        let fixture = vec![Message::user(
            "Looking for a reliable SUV in Des Moines under $35,000",
        )];

        let actual = extractor().extract(&fixture);

        let expected = SearchCriteria {
            query_terms: vec!["reliable".to_string(), "suv".to_string()],
            location: "Des Moines".to_string(),
            max_price: Some(35_000),
        };
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_longest_place_name_wins() {
        let fixture = vec![Message::user("I live in west des moines and want a sedan")];

        let actual = extractor().extract(&fixture);

        assert_eq!(actual.location, "West Des Moines");
    }

    #[test]
    fn test_defaults_without_matches() {
        let fixture = vec![Message::user("hello there"), Message::assistant("Hi! How can I help?")];

        let actual = extractor().extract(&fixture);

        let expected = SearchCriteria {
            query_terms: vec!["reliable car".to_string()],
            location: "Des Moines, IA".to_string(),
            max_price: None,
        };
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_terms_are_deduplicated_and_capped() {
        let fixture = vec![
            Message::user("A Honda sedan, maybe a HONDA hybrid"),
            Message::user("or a Toyota truck"),
        ];

        let actual = extractor().extract(&fixture).query_terms;

        assert_eq!(actual, vec!["honda", "sedan", "hybrid"]);
    }

    #[test]
    fn test_first_price_wins_and_k_suffix() {
        let fixture = vec![Message::user("budget is $30k, absolutely not over $45,000")];

        let actual = extractor().extract(&fixture).max_price;

        assert_eq!(actual, Some(30_000));
    }

    #[test]
    fn test_zero_price_is_ignored() {
        let fixture = vec![Message::user("I have $0 down")];

        let actual = extractor().extract(&fixture).max_price;

        assert_eq!(actual, None);
    }

    #[test]
    fn test_query_string() {
        let fixture = SearchCriteria {
            query_terms: vec!["honda".to_string(), "sedan".to_string()],
            location: "Ames".to_string(),
            max_price: Some(25_000),
        };

        let actual = fixture.query();

        assert_eq!(actual, "honda sedan for sale near Ames under $25000");
    }

    #[test]
    fn test_not_ready_on_short_conversation() {
        let fixture = vec![Message::user("I want an SUV in Ames under $30,000")];

        let actual = extractor().is_ready(&fixture);

        assert!(!actual);
    }

    #[test]
    fn test_ready_with_location_vehicle_and_budget() {
        let fixture = vec![
            Message::user("Hi, I need a new car"),
            Message::assistant("Happy to help. What kind of vehicle?"),
            Message::user("A sedan, I live in Ankeny and my budget is $28,000"),
        ];

        let actual = extractor().is_ready(&fixture);

        assert!(actual);
    }

    #[test]
    fn test_ready_without_location_needs_longer_conversation() {
        let short = vec![
            Message::user("I want to buy a truck"),
            Message::assistant("Sure"),
            Message::user("Something cheap"),
        ];
        let long = [
            short.clone(),
            vec![Message::assistant("Anything else?"), Message::user("No")],
        ]
        .concat();

        assert!(!extractor().is_ready(&short));
        assert!(extractor().is_ready(&long));
    }

    #[test]
    fn test_not_ready_without_vehicle_type() {
        let fixture = vec![
            Message::user("I live in Ames"),
            Message::assistant("Great"),
            Message::user("I can spend $20,000"),
        ];

        let actual = extractor().is_ready(&fixture);

        assert!(!actual);
    }
}
