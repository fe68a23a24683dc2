// ============================================================================
// File: src/vehicle.rs
// Vehicle records and the normalizer that completes them
// ============================================================================

use std::sync::LazyLock;

use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

use crate::config::NormalizerConfig;
use crate::search_client::ListingCandidate;

const DEFAULT_TRIM: &str = "Base";
const DEFAULT_ENGINE: &str = "2.5L 4-Cylinder";
const DEFAULT_TRANSMISSION: &str = "Automatic";
const DEFAULT_DRIVETRAIN: &str = "FWD";
const OWNERSHIP_COST_OFFSET: u32 = 15_000;
const MAX_PLAUSIBLE_PRICE: u32 = 10_000_000;
const MAX_PLAUSIBLE_MPG: u32 = 200;
const LISTING_WORDS: [&str; 8] = ["for", "sale", "near", "under", "used", "new", "certified", "shop"];
const LISTING_SEARCH_URL: &str = "https://www.cars.com/shopping/results/";

static YEAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(19[89]\d|20[0-4]\d)\b").expect("valid year pattern"));

/// A fully populated vehicle, safe to hand to a caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleRecord {
    pub make: String,
    pub model: String,
    pub year: u16,
    pub trim: String,
    pub price: u32,
    pub mileage: u32,
    pub location: String,
    pub dealership: String,
    pub dealership_rating: f32,
    pub reliability_rating: f32,
    pub safety_rating: f32,
    #[serde(rename = "estimated5yrCost")]
    pub estimated_5yr_cost: u32,
    pub engine: String,
    pub transmission: String,
    pub drivetrain: String,
    pub mpg_city: u16,
    pub mpg_highway: u16,
    pub key_features: Vec<String>,
    pub pros: Vec<String>,
    pub cons: Vec<String>,
    pub image_url: String,
    pub listing_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_score: Option<u8>,
}

impl VehicleRecord {
    pub fn label(&self) -> String {
        format!("{} {} {} {}", self.year, self.make, self.model, self.trim)
    }

    pub fn same_model(&self, other: &VehicleRecord) -> bool {
        self.make.eq_ignore_ascii_case(&other.make) && self.model.eq_ignore_ascii_case(&other.model)
    }
}

/// Vehicle data as produced upstream: any field may be missing, numbers may
/// arrive as strings such as "$28,855".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PartialVehicleRecord {
    pub make: Option<String>,
    pub model: Option<String>,
    #[serde(deserialize_with = "lenient_number")]
    pub year: Option<f64>,
    pub trim: Option<String>,
    #[serde(alias = "msrp", deserialize_with = "lenient_number")]
    pub price: Option<f64>,
    #[serde(deserialize_with = "lenient_number")]
    pub mileage: Option<f64>,
    pub location: Option<String>,
    pub dealership: Option<String>,
    #[serde(deserialize_with = "lenient_number")]
    pub dealership_rating: Option<f64>,
    #[serde(deserialize_with = "lenient_number")]
    pub reliability_rating: Option<f64>,
    #[serde(deserialize_with = "lenient_number")]
    pub safety_rating: Option<f64>,
    #[serde(rename = "estimated5yrCost", deserialize_with = "lenient_number")]
    pub estimated_5yr_cost: Option<f64>,
    pub engine: Option<String>,
    pub transmission: Option<String>,
    pub drivetrain: Option<String>,
    #[serde(deserialize_with = "lenient_number")]
    pub mpg_city: Option<f64>,
    #[serde(deserialize_with = "lenient_number")]
    pub mpg_highway: Option<f64>,
    pub key_features: Vec<String>,
    pub pros: Vec<String>,
    pub cons: Vec<String>,
    /// Accepted for schema compatibility, never trusted
    pub image_url: Option<String>,
    /// Accepted for schema compatibility, never trusted
    pub listing_url: Option<String>,
    #[serde(alias = "whyRecommended")]
    pub rationale: Option<String>,
    #[serde(deserialize_with = "lenient_number")]
    pub match_score: Option<f64>,
}

impl From<VehicleRecord> for PartialVehicleRecord {
    fn from(v: VehicleRecord) -> Self {
        Self {
            make: Some(v.make),
            model: Some(v.model),
            year: Some(v.year.into()),
            trim: Some(v.trim),
            price: Some(v.price.into()),
            mileage: Some(v.mileage.into()),
            location: Some(v.location),
            dealership: Some(v.dealership),
            dealership_rating: Some(v.dealership_rating.into()),
            reliability_rating: Some(v.reliability_rating.into()),
            safety_rating: Some(v.safety_rating.into()),
            estimated_5yr_cost: Some(v.estimated_5yr_cost.into()),
            engine: Some(v.engine),
            transmission: Some(v.transmission),
            drivetrain: Some(v.drivetrain),
            mpg_city: Some(v.mpg_city.into()),
            mpg_highway: Some(v.mpg_highway.into()),
            key_features: v.key_features,
            pros: v.pros,
            cons: v.cons,
            image_url: Some(v.image_url),
            listing_url: Some(v.listing_url),
            rationale: v.rationale,
            match_score: v.match_score.map(f64::from),
        }
    }
}

impl PartialVehicleRecord {
    /// Best-effort reading of a search hit: year and price from the text,
    /// make from the first known brand (multi-word brands included), model
    /// from the word after it unless that word is a body style or listing
    /// filler.
    pub fn from_listing(candidate: &ListingCandidate, brands: &[String], vehicle_types: &[String]) -> Self {
        let text = format!("{} {}", candidate.title, candidate.snippet);
        let words: Vec<&str> = candidate
            .title
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric() && c != '-'))
            .filter(|w| !w.is_empty())
            .collect();

        let brand_at = find_brand(&words, brands);
        let make = brand_at.map(|(i, len)| words[i..i + len].join(" "));
        let model = brand_at
            .and_then(|(i, len)| words.get(i + len))
            .filter(|w| !YEAR.is_match(w))
            .filter(|w| {
                !vehicle_types.iter().any(|t| t.eq_ignore_ascii_case(w))
                    && !LISTING_WORDS.iter().any(|l| l.eq_ignore_ascii_case(w))
            })
            .map(|w| w.to_string());

        let year = YEAR
            .captures(&text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok());
        let price = candidate.price_text.as_deref().and_then(parse_amount);

        Self {
            make,
            model,
            year,
            price,
            dealership: Some(candidate.source_name.clone()),
            ..Default::default()
        }
    }
}

/// Position and word length of the earliest brand in `words`, longest brand
/// first when several start at the same word
fn find_brand(words: &[&str], brands: &[String]) -> Option<(usize, usize)> {
    (0..words.len()).find_map(|i| {
        brands
            .iter()
            .map(|b| b.split_whitespace().collect::<Vec<_>>())
            .filter(|parts| {
                !parts.is_empty()
                    && i + parts.len() <= words.len()
                    && parts.iter().zip(&words[i..]).all(|(p, w)| p.eq_ignore_ascii_case(w))
            })
            .map(|parts| parts.len())
            .max()
            .map(|len| (i, len))
    })
}

/// Digits of a money string such as "$28,855" or "28855.00"
pub fn parse_amount(text: &str) -> Option<f64> {
    let cleaned: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .filter(|c| *c != ',')
        .collect();
    cleaned.parse::<f64>().ok().filter(|v| *v > 0.0)
}

fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => parse_amount(&s),
        _ => None,
    })
}

/// Fills every field of upstream vehicle data with either the supplied value
/// or a plausible default. Fields that are already valid are never
/// overwritten, so normalizing a normalized list reproduces it. Image and
/// listing URLs are always recomputed.
pub struct VehicleNormalizer {
    config: NormalizerConfig,
}

impl VehicleNormalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    pub fn normalize<R: Rng + ?Sized>(
        &self,
        raw: Vec<PartialVehicleRecord>,
        location: &str,
        rng: &mut R,
    ) -> Vec<VehicleRecord> {
        let mut out = Vec::with_capacity(raw.len());
        for partial in raw {
            match self.normalize_one(partial, out.len(), location, rng) {
                Some(vehicle) => out.push(vehicle),
                None => tracing::warn!("dropping vehicle without make or model"),
            }
        }
        out
    }

    fn normalize_one<R: Rng + ?Sized>(
        &self,
        p: PartialVehicleRecord,
        index: usize,
        location: &str,
        rng: &mut R,
    ) -> Option<VehicleRecord> {
        let make = non_empty(p.make)?;
        let model = non_empty(p.model)?;

        let year = p
            .year
            .filter(|y| (1980.0..=2100.0).contains(y))
            .map(|y| y.round() as u16)
            .unwrap_or(self.config.default_year);

        let price = positive(p.price)
            .filter(|v| *v <= MAX_PLAUSIBLE_PRICE)
            .unwrap_or_else(|| rng.gen_range(self.config.price_min..=self.config.price_max));

        let estimated_5yr_cost = positive(p.estimated_5yr_cost)
            .filter(|cost| *cost > price)
            .unwrap_or_else(|| {
                price.saturating_add(OWNERSHIP_COST_OFFSET + rng.gen_range(0..=5_000))
            });

        let mileage = p
            .mileage
            .filter(|m| m.is_finite() && *m >= 0.0 && *m < u32::MAX as f64)
            .map(|m| m.round() as u32)
            .unwrap_or_else(|| rng.gen_range(5_000..=60_000));

        let location = non_empty(p.location).unwrap_or_else(|| location.to_string());
        let dealership = non_empty(p.dealership).unwrap_or_else(|| {
            let city = location.split(',').next().unwrap_or(&location).trim();
            format!("{} of {}", make, city)
        });

        let mpg_city = mpg(p.mpg_city).unwrap_or_else(|| rng.gen_range(22..=32));
        let mpg_highway =
            mpg(p.mpg_highway).unwrap_or_else(|| {
                mpg_city.saturating_add(rng.gen_range(6..=10)).min(MAX_PLAUSIBLE_MPG as u16)
            });

        let listing_url = self.listing_url(&make, &model, year);
        let image_url = self.config.image_pool[index % self.config.image_pool.len()].clone();

        Some(VehicleRecord {
            trim: non_empty(p.trim).unwrap_or_else(|| DEFAULT_TRIM.to_string()),
            year,
            price,
            mileage,
            location,
            dealership,
            dealership_rating: rating(p.dealership_rating, rng),
            reliability_rating: rating(p.reliability_rating, rng),
            safety_rating: rating(p.safety_rating, rng),
            estimated_5yr_cost,
            engine: non_empty(p.engine).unwrap_or_else(|| DEFAULT_ENGINE.to_string()),
            transmission: non_empty(p.transmission)
                .unwrap_or_else(|| DEFAULT_TRANSMISSION.to_string()),
            drivetrain: non_empty(p.drivetrain).unwrap_or_else(|| DEFAULT_DRIVETRAIN.to_string()),
            mpg_city,
            mpg_highway,
            key_features: or_default(
                dedupe(p.key_features),
                &["Backup camera", "Bluetooth", "Apple CarPlay / Android Auto", "Adaptive cruise control"],
            ),
            pros: or_default(p.pros, &["Strong value for the price", "Good reliability record"]),
            cons: or_default(p.cons, &["Verify service history before purchase"]),
            image_url,
            listing_url,
            rationale: non_empty(p.rationale),
            match_score: p
                .match_score
                .filter(|s| (0.0..=100.0).contains(s))
                .map(|s| s.round() as u8),
            make,
            model,
        })
    }

    /// Dealer-search link for the vehicle around the configured postal code
    pub fn listing_url(&self, make: &str, model: &str, year: u16) -> String {
        let make_slug = slug(make);
        let params = [
            ("stock_type", "all".to_string()),
            ("makes[]", make_slug.clone()),
            ("models[]", format!("{}-{}", make_slug, slug(model))),
            ("year_min", year.to_string()),
            ("year_max", year.to_string()),
            ("zip", self.config.postal_code.clone()),
        ];
        url::Url::parse_with_params(LISTING_SEARCH_URL, &params)
            .map(String::from)
            .unwrap_or_else(|_| LISTING_SEARCH_URL.to_string())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn positive(value: Option<f64>) -> Option<u32> {
    value
        .filter(|v| v.is_finite() && *v >= 1.0 && *v < u32::MAX as f64)
        .map(|v| v.round() as u32)
}

fn mpg(value: Option<f64>) -> Option<u16> {
    positive(value).filter(|v| *v <= MAX_PLAUSIBLE_MPG).map(|v| v as u16)
}

fn rating<R: Rng + ?Sized>(value: Option<f64>, rng: &mut R) -> f32 {
    match value.filter(|r| (1.0..=5.0).contains(r)) {
        Some(r) => r as f32,
        None => (rng.gen_range(3.5f32..=5.0) * 10.0).round() / 10.0,
    }
}

fn dedupe(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        let item = item.trim().to_string();
        if !item.is_empty() && !out.iter().any(|o| o.eq_ignore_ascii_case(&item)) {
            out.push(item);
        }
    }
    out
}

fn or_default(items: Vec<String>, fallback: &[&str]) -> Vec<String> {
    let items: Vec<String> = items.into_iter().filter(|s| !s.trim().is_empty()).collect();
    if items.is_empty() {
        fallback.iter().map(|s| s.to_string()).collect()
    } else {
        items
    }
}

fn slug(text: &str) -> String {
    text.trim().to_lowercase().split_whitespace().collect::<Vec<_>>().join("_")
}
