// ============================================================================
// File: src/catalog.rs
// Built-in reference vehicles and the catalog listing source
// ============================================================================

use anyhow::Result;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::criteria::SearchCriteria;
use crate::search_client::{ListingCandidate, ListingSource};
use crate::vehicle::{PartialVehicleRecord, VehicleNormalizer, VehicleRecord};

/// A catalog vehicle with the words it answers to and the rationale used
/// when every upstream step has failed.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub vehicle: VehicleRecord,
    pub tags: Vec<String>,
    pub fallback_rationale: String,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
}

impl Catalog {
    /// The reference vehicles, completed by `normalizer` so they carry the
    /// same image and listing URLs as any other result.
    pub fn builtin(normalizer: &VehicleNormalizer, location: &str) -> Self {
        let (partials, meta): (Vec<PartialVehicleRecord>, Vec<(Vec<String>, String)>) =
            reference_vehicles().into_iter().unzip();
        // Every field is supplied, the generator is never consulted
        let mut rng = StdRng::seed_from_u64(0);
        let vehicles = normalizer.normalize(partials, location, &mut rng);

        let entries = vehicles
            .into_iter()
            .zip(meta)
            .map(|(vehicle, (tags, fallback_rationale))| CatalogEntry {
                vehicle,
                tags,
                fallback_rationale,
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn brands(&self) -> Vec<String> {
        let mut brands: Vec<String> = Vec::new();
        for entry in &self.entries {
            if !brands.contains(&entry.vehicle.make) {
                brands.push(entry.vehicle.make.clone());
            }
        }
        brands
    }

    /// Entries matching any query term and within the budget
    pub fn matching(&self, criteria: &SearchCriteria) -> Vec<&CatalogEntry> {
        self.entries
            .iter()
            .filter(|e| criteria.max_price.is_none_or(|max| e.vehicle.price <= max))
            .filter(|e| {
                criteria.query_terms.iter().any(|term| {
                    e.vehicle.make.eq_ignore_ascii_case(term)
                        || e.tags.iter().any(|t| t.eq_ignore_ascii_case(term))
                })
            })
            .collect()
    }
}

#[async_trait]
impl ListingSource for Catalog {
    fn name(&self) -> &'static str {
        "catalog"
    }

    async fn search(&self, criteria: &SearchCriteria) -> Result<Vec<ListingCandidate>> {
        Ok(self
            .matching(criteria)
            .into_iter()
            .map(|e| ListingCandidate {
                title: e.vehicle.label(),
                source_name: e.vehicle.dealership.clone(),
                url: Some(e.vehicle.listing_url.clone()),
                price_text: Some(format!("${}", e.vehicle.price)),
                snippet: e.vehicle.rationale.clone().unwrap_or_default(),
            })
            .collect())
    }
}

fn reference_vehicles() -> Vec<(PartialVehicleRecord, (Vec<String>, String))> {
    vec![
        (
            reference(
                ("Toyota", "Camry Hybrid", "LE"),
                28_855,
                ("Toyota of Des Moines", 4.3),
                (4.9, 5.0),
                ("2.5L 4-Cylinder Hybrid", "eCVT", "FWD"),
                (51, 53),
                &["Toyota Safety Sense 2.0", "8-inch touchscreen", "Hybrid powertrain", "LED headlights"],
                &["Excellent fuel economy", "Toyota reliability", "Strong resale value", "Spacious interior"],
                &["CVT transmission feel", "Road noise on highway", "Rear seat could be more comfortable"],
                "Perfect blend of reliability, fuel efficiency, and value. Ideal for daily commuting with excellent resale value.",
            ),
            (
                tags(&["sedan", "hybrid", "reliable", "fuel efficient", "affordable", "family"]),
                "Great all-around choice for reliability and fuel economy".to_string(),
            ),
        ),
        (
            reference(
                ("Honda", "Accord", "Sport"),
                27_295,
                ("Carousel Honda", 4.5),
                (4.8, 5.0),
                ("1.5L Turbo 4-Cylinder", "CVT", "FWD"),
                (32, 42),
                &["Honda Sensing", "Wireless CarPlay", "Sport suspension", "Turbocharged engine", "Premium audio"],
                &["Sporty handling", "Spacious interior", "Strong acceleration", "Excellent build quality"],
                &["Premium fuel recommended", "Firm suspension", "Infotainment can be slow"],
                "Sporty yet practical with outstanding build quality. Great for those who want driving enjoyment with reliability.",
            ),
            (
                tags(&["sedan", "sporty", "reliable", "family"]),
                "Sporty and reliable with excellent build quality".to_string(),
            ),
        ),
        (
            reference(
                ("Mazda", "6", "Touring"),
                26_700,
                ("Carousel Mazda", 4.2),
                (4.4, 5.0),
                ("2.5L 4-Cylinder", "6-Speed Automatic", "FWD"),
                (26, 35),
                &["Premium interior", "Bose audio", "i-ACTIVSENSE safety", "Leather seats", "Heated seats"],
                &["Premium interior quality", "Excellent driving dynamics", "Beautiful design", "Quiet cabin"],
                &["Smaller rear seat", "Less cargo space", "Infotainment learning curve"],
                "Most premium feel in this price range with exceptional interior quality and driving dynamics.",
            ),
            (
                tags(&["sedan", "luxury", "sporty", "affordable"]),
                "Premium features and excellent driving experience".to_string(),
            ),
        ),
    ]
}

#[allow(clippy::too_many_arguments)]
fn reference(
    (make, model, trim): (&str, &str, &str),
    msrp: u32,
    (dealership, dealer_rating): (&str, f64),
    (reliability, safety): (f64, f64),
    (engine, transmission, drivetrain): (&str, &str, &str),
    (mpg_city, mpg_highway): (u16, u16),
    features: &[&str],
    pros: &[&str],
    cons: &[&str],
    why: &str,
) -> PartialVehicleRecord {
    PartialVehicleRecord {
        make: Some(make.to_string()),
        model: Some(model.to_string()),
        year: Some(2024.0),
        trim: Some(trim.to_string()),
        price: Some(msrp.into()),
        mileage: Some(0.0),
        location: None,
        dealership: Some(dealership.to_string()),
        dealership_rating: Some(dealer_rating),
        reliability_rating: Some(reliability),
        safety_rating: Some(safety),
        estimated_5yr_cost: Some(f64::from(msrp) + 17_500.0),
        engine: Some(engine.to_string()),
        transmission: Some(transmission.to_string()),
        drivetrain: Some(drivetrain.to_string()),
        mpg_city: Some(mpg_city.into()),
        mpg_highway: Some(mpg_highway.into()),
        key_features: tags(features),
        pros: tags(pros),
        cons: tags(cons),
        image_url: None,
        listing_url: None,
        rationale: Some(why.to_string()),
        match_score: None,
    }
}

fn tags(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
