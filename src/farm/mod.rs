//! farm - Collaborators the advisor tools talk to.
//!
//! Climate risk and insurance lookups (HTTP, cached per day, offline fallback)
//! and the farm record journal.

pub mod cache;
pub mod http;
pub mod journal;

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ToolError;

pub use cache::DailyCache;
pub use http::{HttpClimateService, HttpInsuranceService};
pub use journal::JsonlRecordLogger;

/// Who the farm belongs to and what it grows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FarmProfile {
    pub farmer_name: String,
    pub location: String,
    pub crops: Vec<String>,
    pub total_revenue: f64,
    pub total_expenses: f64,
}

// ======================== Climate risk ========================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClimateRiskSnapshot {
    pub score: f64,
    pub level: String,
    pub trend: String,
    pub factors: RiskFactors,
    #[serde(default)]
    pub forecast: Vec<ForecastDay>,
    #[serde(default)]
    pub recommendations: Vec<Recommendation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFactors {
    pub drought: DroughtFactor,
    pub vegetation: VegetationFactor,
    pub soil: SoilFactor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DroughtFactor {
    pub score: f64,
    pub rainfall_deficit: f64,
    pub days_since_rain: f64,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VegetationFactor {
    pub score: f64,
    pub ndvi_drop: f64,
    pub stress_level: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoilFactor {
    pub score: f64,
    pub moisture: f64,
    pub wilting_days: f64,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastDay {
    pub day: String,
    pub temp: f64,
    pub rain_prob: f64,
    pub condition: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: String,
    pub priority: String,
    pub action: String,
    pub reason: String,
    pub impact: String,
}

// ======================== Insurance ========================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsurancePolicySnapshot {
    pub id: String,
    pub status: String,
    pub coverage_amount: f64,
    pub premium: f64,
    pub days_remaining: f64,
    pub crop: String,
    pub provider: String,
    #[serde(default)]
    pub triggers: Vec<PolicyTrigger>,
    pub payout_estimation: f64,
    #[serde(default)]
    pub claims_history: Vec<Claim>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyTrigger {
    #[serde(rename = "type")]
    pub trigger_type: String,
    pub current_value: String,
    pub threshold: String,
    pub status: String,
    pub progress: f64,
    pub trend: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub date: String,
    pub trigger: String,
    pub amount: f64,
    pub status: String,
}

// ======================== Records ========================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestEntry {
    pub crop: String,
    pub amount: f64,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpenseEntry {
    pub category: String,
    pub amount: f64,
    #[serde(default)]
    pub note: Option<String>,
}

/// Confirmation that a record was stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordAck {
    pub status: String,
    pub record_id: String,
    pub logged_at: DateTime<Utc>,
}

// ======================== Contracts ========================

#[async_trait]
pub trait ClimateRiskLookup: Send + Sync {
    async fn climate_risk(&self, location: &str) -> Result<ClimateRiskSnapshot, ToolError>;
}

#[async_trait]
pub trait InsuranceLookup: Send + Sync {
    async fn insurance_policy(&self, farm: &FarmProfile)
    -> Result<InsurancePolicySnapshot, ToolError>;
}

#[async_trait]
pub trait FarmRecordLogger: Send + Sync {
    async fn log_harvest(&self, entry: HarvestEntry) -> Result<RecordAck, ToolError>;
    async fn log_expense(&self, entry: ExpenseEntry) -> Result<RecordAck, ToolError>;
}

// ======================== Offline snapshots ========================

/// Neutral assessment served when the climate service is unreachable.
pub fn offline_climate_snapshot(today: NaiveDate) -> ClimateRiskSnapshot {
    let forecast = (0..7u64)
        .map(|i| ForecastDay {
            day: today
                .checked_add_days(Days::new(i))
                .unwrap_or(today)
                .format("%a")
                .to_string(),
            temp: 24.0 + (i % 4) as f64,
            rain_prob: (i * 4) as f64,
            condition: "Partly Cloudy".to_string(),
        })
        .collect();

    ClimateRiskSnapshot {
        score: 35.0,
        level: "LOW".to_string(),
        trend: "stable".to_string(),
        factors: RiskFactors {
            drought: DroughtFactor {
                score: 20.0,
                rainfall_deficit: 10.0,
                days_since_rain: 3.0,
                label: "Normal".to_string(),
            },
            vegetation: VegetationFactor {
                score: 15.0,
                ndvi_drop: 5.0,
                stress_level: "Healthy".to_string(),
                label: "Good Vigor".to_string(),
            },
            soil: SoilFactor {
                score: 30.0,
                moisture: 60.0,
                wilting_days: 10.0,
                label: "Adequate".to_string(),
            },
        },
        forecast,
        recommendations: vec![Recommendation {
            id: "offline-1".to_string(),
            priority: "LOW".to_string(),
            action: "Monitor normally".to_string(),
            reason: "Climate service offline, showing baseline values.".to_string(),
            impact: "Maintenance".to_string(),
        }],
    }
}

/// Policy served when the insurance service is unreachable.
pub fn offline_insurance_snapshot(farm: &FarmProfile) -> InsurancePolicySnapshot {
    InsurancePolicySnapshot {
        id: "POL-OFFLINE-MODE".to_string(),
        status: "ACTIVE".to_string(),
        coverage_amount: 50_000.0,
        premium: 5_000.0,
        days_remaining: 120.0,
        crop: farm
            .crops
            .first()
            .cloned()
            .unwrap_or_else(|| "Maize".to_string()),
        provider: "LIMA Shelter".to_string(),
        triggers: vec![
            PolicyTrigger {
                trigger_type: "Rainfall".to_string(),
                current_value: "80mm".to_string(),
                threshold: "50mm".to_string(),
                status: "SAFE".to_string(),
                progress: 20.0,
                trend: "stable".to_string(),
            },
            PolicyTrigger {
                trigger_type: "Vegetation Health".to_string(),
                current_value: "0.6".to_string(),
                threshold: "0.3".to_string(),
                status: "SAFE".to_string(),
                progress: 10.0,
                trend: "stable".to_string(),
            },
        ],
        payout_estimation: 0.0,
        claims_history: Vec::new(),
    }
}
