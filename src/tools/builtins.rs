//! The advisor toolset: climate risk, insurance status and record logging.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::tool::ToolHandler;
use crate::error::ToolError;
use crate::farm::{
    ClimateRiskLookup, ExpenseEntry, FarmProfile, FarmRecordLogger, HarvestEntry, InsuranceLookup,
};
use crate::protocol::FunctionDeclaration;

pub const GET_CLIMATE_RISK: &str = "get_climate_risk";
pub const GET_INSURANCE_STATUS: &str = "get_insurance_status";
pub const LOG_HARVEST: &str = "log_harvest";
pub const LOG_EXPENSE: &str = "log_expense";

fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    // Models sometimes send null for "no arguments"
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, ToolError> {
    serde_json::to_value(value).map_err(|e| ToolError::Failed(e.to_string()))
}

// ======================== get_climate_risk ========================

pub struct ClimateRiskTool {
    lookup: Arc<dyn ClimateRiskLookup>,
    location: String,
}

impl ClimateRiskTool {
    const DESCRIPTION: &'static str =
        "Get current climate risk data (drought, NDVI, soil moisture) for the farm.";

    pub fn new(lookup: Arc<dyn ClimateRiskLookup>, location: impl Into<String>) -> Self {
        Self {
            lookup,
            location: location.into(),
        }
    }

    fn schema() -> Value {
        json!({"type": "OBJECT", "properties": {}})
    }
}

#[async_trait]
impl ToolHandler for ClimateRiskTool {
    fn name(&self) -> &str {
        GET_CLIMATE_RISK
    }

    fn description(&self) -> &str {
        Self::DESCRIPTION
    }

    fn input_schema(&self) -> Value {
        Self::schema()
    }

    fn progress_note(&self) -> Option<&str> {
        Some("Checking climate satellites...")
    }

    async fn call(&self, _args: Value) -> Result<Value, ToolError> {
        let snapshot = self.lookup.climate_risk(&self.location).await?;
        to_value(&snapshot)
    }
}

// ======================== get_insurance_status ========================

pub struct InsuranceStatusTool {
    lookup: Arc<dyn InsuranceLookup>,
    farm: FarmProfile,
}

impl InsuranceStatusTool {
    const DESCRIPTION: &'static str =
        "Check insurance policy status, triggers, and payout estimation.";

    pub fn new(lookup: Arc<dyn InsuranceLookup>, farm: FarmProfile) -> Self {
        Self { lookup, farm }
    }

    fn schema() -> Value {
        json!({"type": "OBJECT", "properties": {}})
    }
}

#[async_trait]
impl ToolHandler for InsuranceStatusTool {
    fn name(&self) -> &str {
        GET_INSURANCE_STATUS
    }

    fn description(&self) -> &str {
        Self::DESCRIPTION
    }

    fn input_schema(&self) -> Value {
        Self::schema()
    }

    fn progress_note(&self) -> Option<&str> {
        Some("Checking insurance policy...")
    }

    async fn call(&self, _args: Value) -> Result<Value, ToolError> {
        let policy = self.lookup.insurance_policy(&self.farm).await?;
        to_value(&policy)
    }
}

// ======================== log_harvest / log_expense ========================

pub struct LogHarvestTool {
    logger: Arc<dyn FarmRecordLogger>,
}

impl LogHarvestTool {
    const DESCRIPTION: &'static str = "Log a harvest.";

    pub fn new(logger: Arc<dyn FarmRecordLogger>) -> Self {
        Self { logger }
    }

    fn schema() -> Value {
        json!({
            "type": "OBJECT",
            "properties": {
                "crop": {"type": "STRING"},
                "amount": {"type": "NUMBER"},
                "unit": {"type": "STRING"}
            },
            "required": ["crop", "amount", "unit"]
        })
    }
}

#[async_trait]
impl ToolHandler for LogHarvestTool {
    fn name(&self) -> &str {
        LOG_HARVEST
    }

    fn description(&self) -> &str {
        Self::DESCRIPTION
    }

    fn input_schema(&self) -> Value {
        Self::schema()
    }

    async fn call(&self, args: Value) -> Result<Value, ToolError> {
        let entry: HarvestEntry = parse_args(args)?;
        if entry.amount < 0.0 {
            return Err(ToolError::InvalidArguments("amount must not be negative".into()));
        }
        let ack = self.logger.log_harvest(entry).await?;
        to_value(&ack)
    }
}

pub struct LogExpenseTool {
    logger: Arc<dyn FarmRecordLogger>,
}

impl LogExpenseTool {
    const DESCRIPTION: &'static str = "Log a farm expense.";

    pub fn new(logger: Arc<dyn FarmRecordLogger>) -> Self {
        Self { logger }
    }

    fn schema() -> Value {
        json!({
            "type": "OBJECT",
            "properties": {
                "category": {"type": "STRING"},
                "amount": {"type": "NUMBER"},
                "note": {"type": "STRING"}
            },
            "required": ["category", "amount"]
        })
    }
}

#[async_trait]
impl ToolHandler for LogExpenseTool {
    fn name(&self) -> &str {
        LOG_EXPENSE
    }

    fn description(&self) -> &str {
        Self::DESCRIPTION
    }

    fn input_schema(&self) -> Value {
        Self::schema()
    }

    async fn call(&self, args: Value) -> Result<Value, ToolError> {
        let entry: ExpenseEntry = parse_args(args)?;
        if entry.amount < 0.0 {
            return Err(ToolError::InvalidArguments("amount must not be negative".into()));
        }
        let ack = self.logger.log_expense(entry).await?;
        to_value(&ack)
    }
}

// ======================== Toolset ========================

/// Collaborators behind the advisor toolset.
#[derive(Clone)]
pub struct FarmServices {
    pub climate: Arc<dyn ClimateRiskLookup>,
    pub insurance: Arc<dyn InsuranceLookup>,
    pub records: Arc<dyn FarmRecordLogger>,
}

pub fn advisor_tools(services: &FarmServices, farm: &FarmProfile) -> Vec<Arc<dyn ToolHandler>> {
    vec![
        Arc::new(ClimateRiskTool::new(services.climate.clone(), farm.location.clone())),
        Arc::new(InsuranceStatusTool::new(services.insurance.clone(), farm.clone())),
        Arc::new(LogHarvestTool::new(services.records.clone())),
        Arc::new(LogExpenseTool::new(services.records.clone())),
    ]
}

/// Declarations for the advisor toolset, independent of any collaborator.
/// Same order as [`advisor_tools`].
pub fn advisor_declarations() -> Vec<FunctionDeclaration> {
    let declare = |name: &str, description: &str, parameters: Value| FunctionDeclaration {
        name: name.to_string(),
        description: description.to_string(),
        parameters,
    };
    vec![
        declare(GET_CLIMATE_RISK, ClimateRiskTool::DESCRIPTION, ClimateRiskTool::schema()),
        declare(
            GET_INSURANCE_STATUS,
            InsuranceStatusTool::DESCRIPTION,
            InsuranceStatusTool::schema(),
        ),
        declare(LOG_HARVEST, LogHarvestTool::DESCRIPTION, LogHarvestTool::schema()),
        declare(LOG_EXPENSE, LogExpenseTool::DESCRIPTION, LogExpenseTool::schema()),
    ]
}
