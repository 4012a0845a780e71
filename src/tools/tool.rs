use async_trait::async_trait;
use serde_json::Value;

use crate::error::ToolError;
use crate::protocol::FunctionDeclaration;

/// A function the model can call during a session.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> Value;

    /// Transcript line shown while the tool runs, e.g. "Checking insurance policy...".
    fn progress_note(&self) -> Option<&str> {
        None
    }

    async fn call(&self, args: Value) -> Result<Value, ToolError>;

    fn declaration(&self) -> FunctionDeclaration {
        FunctionDeclaration {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.input_schema(),
        }
    }
}
