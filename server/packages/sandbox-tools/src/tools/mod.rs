//! Tool descriptors and the per-invocation registry.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use sandbox_tools_error::OrchestratorError;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::llm::ToolSpec;

pub mod builder;
pub mod calculator;
pub mod sandbox;
pub mod weather;

pub use builder::{BuiltRegistry, ToolRegistryBuilder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Calculator,
    Weather,
    Sandbox,
    Browser,
}

/// Where a tool runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolOrigin {
    InProcess,
    SandboxBacked,
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Value) -> Result<String, OrchestratorError>;
}

/// A named, schema-described callable. Immutable once built.
#[derive(Clone)]
pub struct ToolDescriptor {
    name: String,
    description: String,
    category: ToolCategory,
    origin: ToolOrigin,
    input_schema: Value,
    handler: Arc<dyn ToolHandler>,
}

impl fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("origin", &self.origin)
            .finish()
    }
}

struct FunctionHandler<I, F> {
    name: String,
    func: F,
    _input: std::marker::PhantomData<fn(I)>,
}

#[async_trait]
impl<I, F> ToolHandler for FunctionHandler<I, F>
where
    I: DeserializeOwned + Send + 'static,
    F: Fn(I) -> Result<String, OrchestratorError> + Send + Sync + 'static,
{
    async fn call(&self, arguments: Value) -> Result<String, OrchestratorError> {
        let input = parse_arguments::<I>(&self.name, arguments)?;
        (self.func)(input)
    }
}

/// Decodes tool arguments, reporting failures against the tool.
pub(crate) fn parse_arguments<I: DeserializeOwned>(
    tool: &str,
    arguments: Value,
) -> Result<I, OrchestratorError> {
    serde_json::from_value(arguments).map_err(|err| OrchestratorError::ToolExecution {
        tool: tool.to_string(),
        message: format!("invalid arguments: {err}"),
    })
}

pub(crate) fn schema_of<I: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(I)).unwrap_or_else(|_| {
        serde_json::json!({ "type": "object" })
    })
}

impl ToolDescriptor {
    /// In-process tool backed by a pure function over a typed input.
    pub fn function<I, F>(
        name: &str,
        description: &str,
        category: ToolCategory,
        func: F,
    ) -> Self
    where
        I: DeserializeOwned + JsonSchema + Send + 'static,
        F: Fn(I) -> Result<String, OrchestratorError> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            category,
            origin: ToolOrigin::InProcess,
            input_schema: schema_of::<I>(),
            handler: Arc::new(FunctionHandler {
                name: name.to_string(),
                func,
                _input: std::marker::PhantomData,
            }),
        }
    }

    pub fn sandbox_backed(
        name: &str,
        description: &str,
        category: ToolCategory,
        input_schema: Value,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            category,
            origin: ToolOrigin::SandboxBacked,
            input_schema,
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn category(&self) -> ToolCategory {
        self.category
    }

    pub fn origin(&self) -> ToolOrigin {
        self.origin
    }

    pub fn input_schema(&self) -> &Value {
        &self.input_schema
    }

    pub async fn invoke(&self, arguments: Value) -> Result<String, OrchestratorError> {
        self.handler.call(arguments).await
    }

    pub fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.input_schema.clone(),
        }
    }

    pub fn info(&self) -> ToolInfo {
        ToolInfo {
            name: self.name.clone(),
            description: self.description.clone(),
            category: self.category,
        }
    }
}

/// Catalogue entry as listed by `GET /api/chat/tools`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub category: ToolCategory,
}

/// Ordered, uniquely named tool set. Insertion order is the order presented
/// to the model.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<ToolDescriptor>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: ToolDescriptor) -> Result<(), OrchestratorError> {
        if self.get(tool.name()).is_some() {
            return Err(OrchestratorError::DuplicateTool {
                name: tool.name().to_string(),
            });
        }
        self.tools.push(tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|tool| tool.name() == name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(ToolDescriptor::name).collect()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(ToolDescriptor::spec).collect()
    }
}

/// Every tool the service can offer, whether or not sandboxes are up.
pub fn catalogue() -> Vec<ToolInfo> {
    calculator::tools()
        .into_iter()
        .chain(weather::tools())
        .map(|tool| tool.info())
        .chain(sandbox::CATALOGUE.iter().map(|entry| ToolInfo {
            name: entry.name.to_string(),
            description: entry.description.to_string(),
            category: entry.category,
        }))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Deserialize, JsonSchema)]
    struct Echo {
        text: String,
    }

    fn echo(name: &str) -> ToolDescriptor {
        ToolDescriptor::function(name, "Echo text", ToolCategory::Calculator, |input: Echo| {
            Ok(input.text)
        })
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(echo("echo")).expect("first");
        let err = registry.register(echo("echo")).expect_err("duplicate");
        assert_eq!(
            err,
            OrchestratorError::DuplicateTool {
                name: "echo".to_string()
            }
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn specs_follow_insertion_order() {
        let mut registry = ToolRegistry::new();
        registry.register(echo("b")).expect("b");
        registry.register(echo("a")).expect("a");
        assert_eq!(registry.names(), vec!["b", "a"]);
        let specs = registry.specs();
        assert_eq!(specs[0].name, "b");
        assert_eq!(specs[0].parameters["properties"]["text"]["type"], "string");
    }

    #[tokio::test]
    async fn function_tools_reject_mistyped_arguments() {
        let tool = echo("echo");
        assert_eq!(tool.invoke(json!({ "text": "hi" })).await.expect("ok"), "hi");
        let err = tool.invoke(json!({ "text": 5 })).await.expect_err("bad input");
        assert!(matches!(err, OrchestratorError::ToolExecution { tool, .. } if tool == "echo"));
    }

    #[test]
    fn catalogue_lists_every_family() {
        let names: Vec<String> = catalogue().into_iter().map(|tool| tool.name).collect();
        assert_eq!(
            names,
            vec![
                "add",
                "subtract",
                "multiply",
                "divide",
                "getWeather",
                "runPythonCode",
                "runShellCommand",
                "browserNavigate",
                "browserSnapshot",
            ]
        );
    }
}
