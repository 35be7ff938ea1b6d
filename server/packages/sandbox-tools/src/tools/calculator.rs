use sandbox_tools_error::OrchestratorError;
use schemars::JsonSchema;
use serde::Deserialize;

use super::{ToolCategory, ToolDescriptor};

#[derive(Debug, Clone, Copy, Deserialize, JsonSchema)]
pub struct Operands {
    /// First number
    pub a: f64,
    /// Second number
    pub b: f64,
}

pub fn tools() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor::function("add", "Add two numbers", ToolCategory::Calculator, |ops: Operands| {
            Ok(format_number(ops.a + ops.b))
        }),
        ToolDescriptor::function(
            "subtract",
            "Subtract two numbers",
            ToolCategory::Calculator,
            |ops: Operands| Ok(format_number(ops.a - ops.b)),
        ),
        ToolDescriptor::function(
            "multiply",
            "Multiply two numbers",
            ToolCategory::Calculator,
            |ops: Operands| Ok(format_number(ops.a * ops.b)),
        ),
        ToolDescriptor::function("divide", "Divide two numbers", ToolCategory::Calculator, divide),
    ]
}

fn divide(ops: Operands) -> Result<String, OrchestratorError> {
    if ops.b == 0.0 {
        return Err(OrchestratorError::ToolExecution {
            tool: "divide".to_string(),
            message: "Cannot divide by zero".to_string(),
        });
    }
    Ok(format_number(ops.a / ops.b))
}

/// Integral results keep one decimal place (`4.0`), the way a double prints.
pub fn format_number(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str) -> ToolDescriptor {
        tools()
            .into_iter()
            .find(|tool| tool.name() == name)
            .expect("tool exists")
    }

    #[tokio::test]
    async fn divide_returns_quotient() {
        let out = tool("divide").invoke(json!({ "a": 8, "b": 2 })).await.expect("divide");
        assert_eq!(out, "4.0");
    }

    #[tokio::test]
    async fn divide_by_zero_is_an_error_not_infinity() {
        let err = tool("divide")
            .invoke(json!({ "a": 1, "b": 0 }))
            .await
            .expect_err("zero");
        assert!(err.to_string().contains("Cannot divide by zero"));
    }

    #[tokio::test]
    async fn arithmetic_tools() {
        assert_eq!(tool("add").invoke(json!({ "a": 2, "b": 3 })).await.unwrap(), "5.0");
        assert_eq!(tool("subtract").invoke(json!({ "a": 10, "b": 4 })).await.unwrap(), "6.0");
        assert_eq!(tool("multiply").invoke(json!({ "a": 1.5, "b": 3 })).await.unwrap(), "4.5");
    }

    #[test]
    fn format_number_keeps_fractional_digits() {
        assert_eq!(format_number(2.5), "2.5");
        assert_eq!(format_number(-3.0), "-3.0");
    }
}
