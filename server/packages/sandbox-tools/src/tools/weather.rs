//! Mock weather lookup. Values are random; only the sentence shape is stable.

use schemars::JsonSchema;
use serde::Deserialize;
use uuid::Uuid;

use super::{ToolCategory, ToolDescriptor};

const CONDITIONS: [&str; 4] = ["Sunny", "Cloudy", "Rainy", "Partly Cloudy"];

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct WeatherQuery {
    /// City name
    pub city: String,
}

pub fn tools() -> Vec<ToolDescriptor> {
    vec![ToolDescriptor::function(
        "getWeather",
        "Get weather information for a city",
        ToolCategory::Weather,
        |query: WeatherQuery| Ok(report(&query.city, &random_bytes())),
    )]
}

/// Sixteen random bytes. The random part of a v4 UUID comes from the OS
/// generator, so no separate RNG crate is needed.
fn random_bytes() -> [u8; 16] {
    *Uuid::new_v4().as_bytes()
}

fn report(city: &str, random: &[u8; 16]) -> String {
    let condition = CONDITIONS[random[0] as usize % CONDITIONS.len()];
    let temperature = 15 + random[1] as u32 % 20;
    let humidity = 40 + random[2] as u32 % 40;
    format!(
        "Weather in {}: {condition}, Temperature: {temperature}°C, Humidity: {humidity}%",
        city.trim()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn report_stays_in_range() {
        let text = report("Hangzhou", &[0xff; 16]);
        assert_eq!(
            text,
            "Weather in Hangzhou: Partly Cloudy, Temperature: 30°C, Humidity: 55%"
        );
        let text = report(" Paris ", &[0; 16]);
        assert_eq!(text, "Weather in Paris: Sunny, Temperature: 15°C, Humidity: 40%");
    }

    #[test]
    fn random_bytes_differ_between_calls() {
        assert_ne!(random_bytes(), random_bytes());
    }

    #[tokio::test]
    async fn tool_mentions_requested_city() {
        let tool = tools().remove(0);
        let out = tool.invoke(json!({ "city": "Beijing" })).await.expect("weather");
        assert!(out.starts_with("Weather in Beijing: "));
    }
}
