//! Layered configuration.
//!
//! Every setting is looked up through an ordered list of keys: the primary
//! dotted key in the config file, an alternate spelling of that key, and
//! finally an environment variable. The first non-blank value wins.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sandbox_tools_error::OrchestratorError;
use toml_edit::{DocumentMut, Item};

pub const DEFAULT_MODEL: &str = "qwen-max";
pub const DEFAULT_MODEL_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";
pub const DEFAULT_SANDBOX_ENDPOINT: &str = "http://127.0.0.1:8000";
pub const DEFAULT_POOL_SIZE: usize = 5;
pub const DEFAULT_SANDBOX_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_ITERATIONS: usize = 10;

const API_KEY_KEYS: Lookup = Lookup {
    file_keys: &["model.api-key", "model.apiKey"],
    env: "AI_DASHSCOPE_API_KEY",
};
const MODEL_KEYS: Lookup = Lookup {
    file_keys: &["model.name", "model.model"],
    env: "SANDBOX_TOOLS_MODEL",
};
const BASE_URL_KEYS: Lookup = Lookup {
    file_keys: &["model.base-url", "model.baseUrl"],
    env: "SANDBOX_TOOLS_MODEL_BASE_URL",
};
const ENDPOINT_KEYS: Lookup = Lookup {
    file_keys: &["sandbox.endpoint", "sandbox.docker-host"],
    env: "SANDBOX_TOOLS_SANDBOX_ENDPOINT",
};
const POOL_SIZE_KEYS: Lookup = Lookup {
    file_keys: &["sandbox.pool-size", "sandbox.poolSize"],
    env: "SANDBOX_TOOLS_POOL_SIZE",
};
const TIMEOUT_KEYS: Lookup = Lookup {
    file_keys: &["sandbox.timeout-ms"],
    env: "SANDBOX_TOOLS_SANDBOX_TIMEOUT_MS",
};
const MAX_ITERATIONS_KEYS: Lookup = Lookup {
    file_keys: &["agent.max-iterations"],
    env: "SANDBOX_TOOLS_MAX_ITERATIONS",
};

struct Lookup {
    file_keys: &'static [&'static str],
    env: &'static str,
}

/// Raw configuration inputs: an optional parsed config file plus a snapshot
/// of the environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    file: Option<DocumentMut>,
    env: HashMap<String, String>,
}

impl ConfigSources {
    pub fn new(file: Option<DocumentMut>, env: HashMap<String, String>) -> Self {
        Self { file, env }
    }

    /// Reads the config file and the process environment.
    ///
    /// An explicitly requested file must exist; the default location is
    /// optional.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, OrchestratorError> {
        let file = match explicit_path {
            Some(path) => Some(read_document(path)?),
            None => match default_config_path() {
                Some(path) if path.is_file() => Some(read_document(&path)?),
                _ => None,
            },
        };
        Ok(Self::new(file, std::env::vars().collect()))
    }

    pub fn from_toml(contents: &str, env: HashMap<String, String>) -> Result<Self, OrchestratorError> {
        let document = contents
            .parse::<DocumentMut>()
            .map_err(|err| OrchestratorError::Initialization {
                message: format!("invalid config file: {err}"),
            })?;
        Ok(Self::new(Some(document), env))
    }

    fn resolve(&self, lookup: &Lookup) -> Option<String> {
        for key in lookup.file_keys {
            if let Some(value) = self.file_value(key) {
                return Some(value);
            }
        }
        self.env
            .get(lookup.env)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    fn file_value(&self, dotted_key: &str) -> Option<String> {
        let document = self.file.as_ref()?;
        let mut item: &Item = document.as_item();
        for segment in dotted_key.split('.') {
            item = item.get(segment)?;
        }
        let value = item.as_value()?;
        let text = if let Some(text) = value.as_str() {
            text.trim().to_string()
        } else if let Some(number) = value.as_integer() {
            number.to_string()
        } else if let Some(flag) = value.as_bool() {
            flag.to_string()
        } else {
            return None;
        };
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub api_key: Option<String>,
    pub name: String,
    pub base_url: String,
}

impl ModelSettings {
    /// The chat model cannot be constructed without a credential.
    pub fn require_api_key(&self) -> Result<&str, OrchestratorError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| OrchestratorError::Initialization {
                message: "model API key is not configured; set model.api-key (or model.apiKey) \
                          in the config file, or the AI_DASHSCOPE_API_KEY environment variable"
                    .to_string(),
            })
    }
}

#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub endpoint: String,
    pub pool_size: usize,
    pub call_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub model: ModelSettings,
    pub sandbox: SandboxSettings,
    pub max_iterations: usize,
}

impl Settings {
    pub fn resolve(sources: &ConfigSources) -> Result<Self, OrchestratorError> {
        let raw_endpoint = sources
            .resolve(&ENDPOINT_KEYS)
            .unwrap_or_else(|| DEFAULT_SANDBOX_ENDPOINT.to_string());
        let endpoint = normalize_sandbox_endpoint(&raw_endpoint);
        if endpoint != raw_endpoint {
            tracing::warn!(
                from = %raw_endpoint,
                to = %endpoint,
                "normalized sandbox endpoint"
            );
        }

        let pool_size = parse_number(sources, &POOL_SIZE_KEYS)?.unwrap_or(DEFAULT_POOL_SIZE as u64);
        let call_timeout = parse_number(sources, &TIMEOUT_KEYS)?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_SANDBOX_TIMEOUT);
        let max_iterations = parse_number(sources, &MAX_ITERATIONS_KEYS)?
            .unwrap_or(DEFAULT_MAX_ITERATIONS as u64);
        if max_iterations == 0 {
            return Err(OrchestratorError::Initialization {
                message: "agent.max-iterations must be at least 1".to_string(),
            });
        }

        Ok(Self {
            model: ModelSettings {
                api_key: sources.resolve(&API_KEY_KEYS),
                name: sources
                    .resolve(&MODEL_KEYS)
                    .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
                base_url: sources
                    .resolve(&BASE_URL_KEYS)
                    .unwrap_or_else(|| DEFAULT_MODEL_BASE_URL.to_string()),
            },
            sandbox: SandboxSettings {
                endpoint,
                pool_size: pool_size as usize,
                call_timeout,
            },
            max_iterations: max_iterations as usize,
        })
    }
}

fn parse_number(sources: &ConfigSources, lookup: &Lookup) -> Result<Option<u64>, OrchestratorError> {
    let Some(raw) = sources.resolve(lookup) else {
        return Ok(None);
    };
    raw.parse::<u64>()
        .map(Some)
        .map_err(|_| OrchestratorError::Initialization {
            message: format!("{} must be a non-negative integer, got {raw:?}", lookup.file_keys[0]),
        })
}

fn read_document(path: &Path) -> Result<DocumentMut, OrchestratorError> {
    let contents = fs::read_to_string(path).map_err(|err| OrchestratorError::Initialization {
        message: format!("failed to read config file {}: {err}", path.display()),
    })?;
    contents
        .parse::<DocumentMut>()
        .map_err(|err| OrchestratorError::Initialization {
            message: format!("invalid config file {}: {err}", path.display()),
        })
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("sandbox-tools").join("config.toml"))
}

/// `unix://` socket addresses never carry a port; a trailing `:port` is a
/// common copy-paste mistake and is dropped.
pub fn normalize_sandbox_endpoint(host: &str) -> String {
    let trimmed = host.trim();
    if let Some(rest) = trimmed.strip_prefix("unix://") {
        if let Some((path, port)) = rest.rsplit_once(':') {
            if !path.is_empty() && !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) {
                return format!("unix://{path}");
            }
        }
    }
    trimmed.to_string()
}

/// Loggable fingerprint of a credential.
pub fn mask_api_key(key: Option<&str>) -> String {
    let Some(key) = key else {
        return "none".to_string();
    };
    let trimmed = key.trim();
    if trimmed.is_empty() {
        return "empty".to_string();
    }
    let chars: Vec<char> = trimmed.chars().collect();
    let len = chars.len();
    if len <= 8 {
        return format!("len={len}, value=****");
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[len - 4..].iter().collect();
    format!("len={len}, value={head}...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn primary_key_wins_over_alternate_and_env() {
        let sources = ConfigSources::from_toml(
            "[model]\napi-key = \"sk-primary\"\napiKey = \"sk-alternate\"\n",
            env(&[("AI_DASHSCOPE_API_KEY", "sk-env")]),
        )
        .expect("parse");
        let settings = Settings::resolve(&sources).expect("resolve");
        assert_eq!(settings.model.api_key.as_deref(), Some("sk-primary"));
    }

    #[test]
    fn blank_values_fall_through_to_next_source() {
        let sources = ConfigSources::from_toml(
            "[model]\napi-key = \"   \"\napiKey = \"\"\n",
            env(&[("AI_DASHSCOPE_API_KEY", "  sk-env  ")]),
        )
        .expect("parse");
        let settings = Settings::resolve(&sources).expect("resolve");
        assert_eq!(settings.model.api_key.as_deref(), Some("sk-env"));
    }

    #[test]
    fn defaults_apply_without_any_source() {
        let settings = Settings::resolve(&ConfigSources::default()).expect("resolve");
        assert_eq!(settings.model.name, DEFAULT_MODEL);
        assert_eq!(settings.sandbox.endpoint, DEFAULT_SANDBOX_ENDPOINT);
        assert_eq!(settings.sandbox.pool_size, DEFAULT_POOL_SIZE);
        assert_eq!(settings.sandbox.call_timeout, DEFAULT_SANDBOX_TIMEOUT);
        assert_eq!(settings.max_iterations, DEFAULT_MAX_ITERATIONS);
        assert!(settings.model.require_api_key().is_err());
    }

    #[test]
    fn integer_values_are_read_from_file() {
        let sources = ConfigSources::from_toml(
            "[sandbox]\npool-size = 2\ntimeout-ms = 1500\n[agent]\nmax-iterations = 3\n",
            HashMap::new(),
        )
        .expect("parse");
        let settings = Settings::resolve(&sources).expect("resolve");
        assert_eq!(settings.sandbox.pool_size, 2);
        assert_eq!(settings.sandbox.call_timeout, Duration::from_millis(1500));
        assert_eq!(settings.max_iterations, 3);
    }

    #[test]
    fn invalid_numbers_are_initialization_errors() {
        let sources = ConfigSources::new(None, env(&[("SANDBOX_TOOLS_POOL_SIZE", "many")]));
        let err = Settings::resolve(&sources).expect_err("should fail");
        assert!(matches!(err, OrchestratorError::Initialization { .. }));
    }

    #[test]
    fn unix_endpoint_port_is_stripped() {
        assert_eq!(
            normalize_sandbox_endpoint("unix:///var/run/docker.sock:2375"),
            "unix:///var/run/docker.sock"
        );
        assert_eq!(
            normalize_sandbox_endpoint("unix:///var/run/docker.sock"),
            "unix:///var/run/docker.sock"
        );
        assert_eq!(
            normalize_sandbox_endpoint("http://sandbox:8000"),
            "http://sandbox:8000"
        );
    }

    #[test]
    fn api_key_fingerprint_hides_the_middle() {
        assert_eq!(mask_api_key(None), "none");
        assert_eq!(mask_api_key(Some("  ")), "empty");
        assert_eq!(mask_api_key(Some("short")), "len=5, value=****");
        assert_eq!(
            mask_api_key(Some("sk-1234567890abcd")),
            "len=17, value=sk-1...abcd"
        );
    }
}
