use std::fs;

use sandbox_tools::config::{ConfigSources, Settings, DEFAULT_MODEL};
use sandbox_tools_error::OrchestratorError;
use serial_test::serial;
use tempfile::TempDir;

struct EnvVarGuard {
    key: &'static str,
    previous: Option<String>,
}

impl EnvVarGuard {
    fn set(key: &'static str, value: &str) -> Self {
        let previous = std::env::var(key).ok();
        std::env::set_var(key, value);
        Self { key, previous }
    }

    fn unset(key: &'static str) -> Self {
        let previous = std::env::var(key).ok();
        std::env::remove_var(key);
        Self { key, previous }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        match &self.previous {
            Some(value) => std::env::set_var(self.key, value),
            None => std::env::remove_var(self.key),
        }
    }
}

fn write_config(dir: &TempDir, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join("config.toml");
    fs::write(&path, contents).expect("write config");
    path
}

#[test]
#[serial]
fn blank_file_key_falls_back_to_environment() {
    let _key = EnvVarGuard::set("AI_DASHSCOPE_API_KEY", "sk-from-env");
    let _model = EnvVarGuard::unset("SANDBOX_TOOLS_MODEL");
    let dir = TempDir::new().expect("tempdir");
    let path = write_config(&dir, "[model]\napi-key = \"  \"\n");

    let sources = ConfigSources::load(Some(&path)).expect("load");
    let settings = Settings::resolve(&sources).expect("resolve");
    assert_eq!(settings.model.api_key.as_deref(), Some("sk-from-env"));
    assert_eq!(settings.model.name, DEFAULT_MODEL);
}

#[test]
#[serial]
fn file_value_beats_environment() {
    let _key = EnvVarGuard::set("AI_DASHSCOPE_API_KEY", "sk-from-env");
    let _pool = EnvVarGuard::set("SANDBOX_TOOLS_POOL_SIZE", "9");
    let dir = TempDir::new().expect("tempdir");
    let path = write_config(
        &dir,
        "[model]\napiKey = \"sk-from-file\"\n\n[sandbox]\npool-size = 2\n",
    );

    let settings =
        Settings::resolve(&ConfigSources::load(Some(&path)).expect("load")).expect("resolve");
    assert_eq!(settings.model.api_key.as_deref(), Some("sk-from-file"));
    assert_eq!(settings.sandbox.pool_size, 2);
}

#[test]
#[serial]
fn missing_key_everywhere_is_reported_on_use() {
    let _key = EnvVarGuard::unset("AI_DASHSCOPE_API_KEY");
    let dir = TempDir::new().expect("tempdir");
    let path = write_config(&dir, "[sandbox]\nendpoint = \"http://10.0.0.5:8000\"\n");

    let settings =
        Settings::resolve(&ConfigSources::load(Some(&path)).expect("load")).expect("resolve");
    assert_eq!(settings.sandbox.endpoint, "http://10.0.0.5:8000");
    let err = settings.model.require_api_key().expect_err("no key");
    assert!(matches!(err, OrchestratorError::Initialization { .. }));
}

#[test]
fn explicit_missing_file_is_an_error() {
    let dir = TempDir::new().expect("tempdir");
    let err = ConfigSources::load(Some(&dir.path().join("absent.toml"))).expect_err("missing");
    assert!(matches!(err, OrchestratorError::Initialization { .. }));
}
