use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use axum::http::{HeaderName, HeaderValue, Method};
use clap::{Args, Parser, Subcommand};
use reqwest::blocking::Client as HttpClient;
use sandbox_tools_error::OrchestratorError;
use serde_json::Value;
use thiserror::Error;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{mask_api_key, ConfigSources, Settings};
use crate::llm::{ChatModel, OpenAiChatModel, ScriptedChatModel};
use crate::router::{build_router_with_state, AppState, AuthConfig};
use crate::sandbox::{
    HttpSandboxRuntime, InMemorySandboxRuntime, SandboxManager, SandboxManagerConfig,
    SandboxRuntime,
};
use crate::service::{ChatRequest, ChatResponse, ChatService};
use crate::tools;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;

#[derive(Parser, Debug)]
#[command(name = "sandbox-tools", bin_name = "sandbox-tools")]
#[command(about = "Chat agent with in-process and sandboxed tools", version)]
#[command(arg_required_else_help = true)]
pub struct SandboxToolsCli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, short = 't', global = true)]
    token: Option<String>,

    #[arg(long, short = 'n', global = true)]
    no_token: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat HTTP server.
    Server(ServerArgs),
    /// Print the tool catalogue as JSON.
    Tools,
    /// Send one message to a running server.
    Chat(ChatArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Config file; defaults to <config dir>/sandbox-tools/config.toml when present.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Use the scripted model and the in-memory sandbox runtime.
    #[arg(long)]
    offline: bool,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    cors_allow_header: Vec<String>,

    #[arg(long = "cors-allow-credentials", short = 'C')]
    cors_allow_credentials: bool,
}

#[derive(Args, Debug)]
pub struct ChatArgs {
    #[arg(long, short = 'm')]
    message: String,

    #[arg(long, short = 's')]
    session_id: Option<String>,

    #[arg(long, short = 'u')]
    user_id: Option<String>,

    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    #[arg(long, short = 'e')]
    endpoint: Option<String>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
    #[error("unexpected http status: {0}")]
    HttpStatus(reqwest::StatusCode),
}

pub struct CliConfig {
    pub token: Option<String>,
    pub no_token: bool,
}

pub fn run_sandbox_tools() -> Result<(), CliError> {
    let SandboxToolsCli {
        command,
        token,
        no_token,
    } = SandboxToolsCli::parse();
    let config = CliConfig { token, no_token };
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_command(&command, &config)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|err| CliError::Server(err.to_string()))
}

pub fn run_command(command: &Command, cli: &CliConfig) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(cli, args),
        Command::Tools => {
            let pretty = serde_json::to_string_pretty(&tools::catalogue())?;
            write_line(std::io::stdout(), &pretty)
        }
        Command::Chat(args) => run_chat(cli, args),
    }
}

fn run_server(cli: &CliConfig, server: &ServerArgs) -> Result<(), CliError> {
    let auth = if let Some(token) = cli.token.clone() {
        AuthConfig::with_token(token)
    } else {
        AuthConfig::disabled()
    };

    let sources = ConfigSources::load(server.config.as_deref())?;
    let settings = Settings::resolve(&sources)?;
    tracing::info!(
        model = %settings.model.name,
        base_url = %settings.model.base_url,
        api_key = %mask_api_key(settings.model.api_key.as_deref()),
        sandbox_endpoint = %settings.sandbox.endpoint,
        pool_size = settings.sandbox.pool_size,
        offline = server.offline,
        "resolved configuration"
    );

    // A missing credential stops startup here, before anything is served.
    let (model, sandbox_runtime) = build_backends(&settings, server.offline)?;
    let cors = build_cors_layer(server)?;

    let addr = format!("{}:{}", server.host, server.port);
    let display_host = match server.host.as_str() {
        "0.0.0.0" | "::" => "localhost",
        other => other,
    };
    let base_url = format!("http://{}:{}", display_host, server.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let manager = sandbox_runtime.map(|runtime| {
            Arc::new(SandboxManager::new(
                runtime,
                SandboxManagerConfig {
                    pool_size: settings.sandbox.pool_size,
                    call_timeout: settings.sandbox.call_timeout,
                },
            ))
        });
        if let Some(manager) = &manager {
            if let Err(err) = manager.start().await {
                tracing::warn!(error = %err, "sandbox runtime unavailable, serving without sandbox tools");
            }
        }

        let service = ChatService::new(model, manager, settings.max_iterations);
        let state = Arc::new(AppState::new(auth, service));
        let (router, state) = build_router_with_state(state);
        let router = router.layer(cors);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(CliError::Io)?;
        tracing::info!(addr = %addr, "server listening");
        log_banner(&base_url);

        let shutdown_state = state.clone();
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown requested");
                shutdown_state.service().shutdown().await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()));

        // Covers the case where serving failed before a signal arrived.
        let report = state.service().shutdown().await;
        if report.released + report.failed > 0 {
            tracing::info!(
                released = report.released,
                failed = report.failed,
                "released remaining sandboxes"
            );
        }
        served
    })
}

fn build_backends(
    settings: &Settings,
    offline: bool,
) -> Result<(Arc<dyn ChatModel>, Option<Arc<dyn SandboxRuntime>>), CliError> {
    if offline {
        let model: Arc<dyn ChatModel> = Arc::new(ScriptedChatModel::intents());
        let runtime: Arc<dyn SandboxRuntime> = Arc::new(InMemorySandboxRuntime::new());
        return Ok((model, Some(runtime)));
    }

    let model: Arc<dyn ChatModel> = Arc::new(OpenAiChatModel::new(&settings.model)?);
    let runtime: Option<Arc<dyn SandboxRuntime>> =
        match HttpSandboxRuntime::new(&settings.sandbox.endpoint, settings.sandbox.call_timeout) {
            Ok(runtime) => Some(Arc::new(runtime)),
            Err(err) => {
                tracing::warn!(error = %err, "sandbox runtime disabled");
                None
            }
        };
    Ok((model, runtime))
}

fn log_banner(base_url: &str) {
    tracing::info!("sandbox-tools chat server started");
    tracing::info!(url = %format!("{base_url}/api/chat"), "POST chat");
    tracing::info!(url = %format!("{base_url}/api/chat/tools"), "GET tools");
    tracing::info!(url = %format!("{base_url}/api/chat/reset"), "DELETE reset");
    tracing::info!(url = %format!("{base_url}/api/chat/health"), "GET health");
    tracing::info!("available tools: calculator, weather, python runner, shell runner, browser");
}

fn run_chat(cli: &CliConfig, args: &ChatArgs) -> Result<(), CliError> {
    let body = ChatRequest {
        message: args.message.clone(),
        session_id: args.session_id.clone(),
        user_id: args.user_id.clone(),
    };
    let mut request = HttpClient::builder()
        .build()?
        .post(chat_url(args.client.endpoint.as_deref()))
        .json(&body);
    if let Some(token) = cli.token.as_deref().filter(|_| !cli.no_token) {
        request = request.bearer_auth(token);
    }

    let response = request.send()?;
    let status = response.status();
    let text = response.text()?;
    if !status.is_success() {
        write_line(std::io::stderr(), &pretty_body(&text))?;
        return Err(CliError::HttpStatus(status));
    }
    let reply: ChatResponse = serde_json::from_str(&text)?;
    write_line(std::io::stdout(), &serde_json::to_string_pretty(&reply)?)
}

fn chat_url(endpoint: Option<&str>) -> String {
    let base = match endpoint {
        Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
        None => format!("http://{DEFAULT_HOST}:{DEFAULT_PORT}"),
    };
    format!("{base}/api/chat")
}

/// Error bodies are printed as indented JSON when they parse, verbatim otherwise.
fn pretty_body(text: &str) -> String {
    serde_json::from_str::<Value>(text)
        .and_then(|json| serde_json::to_string_pretty(&json))
        .unwrap_or_else(|_| text.to_string())
}

fn write_line(mut out: impl Write, text: &str) -> Result<(), CliError> {
    writeln!(out, "{text}")?;
    out.flush()?;
    Ok(())
}

fn parse_each<T: FromStr>(
    values: &[String],
    invalid: fn(String) -> CliError,
) -> Result<Vec<T>, CliError> {
    values
        .iter()
        .map(|value| value.parse().map_err(|_| invalid(value.clone())))
        .collect()
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let origins: Vec<HeaderValue> =
        parse_each(&server.cors_allow_origin, CliError::InvalidCorsOrigin)?;
    let methods: Vec<Method> = parse_each(&server.cors_allow_method, CliError::InvalidCorsMethod)?;
    let headers: Vec<HeaderName> =
        parse_each(&server.cors_allow_header, CliError::InvalidCorsHeader)?;

    // Without an explicit origin no cross-origin request is allowed.
    let cors = if origins.is_empty() {
        CorsLayer::new().allow_origin(AllowOrigin::predicate(|_, _| false))
    } else {
        CorsLayer::new().allow_origin(origins)
    };
    let cors = if methods.is_empty() {
        cors.allow_methods(Any)
    } else {
        cors.allow_methods(methods)
    };
    let cors = if headers.is_empty() {
        cors.allow_headers(Any)
    } else {
        cors.allow_headers(headers)
    };
    Ok(cors.allow_credentials(server.cors_allow_credentials))
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        SandboxToolsCli::command().debug_assert();
    }

    #[test]
    fn chat_subcommand_parses_message_and_endpoint() {
        let cli = SandboxToolsCli::try_parse_from([
            "sandbox-tools",
            "chat",
            "-m",
            "add 2 and 3",
            "--endpoint",
            "http://localhost:9000",
        ])
        .expect("parse");
        match cli.command {
            Command::Chat(args) => {
                assert_eq!(args.message, "add 2 and 3");
                assert_eq!(args.client.endpoint.as_deref(), Some("http://localhost:9000"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn offline_backends_need_no_credential() {
        let settings = Settings::resolve(&ConfigSources::default()).expect("settings");
        let (model, runtime) = build_backends(&settings, true).expect("offline");
        assert_eq!(model.name(), "scripted");
        assert!(runtime.is_some());

        let err = build_backends(&settings, false).err().expect("credential required");
        assert!(matches!(
            err,
            CliError::Orchestrator(OrchestratorError::Initialization { .. })
        ));
    }

    #[test]
    fn chat_url_defaults_to_local_server() {
        assert_eq!(chat_url(None), "http://127.0.0.1:8080/api/chat");
        assert_eq!(
            chat_url(Some("http://10.0.0.5:9000/")),
            "http://10.0.0.5:9000/api/chat"
        );
    }

    #[test]
    fn error_bodies_are_indented_when_json() {
        assert_eq!(pretty_body("gateway down"), "gateway down");
        assert_eq!(
            pretty_body(r#"{"status":400}"#),
            "{\n  \"status\": 400\n}"
        );
    }

    #[test]
    fn write_line_appends_newline() {
        let mut out = Vec::new();
        write_line(&mut out, "done").expect("write");
        assert_eq!(out, b"done\n");
    }

    #[test]
    fn cors_methods_and_headers_are_validated() {
        let cli = SandboxToolsCli::try_parse_from([
            "sandbox-tools",
            "server",
            "-O",
            "http://localhost:3000",
            "-M",
            "POST",
            "-A",
            "authorization",
        ])
        .expect("parse");
        let Command::Server(args) = cli.command else {
            panic!("expected server command");
        };
        assert!(build_cors_layer(&args).is_ok());

        let cli = SandboxToolsCli::try_parse_from(["sandbox-tools", "server", "-M", "PO ST"])
            .expect("parse");
        let Command::Server(args) = cli.command else {
            panic!("expected server command");
        };
        assert!(matches!(
            build_cors_layer(&args),
            Err(CliError::InvalidCorsMethod(method)) if method == "PO ST"
        ));
    }

    #[test]
    fn invalid_cors_origin_is_rejected() {
        let cli = SandboxToolsCli::try_parse_from([
            "sandbox-tools",
            "server",
            "--cors-allow-origin",
            "not a\norigin",
        ])
        .expect("parse");
        let Command::Server(args) = cli.command else {
            panic!("expected server command");
        };
        assert!(matches!(
            build_cors_layer(&args),
            Err(CliError::InvalidCorsOrigin(_))
        ));
    }
}
