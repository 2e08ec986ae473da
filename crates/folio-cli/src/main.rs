//! FOLIO LMS command-line client.
//!
//! A thin front-end over `folio-core`: log in, inspect the stored session,
//! and issue authenticated requests against the FOLIO API. Access tokens
//! are never written to disk, so each run resumes the session from the
//! stored refresh token.

use std::io::{self, Write};

use anyhow::{Context, Result};
use folio_core::{ApiClient, ApiError, ApiRequest, Config, Gateway, GatewayError, SessionEvent};
use reqwest::Method;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const USAGE: &str = "\
Usage: folio <command> [args]

Commands:
  login [username]               Sign in and store the refresh token
  logout                         Forget the stored session
  status                         Show API URL, session and cached profile
  get <path> [key=value ...]     GET a resource, query parameters as key=value
  request <METHOD> <path> [json] Send any request with an optional JSON body

Environment:
  FOLIO_API_URL, FOLIO_USERNAME, FOLIO_PASSWORD, FOLIO_LOG_DIR, RUST_LOG";

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr, filtered by `RUST_LOG` (default `warn`). When
/// `FOLIO_LOG_DIR` is set a daily log file is written there as well; keep the
/// returned guard alive so it gets flushed.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var("FOLIO_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "folio.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{}", USAGE);
        return Ok(());
    };

    let mut config = Config::load().context("Failed to load config")?;
    config.apply_env_overrides();

    let store = config.credential_store()?;
    let gateway = Gateway::new(config.gateway_config(), store)?;
    let mut events = gateway.subscribe();
    let client = ApiClient::new(gateway);
    info!(api_url = config.api_url(), command = %command, "FOLIO client starting");

    let result = match command.as_str() {
        "login" => login(&client, &mut config, args.get(1).cloned()).await,
        "logout" => {
            client.logout();
            println!("Logged out.");
            Ok(())
        }
        "status" => {
            status(&client, &config);
            Ok(())
        }
        "get" => get(&client, &args[1..]).await,
        "request" => request(&client, &args[1..]).await,
        "help" | "--help" | "-h" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => Err(anyhow::anyhow!("Unknown command: {}\n\n{}", other, USAGE)),
    };

    report_session_end(&mut events);

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn report_session_end(events: &mut broadcast::Receiver<SessionEvent>) {
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::Terminated(reason) = event {
            eprintln!("Session ended ({}). Run `folio login` to sign in again.", reason);
        }
    }
}

async fn login(client: &ApiClient, config: &mut Config, username: Option<String>) -> Result<()> {
    let username = match username.or_else(|| std::env::var("FOLIO_USERNAME").ok()) {
        Some(username) if !username.trim().is_empty() => username.trim().to_string(),
        _ => prompt_username(config.last_username.as_deref())?,
    };
    if username.is_empty() {
        anyhow::bail!("Username required");
    }

    let password = match std::env::var("FOLIO_PASSWORD") {
        Ok(password) if !password.is_empty() => password,
        _ => rpassword::prompt_password("Password: ")?,
    };

    println!("Authenticating...");
    let user = client
        .login(&username, &password)
        .await
        .map_err(|e| anyhow::anyhow!(login_error_message(&e)))?;

    config.last_username = Some(username);
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }

    match user.as_ref().and_then(|u| u["username"].as_str()) {
        Some(name) => println!("Login successful! Signed in as {}.", name),
        None => println!("Login successful!"),
    }
    Ok(())
}

/// Friendly wording for the login failures users actually hit
fn login_error_message(err: &ApiError) -> String {
    match err {
        ApiError::Unauthorized => "Invalid username or password".to_string(),
        ApiError::NetworkError(e) | ApiError::Gateway(GatewayError::Transport(e)) if e.is_timeout() => {
            "Connection timed out. Please try again.".to_string()
        }
        ApiError::NetworkError(_) | ApiError::Gateway(GatewayError::Transport(_)) => {
            "Unable to connect to server. Check your network connection.".to_string()
        }
        other => format!("Login failed: {}", other),
    }
}

fn prompt_username(last: Option<&str>) -> Result<String> {
    match last {
        Some(last) => print!("Username [{}]: ", last),
        None => print!("Username: "),
    }
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim();

    Ok(match (input.is_empty(), last) {
        (true, Some(last)) => last.to_string(),
        _ => input.to_string(),
    })
}

fn status(client: &ApiClient, config: &Config) {
    let gateway = client.gateway();
    println!("API:     {}", config.api_url());
    println!(
        "Session: {}",
        if gateway.has_session() {
            "active (refresh token stored)"
        } else {
            "not logged in"
        }
    );

    if let Some(user) = gateway.cached_user() {
        let name = user["username"].as_str().unwrap_or("unknown");
        println!("User:    {}", name);
    }
}

async fn get(client: &ApiClient, args: &[String]) -> Result<()> {
    let (path, params) = args
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("Usage: folio get <path> [key=value ...]"))?;

    let mut request = ApiRequest::get(path.as_str());
    for param in params {
        let (key, value) = parse_query_param(param)?;
        request = request.query(key, value);
    }

    print_response(client, request).await
}

async fn request(client: &ApiClient, args: &[String]) -> Result<()> {
    let (method, path, body) = match args {
        [method, path] => (method, path, None),
        [method, path, body] => (method, path, Some(body)),
        _ => anyhow::bail!("Usage: folio request <METHOD> <path> [json]"),
    };

    let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method: {}", method))?;
    let mut request = ApiRequest::new(method, path.as_str());
    if let Some(body) = body {
        let body: serde_json::Value =
            serde_json::from_str(body).context("Request body is not valid JSON")?;
        request = request.json_value(body);
    }

    print_response(client, request).await
}

async fn print_response(client: &ApiClient, request: ApiRequest) -> Result<()> {
    let response = client.send(request).await?;
    let text = response.text().await.context("Failed to read response body")?;

    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) if text.is_empty() => {}
        Err(_) => println!("{}", text),
    }
    Ok(())
}

fn parse_query_param(param: &str) -> Result<(&str, &str)> {
    param
        .split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .ok_or_else(|| anyhow::anyhow!("Expected key=value, got: {}", param))
}
