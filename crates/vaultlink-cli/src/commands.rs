use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::Args;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::io::BufReader;
use tracing::{debug, info, warn};

use vaultlink_core::api::{ApiRequest, Method};
use vaultlink_core::auth::{AuthManager, CredentialStore, Credentials, SessionStore};
use vaultlink_core::config::{default_cache_dir, host_of, normalize_base_url};
use vaultlink_core::mcp::McpServer;
use vaultlink_core::{Config, VaultClient};

#[derive(Args)]
pub struct CallArgs {
    /// HTTP method (GET, POST, PUT, DELETE, ...)
    method: String,

    /// Endpoint path such as /api/v25.1/objects/documents/12, or a full URL
    endpoint: String,

    /// Query parameter as KEY=VALUE (repeatable)
    #[arg(short, long = "param", value_parser = parse_key_value)]
    params: Vec<(String, String)>,

    /// Extra header as NAME=VALUE (repeatable)
    #[arg(short = 'H', long = "header", value_parser = parse_key_value)]
    headers: Vec<(String, String)>,

    /// Form field as KEY=VALUE (repeatable)
    #[arg(short, long = "form", value_parser = parse_key_value, conflicts_with = "json")]
    form: Vec<(String, String)>,

    /// JSON request body
    #[arg(long)]
    json: Option<String>,

    /// Write the raw response body to this file instead of printing JSON
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn parse_key_value(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))
}

/// How to obtain the password for password authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PasswordPolicy {
    /// Environment, then keychain, then an interactive prompt.
    Prompt,
    /// Like `Prompt`, but a cached session removes the need for one.
    /// `interactive` controls whether the prompt is allowed at all.
    UnlessCached { interactive: bool },
    /// Commands that never authenticate.
    NotNeeded,
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn password_mode(auth_mode: Option<String>) -> bool {
    auth_mode
        .map(|m| matches!(m.trim().to_ascii_lowercase().as_str(), "" | "password" | "basic"))
        .unwrap_or(true)
}

fn cache_dir() -> Result<PathBuf> {
    match env_var("VAULT_SESSION_CACHE_DIR") {
        Some(dir) => Ok(PathBuf::from(dir)),
        None => Ok(default_cache_dir()?),
    }
}

fn vault_host() -> Option<String> {
    let url = env_var("VAULT_URL")?;
    normalize_base_url(&url).ok().map(|base_url| host_of(&base_url))
}

fn has_cached_session(cache_dir: &Path) -> bool {
    let Some(host) = vault_host() else {
        return false;
    };
    match SessionStore::new(cache_dir.to_path_buf(), host).load() {
        Ok(session) => session.is_some(),
        Err(e) => {
            debug!(error = %e, "No usable cached session");
            false
        }
    }
}

fn resolve_password(policy: PasswordPolicy, cached: bool) -> Result<Option<SecretString>> {
    if let Some(password) = env_var("VAULT_PASSWORD") {
        return Ok(Some(SecretString::from(password)));
    }
    if policy == PasswordPolicy::NotNeeded || !password_mode(env_var("VAULT_AUTH_MODE")) {
        return Ok(None);
    }

    let (Some(username), Some(host)) = (env_var("VAULT_USERNAME"), vault_host()) else {
        return Ok(None);
    };
    match CredentialStore::new(&username, &host).load() {
        Ok(Some(password)) => {
            debug!(username = %username, "Using password from keychain");
            return Ok(Some(password));
        }
        Ok(None) => debug!(username = %username, "No password in keychain"),
        Err(e) => debug!(error = %e, "Keychain unavailable"),
    }

    // A cached session is enough to start; don't ask for a password up front
    let interactive = match policy {
        PasswordPolicy::Prompt => true,
        PasswordPolicy::UnlessCached { interactive } => interactive && !cached,
        PasswordPolicy::NotNeeded => false,
    };
    if !interactive {
        return Ok(None);
    }
    let password = rpassword::prompt_password(format!("Vault password for {}: ", username))
        .context("Failed to read password")?;
    Ok(Some(SecretString::from(password)))
}

/// Build the configuration from `lookup`, with `password` standing in for
/// `VAULT_PASSWORD`. Without a password, password mode falls back to the
/// cached session alone when `session_only` allows it.
fn build_config<F>(lookup: F, password: Option<SecretString>, session_only: bool) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let config = match password {
        Some(password) => Config::from_lookup(|key| match key {
            "VAULT_PASSWORD" => Some(password.expose_secret().to_string()),
            _ => lookup(key),
        })?,
        None if session_only && password_mode(lookup("VAULT_AUTH_MODE")) => {
            Config::from_lookup_with_credentials(&lookup, Credentials::SessionOnly)?
        }
        None => Config::from_lookup(&lookup)?,
    };
    Ok(config)
}

fn load_config(use_cache: bool, policy: PasswordPolicy) -> Result<Config> {
    let cache_dir = if use_cache { Some(cache_dir()?) } else { None };
    let cached = cache_dir.as_deref().is_some_and(has_cached_session);

    let password = resolve_password(policy, cached)?;
    let session_only = policy == PasswordPolicy::NotNeeded
        || (matches!(policy, PasswordPolicy::UnlessCached { .. }) && cached);
    let config = build_config(|key| std::env::var(key).ok(), password, session_only)?;

    Ok(match cache_dir {
        Some(dir) => config.with_session_cache(dir),
        None => config,
    })
}

fn client(use_cache: bool, interactive: bool) -> Result<VaultClient> {
    let config = load_config(use_cache, PasswordPolicy::UnlessCached { interactive })?;
    Ok(VaultClient::from_config(config)?)
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn login(use_cache: bool, save_password: bool) -> Result<()> {
    let config = load_config(use_cache, PasswordPolicy::Prompt)?;
    let manager = AuthManager::new(config.clone())?;
    let session = manager.authenticate().await?;

    println!(
        "Logged in to {} ({}) as user {}",
        session.vault_name(),
        session.vault_id(),
        session.user_id()
    );
    if session.auth_mode() == Some("password_fallback") {
        println!("OAuth login failed; signed in with the service account instead");
    }

    if save_password {
        match config.credentials {
            Credentials::Password(ref creds) => {
                CredentialStore::new(&creds.username, &config.host()).save(creds.secret())?;
                println!("Password saved to the system keychain");
            }
            Credentials::OAuth(_) | Credentials::SessionOnly => {
                warn!("--save-password only applies to password authentication");
            }
        }
    }
    Ok(())
}

pub async fn logout(use_cache: bool, forget_password: bool) -> Result<()> {
    let config = load_config(use_cache, PasswordPolicy::NotNeeded)?;
    let manager = AuthManager::new(config)?;

    if manager.current_session().is_some() {
        manager.logout().await;
        println!("Logged out");
    } else {
        println!("No active session");
    }

    if forget_password {
        let username = env_var("VAULT_USERNAME")
            .ok_or_else(|| anyhow!("VAULT_USERNAME is required to forget a password"))?;
        if CredentialStore::new(&username, &manager.config().host()).forget()? {
            println!("Password removed from the system keychain");
        } else {
            println!("No password stored for {}", username);
        }
    }
    Ok(())
}

pub fn status(use_cache: bool) -> Result<()> {
    let config = load_config(use_cache, PasswordPolicy::NotNeeded)?;
    let manager = AuthManager::new(config)?;

    println!("Vault:     {}", manager.config().base_url);
    println!("API:       {}", manager.config().api_version);

    let Some(session) = manager.current_session() else {
        println!("Session:   not logged in");
        return Ok(());
    };

    println!(
        "Session:   user {} on {} ({})",
        session.user_id(),
        session.vault_name(),
        session.vault_id()
    );
    println!("Auth mode: {}", session.auth_mode().unwrap_or("unknown"));
    println!("Since:     {}", session.created_at().format("%Y-%m-%d %H:%M:%S UTC"));
    match session.minutes_until_expiry(Utc::now()) {
        Some(minutes) => println!("Expires:   in {} minutes", minutes),
        None => println!("Expires:   on inactivity (use keep-alive)"),
    }
    Ok(())
}

pub async fn keep_alive(use_cache: bool, every: Option<u64>) -> Result<()> {
    let config = load_config(use_cache, PasswordPolicy::NotNeeded)?;
    let manager = Arc::new(AuthManager::new(config)?);

    if manager.current_session().is_none() {
        bail!("not logged in; run `vaultlink login` first");
    }

    manager.keep_alive().await?;
    println!("Session kept alive");

    if let Some(secs) = every {
        let _handle = manager.spawn_keep_alive(Duration::from_secs(secs.max(1)));
        info!(interval_secs = secs, "Keeping session alive until interrupted");
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
    }
    Ok(())
}

pub async fn query(use_cache: bool, vql: &str) -> Result<()> {
    let client = client(use_cache, true)?;
    let response = client.with_session_retry(|| client.query(vql)).await?;
    print_json(&response.into_json())
}

pub async fn call(use_cache: bool, args: CallArgs) -> Result<()> {
    let method = Method::from_bytes(args.method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("invalid HTTP method '{}'", args.method))?;

    let mut request = ApiRequest::new(method, args.endpoint);
    request.params = args.params;
    request.headers = args.headers;
    if let Some(ref json) = args.json {
        let body: Value = serde_json::from_str(json).context("--json is not valid JSON")?;
        request = request.json(body);
    } else if !args.form.is_empty() {
        request = request.form(args.form);
    }

    let client = client(use_cache, true)?;

    match args.output {
        Some(path) => {
            let raw = client
                .with_session_retry(|| client.call_raw(request.clone()))
                .await?;
            std::fs::write(&path, &raw.body)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            match raw.file_name {
                Some(name) => println!("Saved {} ({} bytes) to {}", name, raw.body.len(), path.display()),
                None => println!("Saved {} bytes to {}", raw.body.len(), path.display()),
            }
            Ok(())
        }
        None => {
            let response = client
                .with_session_retry(|| client.call(request.clone()))
                .await?;
            print_json(&response.into_json())
        }
    }
}

pub async fn serve(use_cache: bool, keep_alive: Option<u64>) -> Result<()> {
    // stdin belongs to the protocol, so never prompt here
    let client = client(use_cache, false)?;

    let _keep_alive = keep_alive.map(|secs| {
        client
            .auth()
            .spawn_keep_alive(Duration::from_secs(secs.max(1)))
    });

    let server = Arc::new(McpServer::new(client));
    server
        .serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await
}
