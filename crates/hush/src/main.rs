use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "hush", about = "Hush: share client-encrypted secrets that burn after reading", version)]
struct Cli {
    /// Hush server URL (default: http://localhost:8080 or $HUSH_SERVER)
    #[arg(long, env = "HUSH_SERVER", default_value = "http://localhost:8080")]
    server: String,

    #[command(flatten)]
    actor: ActorArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Actor context sent on authenticated calls, as an upstream proxy would.
#[derive(Args)]
struct ActorArgs {
    /// Acting user or identity id ($HUSH_ACTOR_ID)
    #[arg(long, env = "HUSH_ACTOR_ID", global = true)]
    actor_id: Option<String>,
    /// Organization id ($HUSH_ORG_ID)
    #[arg(long, env = "HUSH_ORG_ID", global = true)]
    org_id: Option<String>,
    /// Actor type: user, identity or service
    #[arg(long, env = "HUSH_ACTOR_TYPE", default_value = "user", global = true)]
    actor_type: String,
    /// Bearer key expected by the server on authenticated routes ($HUSH_UPSTREAM_KEY)
    #[arg(long, env = "HUSH_UPSTREAM_KEY", global = true)]
    upstream_key: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Hush HTTP server
    Serve {
        /// Port to listen on (default: $HUSH_PORT or 8080)
        #[arg(long, env = "HUSH_PORT", default_value = "8080")]
        port: u16,
        /// Host to bind (default: $HUSH_HOST or 0.0.0.0)
        #[arg(long, env = "HUSH_HOST", default_value = "0.0.0.0")]
        host: String,
    },
    /// Share an already-encrypted secret
    Push {
        /// Ciphertext produced by the client
        #[arg(long)]
        encrypted_value: String,
        #[arg(long)]
        iv: String,
        /// Authentication tag from the client's cipher
        #[arg(long)]
        tag: String,
        /// Lookup hash readers must present
        #[arg(long)]
        hashed_hex: String,
        /// TTL duration e.g. 1h, 30m, 7d
        #[arg(long)]
        ttl: Option<String>,
        /// Number of views before the secret is destroyed
        #[arg(long)]
        views: Option<u32>,
        /// Share anonymously, without an owner or organization
        #[arg(long)]
        public: bool,
    },
    /// Retrieve a secret, consuming one view
    Get {
        id: String,
        #[arg(long)]
        hashed_hex: String,
    },
    /// List secrets you own in the organization
    List,
    /// Delete a secret you own
    Delete { id: String },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("HUSH_LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let server = cli.server.trim_end_matches('/');

    match cli.command {
        Commands::Serve { port, host } => cmd_serve(host, port).await,

        Commands::Push {
            encrypted_value,
            iv,
            tag,
            hashed_hex,
            ttl,
            views,
            public,
        } => {
            let ttl_seconds = ttl.as_deref().map(parse_duration).transpose()?;
            let body = serde_json::json!({
                "encrypted_value": encrypted_value,
                "iv": iv,
                "tag": tag,
                "hashed_hex": hashed_hex,
                "ttl_seconds": ttl_seconds,
                "expires_after_views": views,
            });
            cmd_push(server, &cli.actor, &body, public).await
        }

        Commands::Get { id, hashed_hex } => cmd_get(server, &id, &hashed_hex).await,

        Commands::List => cmd_list(server, &cli.actor).await,

        Commands::Delete { id } => cmd_delete(server, &cli.actor, &id).await,
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(host: String, port: u16) -> Result<()> {
    let cfg = hush_server::ServerConfig {
        host,
        port,
        upstream_key: hush_server::resolve_upstream_key()?,
        ..Default::default()
    };

    hush_server::run(cfg).await
}

async fn cmd_push(server: &str, actor: &ActorArgs, body: &Value, public: bool) -> Result<()> {
    let client = Client::new();
    let req = if public {
        client.post(format!("{server}/secret-sharing/public"))
    } else {
        with_actor(client.post(format!("{server}/secret-sharing")), actor)?
    };

    let json = expect_success(req.json(body).send().await.context("HTTP request failed")?).await?;
    let id = json["id"].as_str().context("server response missing id")?;
    println!("{id}");
    Ok(())
}

async fn cmd_get(server: &str, id: &str, hashed_hex: &str) -> Result<()> {
    let resp = Client::new()
        .get(format!("{server}/secret-sharing/public/{id}"))
        .query(&[("hashed_hex", hashed_hex)])
        .send()
        .await
        .context("HTTP request failed")?;

    let json = expect_success(resp).await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

async fn cmd_list(server: &str, actor: &ActorArgs) -> Result<()> {
    let req = with_actor(Client::new().get(format!("{server}/secret-sharing")), actor)?;
    let json = expect_success(req.send().await.context("HTTP request failed")?).await?;

    let secrets = json["secrets"].as_array().cloned().unwrap_or_default();
    if secrets.is_empty() {
        println!("(no shared secrets)");
        return Ok(());
    }
    for s in &secrets {
        let expiry = match s["expires_at"].as_i64() {
            Some(exp) => {
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs() as i64;
                let secs_left = exp - now;
                if secs_left > 0 {
                    format!("expires in {}", format_duration(secs_left as u64))
                } else {
                    "expired".to_string()
                }
            }
            None => "no TTL".to_string(),
        };
        let views = match s["expires_after_views"].as_u64() {
            Some(n) => format!("{n} view(s) left"),
            None => "unlimited views".to_string(),
        };
        println!("  {} — {} — {}", s["id"].as_str().unwrap_or("?"), expiry, views);
    }
    Ok(())
}

async fn cmd_delete(server: &str, actor: &ActorArgs, id: &str) -> Result<()> {
    let req = with_actor(
        Client::new().delete(format!("{server}/secret-sharing/{id}")),
        actor,
    )?;
    expect_success(req.send().await.context("HTTP request failed")?).await?;
    println!("✓ deleted {id}");
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn with_actor(req: RequestBuilder, actor: &ActorArgs) -> Result<RequestBuilder> {
    let actor_id = actor
        .actor_id
        .as_deref()
        .context("--actor-id / HUSH_ACTOR_ID is required for this command")?;
    let org_id = actor
        .org_id
        .as_deref()
        .context("--org-id / HUSH_ORG_ID is required for this command")?;

    let mut req = req
        .header("x-actor-type", actor.actor_type.as_str())
        .header("x-actor-id", actor_id)
        .header("x-org-id", org_id)
        .header("x-actor-org-id", org_id);
    if let Some(ref key) = actor.upstream_key {
        req = req.bearer_auth(key);
    }
    Ok(req)
}

async fn expect_success(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    let json: Value = resp.json().await.unwrap_or_default();
    if !status.is_success() {
        anyhow::bail!(
            "server returned {status}: {}",
            json["error"].as_str().unwrap_or("unknown error")
        );
    }
    Ok(json)
}

/// Parse human duration strings like "1h", "30m", "7d", "5s" into seconds.
fn parse_duration(s: &str) -> Result<u64> {
    let d: humantime::Duration = s
        .parse()
        .with_context(|| format!("invalid duration: {s}"))?;
    Ok(d.as_secs())
}

fn format_duration(secs: u64) -> String {
    if secs >= 86400 {
        format!("{}d", secs / 86400)
    } else if secs >= 3600 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_human_durations() {
        assert_eq!(parse_duration("30m").unwrap(), 1800);
        assert_eq!(parse_duration("1h").unwrap(), 3600);
        assert_eq!(parse_duration("7d").unwrap(), 604_800);
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn formats_largest_unit() {
        assert_eq!(format_duration(90_000), "1d");
        assert_eq!(format_duration(7200), "2h");
        assert_eq!(format_duration(61), "1m");
        assert_eq!(format_duration(5), "5s");
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
