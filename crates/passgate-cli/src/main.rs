// ============================================================================
// passgate-db: CLI database inspection tool for Passgate
// ============================================================================
// Usage:
//   passgate-db stats                          Show database statistics
//   passgate-db list-grants                    List access grants
//   passgate-db list-tokens [--unused]         List issued tokens
//   passgate-db list-albums                    List media albums
//   passgate-db export --format json           Export full database as JSON
//   passgate-db prune --older-than-days 7      Prune expired grants and tokens
//   passgate-db config show|ads|channels       Inspect or change gate settings
//   passgate-db token mint|verify              Mint or check a token
// ============================================================================

use anyhow::Result;
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use passgate_core::config::ConfigOverrides;
use passgate_core::db::PassBackend;
use passgate_core::{GateConfig, PassDb, SystemClock, TokenCodec, TokenLedger, TokenPolicy};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Passgate database inspection tool
#[derive(Parser)]
#[command(name = "passgate-db", version, about = "Inspect and manage the Passgate database")]
struct Cli {
    /// Path to the database file (default: ~/.passgate/passgate.redb)
    #[arg(long, global = true)]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show database statistics (grants, tokens, albums, users)
    Stats,

    /// List access grants
    ListGrants,

    /// List issued tokens
    ListTokens {
        /// Only show tokens that have not been redeemed
        #[arg(long)]
        unused: bool,
    },

    /// List media albums
    ListAlbums,

    /// Export full database contents as JSON
    Export {
        /// Output format (currently only json is supported)
        #[arg(long, default_value = "json")]
        format: String,
    },

    /// Prune expired grants and long-expired token records
    Prune {
        /// Keep token records for this many days past their expiry
        #[arg(long, default_value = "7")]
        older_than_days: i64,

        /// Show what would be pruned without actually deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Inspect or change persisted gate settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Mint or verify tokens (needs PASSGATE_TOKEN_SECRET)
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show stored overrides and the effective config
    Show,
    /// Turn the ad gate on or off
    Ads {
        /// "on" or "off"
        state: String,
    },
    /// Replace the required channel list
    Channels {
        /// Channel ids, e.g. -1001234567890
        #[arg(allow_hyphen_values = true)]
        ids: Vec<String>,
    },
}

#[derive(Subcommand)]
enum TokenAction {
    /// Mint a token for an owner and record it so its link can be redeemed
    Mint {
        #[arg(long)]
        owner: String,
        /// Album hash the token should unlock
        #[arg(long)]
        album: Option<String>,
    },
    /// Check a token against an owner
    Verify {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        token: String,
    },
}

fn parse_switch(s: &str) -> Result<bool> {
    match s.to_lowercase().as_str() {
        "on" | "true" | "enable" | "enabled" => Ok(true),
        "off" | "false" | "disable" | "disabled" => Ok(false),
        _ => anyhow::bail!("Unknown state '{}'. Valid values: on, off", s),
    }
}

fn format_timestamp(ts_ms: i64) -> String {
    Utc.timestamp_millis_opt(ts_ms)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("(invalid: {})", ts_ms))
}

fn init_logging() {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: failed to load .env: {}", e);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,passgate_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    // Token commands open the database only when minting
    if let Commands::Token { action } = &cli.command {
        return cmd_token(action, cli.db_path.as_deref());
    }

    let db = PassDb::open(cli.db_path.as_deref())?;

    match cli.command {
        Commands::Stats => cmd_stats(&db),
        Commands::ListGrants => cmd_list_grants(&db),
        Commands::ListTokens { unused } => cmd_list_tokens(&db, unused),
        Commands::ListAlbums => cmd_list_albums(&db),
        Commands::Export { format } => cmd_export(&db, &format),
        Commands::Prune {
            older_than_days,
            dry_run,
        } => cmd_prune(&db, older_than_days, dry_run),
        Commands::Config { action } => cmd_config(&db, action),
        Commands::Token { .. } => Ok(()),
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn cmd_stats(db: &PassDb) -> Result<()> {
    let stats = db.stats(now_ms())?;

    println!("=== Passgate Database Stats ===");
    println!("Database: {}", db.path().display());
    println!();
    println!("Grants:  {} total, {} live", stats.total_grants, stats.live_grants);
    println!("Tokens:  {} total, {} used", stats.total_tokens, stats.used_tokens);
    println!("Albums:  {} ({} media items)", stats.total_albums, stats.total_media);
    println!("Users:   {}", stats.total_users);

    let mut views: Vec<_> = stats.album_views.iter().collect();
    views.sort_by(|a, b| b.1.cmp(a.1));
    if !views.is_empty() {
        println!("\nTop albums by views:");
        for (hash, count) in views.iter().take(10) {
            println!("  {:12} {}", hash, count);
        }
    }

    Ok(())
}

fn cmd_list_grants(db: &PassDb) -> Result<()> {
    let grants = db.list_grants()?;
    if grants.is_empty() {
        println!("No grants found.");
        return Ok(());
    }

    let now = now_ms();
    println!("{:<16}  {:<8}  {:<24}  {}", "USER", "LIVE", "GRANTED AT", "EXPIRES");
    println!("{}", "-".repeat(80));
    for (user_id, grant) in &grants {
        println!(
            "{:<16}  {:<8}  {:<24}  {}",
            user_id,
            if grant.is_live(now) { "yes" } else { "no" },
            format_timestamp(grant.granted_at),
            format_timestamp(grant.expires)
        );
    }

    println!("\nTotal: {} grants", grants.len());
    Ok(())
}

fn cmd_list_tokens(db: &PassDb, unused_only: bool) -> Result<()> {
    let tokens: Vec<_> = db
        .list_tokens()?
        .into_iter()
        .filter(|(_, record)| !unused_only || !record.used)
        .collect();
    if tokens.is_empty() {
        println!("No tokens found.");
        return Ok(());
    }

    println!(
        "{:<44}  {:<12}  {:<6}  {:<12}  {}",
        "TOKEN", "OWNER", "USED", "ALBUM", "EXPIRES"
    );
    println!("{}", "-".repeat(110));
    for (token, record) in &tokens {
        println!(
            "{:<44}  {:<12}  {:<6}  {:<12}  {}",
            token,
            record.owner_id,
            if record.used { "yes" } else { "no" },
            record.media_hash.as_deref().unwrap_or("-"),
            format_timestamp(record.expires_at)
        );
    }

    println!("\nTotal: {} tokens", tokens.len());
    Ok(())
}

fn cmd_list_albums(db: &PassDb) -> Result<()> {
    let albums = db.list_albums()?;
    if albums.is_empty() {
        println!("No albums found.");
        return Ok(());
    }

    let views = db.list_views()?;
    println!(
        "{:<12}  {:<6}  {:<10}  {:<6}  {}",
        "HASH", "ITEMS", "ANNOUNCED", "VIEWS", "CREATED AT"
    );
    println!("{}", "-".repeat(70));
    for album in &albums {
        println!(
            "{:<12}  {:<6}  {:<10}  {:<6}  {}",
            album.hash,
            album.media.len(),
            if album.link_sent { "yes" } else { "no" },
            views.get(&album.hash).copied().unwrap_or(0),
            format_timestamp(album.created_at)
        );
    }

    println!("\nTotal: {} albums", albums.len());
    Ok(())
}

fn cmd_export(db: &PassDb, format: &str) -> Result<()> {
    if format != "json" {
        anyhow::bail!("Unsupported format '{}'. Only 'json' is supported.", format);
    }

    let stats = db.stats(now_ms())?;
    let config = db.get_config_overrides()?;
    let mut grants = serde_json::Map::new();
    for (user_id, grant) in db.list_grants()? {
        grants.insert(user_id, serde_json::to_value(grant)?);
    }
    let mut tokens = serde_json::Map::new();
    for (token, record) in db.list_tokens()? {
        tokens.insert(token, serde_json::to_value(record)?);
    }

    let export = serde_json::json!({
        "exported_at": Utc::now().to_rfc3339(),
        "stats": stats,
        "config": config,
        "grants": grants,
        "tokens": tokens,
        "albums": db.list_albums()?,
        "users": db.list_users()?,
    });

    println!("{}", serde_json::to_string_pretty(&export)?);
    Ok(())
}

fn cmd_prune(db: &PassDb, older_than_days: i64, dry_run: bool) -> Result<()> {
    if older_than_days < 0 {
        anyhow::bail!("--older-than-days must not be negative");
    }
    let now = now_ms();
    let token_cutoff = now - older_than_days * DAY_MS;

    if dry_run {
        println!("=== DRY RUN: no data will be deleted ===\n");

        let grants = db.list_grants()?;
        let expired: Vec<_> = grants.iter().filter(|(_, g)| !g.is_live(now)).collect();
        println!("Would prune {} expired grants", expired.len());
        for (user_id, grant) in &expired {
            println!("  - {} (expired: {})", user_id, format_timestamp(grant.expires));
        }

        let tokens = db.list_tokens()?;
        let stale: Vec<_> = tokens
            .iter()
            .filter(|(_, r)| r.expires_at < token_cutoff)
            .collect();
        println!(
            "\nWould prune {} tokens expired more than {} days ago",
            stale.len(),
            older_than_days
        );
        for (token, record) in &stale {
            println!("  - {} (expired: {})", token, format_timestamp(record.expires_at));
        }
    } else {
        let pruned_grants = db.prune_expired_grants(now)?;
        let pruned_tokens = db.prune_tokens_before(token_cutoff)?;

        println!("Pruned {} expired grants", pruned_grants);
        println!(
            "Pruned {} tokens (expired more than {} days ago)",
            pruned_tokens, older_than_days
        );
    }

    Ok(())
}

fn cmd_config(db: &PassDb, action: ConfigAction) -> Result<()> {
    let update = match action {
        ConfigAction::Show => {
            let stored = db.get_config_overrides()?.unwrap_or_default();
            let mut effective = GateConfig::from_env().with_overrides(&stored);
            if effective.shortener_api_token.is_some() {
                effective.shortener_api_token = Some("<redacted>".into());
            }
            if effective.bot_api_token.is_some() {
                effective.bot_api_token = Some("<redacted>".into());
            }
            println!("=== Stored overrides ===");
            println!("{}", serde_json::to_string_pretty(&stored)?);
            println!("\n=== Effective config ===");
            println!("{}", serde_json::to_string_pretty(&effective)?);
            return Ok(());
        }
        ConfigAction::Ads { state } => ConfigOverrides {
            ad_enabled: Some(parse_switch(&state)?),
            ..Default::default()
        },
        ConfigAction::Channels { ids } => ConfigOverrides {
            channels: Some(ids),
            ..Default::default()
        },
    };

    let mut stored = db.get_config_overrides()?.unwrap_or_default();
    stored.merge(update);
    db.put_config_overrides(&stored)?;
    println!("Config updated:");
    println!("{}", serde_json::to_string_pretty(&stored)?);
    Ok(())
}

/// Mint a token and write its ledger record; redeeming needs both
fn mint_recorded(
    codec: &TokenCodec,
    ledger: &TokenLedger,
    owner: &str,
    album: Option<&str>,
    issued_at: i64,
) -> Result<(String, i64)> {
    let token = codec.mint_at(owner, issued_at)?;
    let expires_at = issued_at.saturating_add(codec.policy().ttl_ms());
    ledger.record(&token, owner, album, expires_at)?;
    Ok((token, expires_at))
}

fn cmd_token(action: &TokenAction, db_path: Option<&str>) -> Result<()> {
    let codec = TokenCodec::new(TokenPolicy::from_env()?, Arc::new(SystemClock));

    match action {
        TokenAction::Mint { owner, album } => {
            let db = Arc::new(PassDb::open(db_path)?);
            let ledger = TokenLedger::new(db, Arc::new(SystemClock));
            let (token, expires_at) =
                mint_recorded(&codec, &ledger, owner, album.as_deref(), now_ms())?;

            let links = GateConfig::from_env().links();
            println!("Token:   {}", token);
            println!("Expires: {}", format_timestamp(expires_at));
            println!("Link:    {}", links.redeem_link(&token));
        }
        TokenAction::Verify { owner, token } => match codec.inspect(token, owner) {
            Ok(claims) => println!(
                "VALID (owner {}, issued {})",
                claims.owner_id,
                format_timestamp(claims.issued_at)
            ),
            Err(rejection) => anyhow::bail!("INVALID: {}", rejection),
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use passgate_core::{ManualClock, MemoryDb};

    const T0: i64 = 1_700_000_000_000;

    #[test]
    fn test_minted_token_is_recorded() {
        let clock = Arc::new(ManualClock::new(T0));
        let policy = TokenPolicy::new("cli-test-secret", 18 * 60 * 60 * 1000).unwrap();
        let codec = TokenCodec::new(policy, clock.clone());
        let ledger = TokenLedger::new(Arc::new(MemoryDb::new()), clock);

        let (token, expires_at) = mint_recorded(&codec, &ledger, "42", Some("abc123"), T0).unwrap();
        assert!(codec.verify(&token, "42"));
        assert_eq!(expires_at, T0 + 18 * 60 * 60 * 1000);

        let record = ledger.lookup(&token).unwrap().unwrap();
        assert_eq!(record.owner_id, "42");
        assert_eq!(record.media_hash.as_deref(), Some("abc123"));
        assert!(!record.used);
    }

    #[test]
    fn test_parse_switch() {
        assert!(parse_switch("ON").unwrap());
        assert!(!parse_switch("disabled").unwrap());
        assert!(parse_switch("maybe").is_err());
    }
}
