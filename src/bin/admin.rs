use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use booking_ingest::auth::signature::{
    sign, HEADER_IDEMPOTENCY_KEY, HEADER_NONCE, HEADER_SIGNATURE, HEADER_SIGNATURE_ALGORITHM,
    HEADER_TIMESTAMP,
};
use booking_ingest::auth::SIGNATURE_ALGORITHM;
use booking_ingest::dead_letter::DeadLetterService;
use booking_ingest::infra::postgres::{
    PgAuditLog, PgBookingDomain, PgDeadLetterStore, PgEventStore, PgJobQueue, PgNonceStore,
};
use booking_ingest::infra::{JobQueue, NonceStore};
use booking_ingest::metrics::MetricsRegistry;
use booking_ingest::reconcile::{ReconcileConfig, Reconciler};
use booking_ingest::DeadLetterStatus;

const DEFAULT_ADMIN_ACTOR: &str = "admin:cli";

fn print_help() {
    eprintln!(
        "\
booking-ingest-admin

USAGE:
  booking-ingest-admin <command> [options]

COMMANDS:
  migrate                         Run database migrations
  sign-request                    Print signed headers for a request body
  list-dead-letters               List dead-letter entries
  transition                      Move a dead-letter entry to a new status
  reconcile                       Run a read-only reconciliation and print the report
  cleanup                         Delete old audit rows, finished jobs and expired nonces
  pause-queue                     Stop workers from claiming jobs
  resume-queue                    Let workers claim jobs again

COMMON OPTIONS:
  --database-url <postgres_url>    (defaults to env DATABASE_URL)

sign-request OPTIONS:
  --secret <secret>               (defaults to env SIGNATURE_SECRET)
  --method <method>               (default: POST)
  --path <path>                   (default: /api/v1/ingest/bookings)
  --body <json>                   Request body
  --body-file <path>              Read the request body from a file
  --idempotency-key <key>         (default: random uuid)
  --nonce <nonce>                 (default: random uuid)
  --timestamp <rfc3339>           (default: now)

list-dead-letters OPTIONS:
  --status <status>               (optional) OPEN|READY|REPLAYING|SUCCEEDED|FAILED
  --limit <n>                     (default: 50)

transition OPTIONS:
  --key <dead_letter_key>         (required)
  --to <status>                   (required)
  --expected <status>             (optional) Current status the caller expects
  --actor <actor>                 (default: admin:cli)

reconcile OPTIONS:
  --actor <actor>                 (default: admin:cli)

cleanup OPTIONS:
  --older-than-days <n>           (default: 30)
"
    );
}

fn require_database_url(database_url: Option<String>) -> anyhow::Result<String> {
    database_url
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required (or pass --database-url)"))
}

fn require_value(args: &mut VecDeque<String>, flag: &str) -> anyhow::Result<String> {
    args.pop_front()
        .ok_or_else(|| anyhow::anyhow!("missing value for {flag}"))
}

fn parse_status(raw: &str) -> anyhow::Result<DeadLetterStatus> {
    raw.parse::<DeadLetterStatus>()
        .map_err(|e| anyhow::anyhow!(e))
}

async fn connect(database_url: Option<String>) -> anyhow::Result<PgPool> {
    let database_url = require_database_url(database_url)?;
    Ok(PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args: VecDeque<String> = std::env::args().skip(1).collect();
    let Some(command) = args.pop_front() else {
        print_help();
        return Ok(());
    };

    match command.as_str() {
        "-h" | "--help" | "help" => {
            print_help();
            Ok(())
        }
        "migrate" => {
            let mut database_url: Option<String> = None;
            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => {
                        database_url = Some(require_value(&mut args, "--database-url")?);
                    }
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let pool = connect(database_url).await?;
            booking_ingest::migrations::run_postgres(&pool).await?;
            println!("ok: migrations applied");
            Ok(())
        }
        "sign-request" => {
            let mut secret: Option<String> = None;
            let mut method = "POST".to_string();
            let mut path = "/api/v1/ingest/bookings".to_string();
            let mut body: Option<Vec<u8>> = None;
            let mut idempotency_key: Option<String> = None;
            let mut nonce: Option<String> = None;
            let mut timestamp: Option<String> = None;

            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--secret" => secret = Some(require_value(&mut args, "--secret")?),
                    "--method" => method = require_value(&mut args, "--method")?.to_uppercase(),
                    "--path" => path = require_value(&mut args, "--path")?,
                    "--body" => body = Some(require_value(&mut args, "--body")?.into_bytes()),
                    "--body-file" => {
                        let file = require_value(&mut args, "--body-file")?;
                        body = Some(std::fs::read(&file).map_err(|e| {
                            anyhow::anyhow!("failed to read body file {file}: {e}")
                        })?);
                    }
                    "--idempotency-key" => {
                        idempotency_key = Some(require_value(&mut args, "--idempotency-key")?);
                    }
                    "--nonce" => nonce = Some(require_value(&mut args, "--nonce")?),
                    "--timestamp" => timestamp = Some(require_value(&mut args, "--timestamp")?),
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let secret = secret
                .or_else(|| std::env::var("SIGNATURE_SECRET").ok())
                .ok_or_else(|| anyhow::anyhow!("--secret is required (or set SIGNATURE_SECRET)"))?;
            let body = body.unwrap_or_default();
            let idempotency_key = idempotency_key.unwrap_or_else(|| Uuid::new_v4().to_string());
            let nonce = nonce.unwrap_or_else(|| Uuid::new_v4().to_string());
            let timestamp = timestamp.unwrap_or_else(|| Utc::now().to_rfc3339());

            let signature = sign(
                secret.as_bytes(),
                &method,
                &path,
                &timestamp,
                &nonce,
                &idempotency_key,
                &body,
            )?;

            println!("{HEADER_SIGNATURE}: {signature}");
            println!("{HEADER_SIGNATURE_ALGORITHM}: {SIGNATURE_ALGORITHM}");
            println!("{HEADER_TIMESTAMP}: {timestamp}");
            println!("{HEADER_NONCE}: {nonce}");
            println!("{HEADER_IDEMPOTENCY_KEY}: {idempotency_key}");
            Ok(())
        }
        "list-dead-letters" => {
            let mut database_url: Option<String> = None;
            let mut status: Option<DeadLetterStatus> = None;
            let mut limit: Option<usize> = None;

            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => {
                        database_url = Some(require_value(&mut args, "--database-url")?);
                    }
                    "--status" => status = Some(parse_status(&require_value(&mut args, "--status")?)?),
                    "--limit" => limit = Some(require_value(&mut args, "--limit")?.parse()?),
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let pool = connect(database_url).await?;
            let service = DeadLetterService::new(
                Arc::new(PgDeadLetterStore::new(pool.clone())),
                Arc::new(PgAuditLog::new(pool)),
            );
            let entries = service.list(status, limit).await?;
            for entry in &entries {
                println!("{}", serde_json::to_string(entry)?);
            }
            eprintln!("ok: {} entries", entries.len());
            Ok(())
        }
        "transition" => {
            let mut database_url: Option<String> = None;
            let mut key: Option<String> = None;
            let mut to: Option<DeadLetterStatus> = None;
            let mut expected: Option<DeadLetterStatus> = None;
            let mut actor = DEFAULT_ADMIN_ACTOR.to_string();

            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => {
                        database_url = Some(require_value(&mut args, "--database-url")?);
                    }
                    "--key" => key = Some(require_value(&mut args, "--key")?),
                    "--to" => to = Some(parse_status(&require_value(&mut args, "--to")?)?),
                    "--expected" => {
                        expected = Some(parse_status(&require_value(&mut args, "--expected")?)?);
                    }
                    "--actor" => actor = require_value(&mut args, "--actor")?,
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let key = key.ok_or_else(|| anyhow::anyhow!("--key is required"))?;
            let to = to.ok_or_else(|| anyhow::anyhow!("--to is required"))?;

            let pool = connect(database_url).await?;
            let service = DeadLetterService::new(
                Arc::new(PgDeadLetterStore::new(pool.clone())),
                Arc::new(PgAuditLog::new(pool)),
            );
            let updated = service
                .operator_transition(&key, to, expected, &actor)
                .await?;
            println!("ok: {} is now {}", updated.dead_letter_key, updated.status);
            Ok(())
        }
        "reconcile" => {
            let mut database_url: Option<String> = None;
            let mut actor = DEFAULT_ADMIN_ACTOR.to_string();

            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => {
                        database_url = Some(require_value(&mut args, "--database-url")?);
                    }
                    "--actor" => actor = require_value(&mut args, "--actor")?,
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let pool = connect(database_url).await?;
            let reconciler = Reconciler::new(
                Arc::new(PgEventStore::new(pool.clone())),
                Arc::new(PgBookingDomain::new(pool.clone())),
                Arc::new(PgAuditLog::new(pool)),
                Arc::new(MetricsRegistry::new()),
                ReconcileConfig::default(),
            );
            let report = reconciler.run(&actor).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        "cleanup" => {
            let mut database_url: Option<String> = None;
            let mut older_than_days: i32 = 30;

            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => {
                        database_url = Some(require_value(&mut args, "--database-url")?);
                    }
                    "--older-than-days" => {
                        older_than_days = require_value(&mut args, "--older-than-days")?.parse()?;
                    }
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }
            if older_than_days < 1 {
                anyhow::bail!("--older-than-days must be at least 1");
            }

            let pool = connect(database_url).await?;
            let audit_rows = PgAuditLog::new(pool.clone()).cleanup(older_than_days).await?;
            let job_rows = PgJobQueue::new(pool.clone()).cleanup(older_than_days).await?;
            let nonce_rows = PgNonceStore::new(pool).purge_expired(Utc::now()).await?;
            println!(
                "ok: removed {audit_rows} audit events, {job_rows} jobs and {nonce_rows} nonces"
            );
            Ok(())
        }
        "pause-queue" | "resume-queue" => {
            let paused = command == "pause-queue";
            let mut database_url: Option<String> = None;
            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => {
                        database_url = Some(require_value(&mut args, "--database-url")?);
                    }
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let pool = connect(database_url).await?;
            PgJobQueue::new(pool).set_paused(paused).await?;
            println!(
                "ok: queue {}",
                if paused { "paused" } else { "resumed" }
            );
            Ok(())
        }
        other => {
            print_help();
            anyhow::bail!("unknown command: {other}")
        }
    }
}
