use std::sync::Arc;

use pickup_tracker::config::TrackerConfig;
use pickup_tracker::error::{DatabaseError, Error, Result};
use pickup_tracker::parcels::{ParcelCounts, ParcelQuery, ParcelRecord, StatusFilter};
use pickup_tracker::pipeline::{Classifier, Reconciler};
use pickup_tracker::sources::JsonlFileSource;
use pickup_tracker::store::{LibSqlBackend, ParcelStore};

const USAGE: &str = "usage: pickup-tracker [sync | list [all|pending|picked_up] [search] [--json] | pickup <id> | reset <id> | stats]";

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(e) = run(&args).await {
        match &e {
            Error::Usage(usage) => eprintln!("{usage}"),
            Error::Source(source) if source.is_permission_denied() => {
                eprintln!("Error: cannot read messages ({source}). Grant read access and retry.")
            }
            other => eprintln!("Error: {other}"),
        }
        std::process::exit(e.exit_code());
    }
}

async fn run(args: &[String]) -> Result<()> {
    let config = TrackerConfig::from_env()?;
    let command = args.first().map(String::as_str).unwrap_or("sync");

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn ParcelStore> = Arc::new(LibSqlBackend::new_local(&config.db_path).await?);
    let reconciler = Reconciler::with_capacity(Arc::clone(&store), config.event_capacity);

    match command {
        "sync" => {
            let source = JsonlFileSource::new(&config.inbox_path);
            let report = reconciler.refresh(&source, &Classifier::default()).await?;
            eprintln!(
                "📦 Synced {}: {} new, {} merged, {} already known, {} failed",
                source.path().display(),
                report.inserted,
                report.merged,
                report.skipped_existing,
                report.failed
            );
        }
        "list" => {
            let mut query = ParcelQuery {
                status: StatusFilter::All,
                search: None,
            };
            let mut json = false;
            for arg in &args[1..] {
                if arg == "--json" {
                    json = true;
                } else if let Ok(status) = arg.parse::<StatusFilter>() {
                    query.status = status;
                } else {
                    query.search = Some(arg.clone());
                }
            }

            let records = query.apply(store.list_all().await?);
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                for record in &records {
                    println!("{}", format_record(record));
                }
            }
        }
        "pickup" => {
            let id = parse_id(args.get(1))?;
            let record = store
                .get_by_id(id)
                .await?
                .ok_or_else(|| DatabaseError::NotFound {
                    entity: "parcel".into(),
                    id: id.to_string(),
                })?;
            let updated = reconciler.mark_picked_up(&record).await?;
            println!("{}", format_record(&updated));
        }
        "reset" => {
            let id = parse_id(args.get(1))?;
            match reconciler.reset_to_pending(id).await? {
                Some(record) => println!("{}", format_record(&record)),
                None => eprintln!("No parcel with id {id}, nothing to reset"),
            }
        }
        "stats" => {
            let records = store.list_all().await?;
            let counts = ParcelCounts::tally(&records);
            println!(
                "all: {}  pending: {}  picked up: {}",
                counts.all, counts.pending, counts.picked_up
            );
        }
        _ => return Err(Error::Usage(USAGE.into())),
    }

    Ok(())
}

fn parse_id(arg: Option<&String>) -> Result<i64> {
    arg.and_then(|raw| raw.parse::<i64>().ok())
        .ok_or_else(|| Error::Usage(USAGE.into()))
}

fn format_record(record: &ParcelRecord) -> String {
    let picked = record
        .pickup_time()
        .map(|at| format!(" picked up {}", at.format("%m-%d %H:%M")))
        .unwrap_or_default();
    format!(
        "#{:<4} {:<10} code {:<8} locker {:<4} {} ({}){}",
        record.id.unwrap_or_default(),
        record.status(),
        record.pickup_code,
        record.locker_number,
        record.location,
        record.receive_time.format("%m-%d %H:%M"),
        picked
    )
}
