//! Ticket counter demo binary
//!
//! Opens two sessions on one authoritative store, as two tabs of the same
//! device would, and shows a mutation on one reaching the other.
//!
//! Uses `PostgreSQL` for the store and the broadcast topic when `DATABASE_URL`
//! is set, in-memory stand-ins otherwise.

use std::sync::Arc;
use std::time::Duration;
use ticket_counter::{Config, SessionEnvironment, SyncSession};
use ticket_sync_core::channel::BroadcastBus;
use ticket_sync_core::environment::{Clock, SystemClock};
use ticket_sync_core::store::CounterStore;
use ticket_sync_postgres::{PostgresBroadcastBus, PostgresCounterStore};
use ticket_sync_runtime::metrics::MetricsServer;
use ticket_sync_runtime::propagation::Fanout;
use ticket_sync_testing::memory::{InMemoryBroadcastBus, InMemoryCounterStore, InMemoryTabStorage};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env if present
    dotenvy::dotenv().ok();

    let config = Config::from_env();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_new(&config.observability.log_level)
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut metrics = MetricsServer::new(config.observability.metrics_addr);
    if config.observability.metrics_enabled {
        metrics.start()?;
    }

    println!("=== Ticket Counter ===\n");

    let (store, bus): (Arc<dyn CounterStore>, Arc<dyn BroadcastBus>) = match &config.database.url {
        Some(url) => {
            let store = PostgresCounterStore::with_max_connections(url, config.database.max_connections).await?;
            store.migrate().await?;
            println!("Store: PostgreSQL (broadcast over NOTIFY)");
            let bus = PostgresBroadcastBus::new(store.pool().clone());
            (Arc::new(store), Arc::new(bus))
        },
        None => {
            println!("Store: in-memory (set DATABASE_URL for PostgreSQL)");
            (Arc::new(InMemoryCounterStore::new()), Arc::new(InMemoryBroadcastBus::new()))
        },
    };

    let device = InMemoryTabStorage::new();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let open = |tab| {
        let fanout = Fanout::new(Arc::clone(&store), Arc::clone(&bus), Arc::new(tab), config.fanout_config());
        SessionEnvironment::new(Arc::clone(&store), Arc::new(fanout), Arc::clone(&clock))
    };
    let console = SyncSession::connect(open(device.open_tab()), config.session_options()).await?;
    let display = SyncSession::connect(open(device.open_tab()), config.session_options()).await?;

    println!("Initial value: {}", console.displayed_value().await);

    println!("\n>>> Console: Increment x3, Decrement");
    for _ in 0..3 {
        console.increment().await?;
    }
    console.decrement().await?;
    println!("Console shows: {}", console.displayed_value().await);

    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("Display shows: {}", display.displayed_value().await);

    println!("\n>>> Console: Undo last increment");
    console.undo_last_increment().await?;
    if let Some(message) = console.error_message().await {
        println!("Undo failed: {message}");
    }
    println!("Console shows: {}", console.displayed_value().await);

    println!("\n>>> Display: Set to \"550\"");
    display.set_to_entry("550").await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("Console shows: {}", console.displayed_value().await);

    println!("\n>>> Stats export\n{}", console.export_csv().await);

    if let Some(rendered) = metrics.render() {
        println!("Metrics:\n{rendered}");
    }

    console.close().await?;
    display.close().await?;

    println!("=== Done ===");
    Ok(())
}
