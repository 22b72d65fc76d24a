use anyhow::Result;
use clap::{Parser, Subcommand};
use rand::Rng;
use ride_sync::{
    config, init_telemetry, HttpOrderBackend, InMemoryBackend, Location, OrderBackend, OrderRequest,
    OrderStatus, OrderSyncEngine, RideSyncConfig, ShutdownCoordinator, SyncEvent,
};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "ride-sync")]
#[command(about = "Order lifecycle synchronization for ride-hailing drivers")]
#[command(long_about = "ride-sync keeps a driver's local view of ride orders consistent with the \
                       ride backend: it polls tracked orders, arbitrates acceptance races and pages \
                       through order history. Try 'ride-sync simulate' to watch it against an \
                       in-memory backend.")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine against a simulated backend and print every event
    Simulate {
        /// Number of orders to create
        #[arg(long, default_value = "3")]
        orders: u32,
        /// Probability that a simulated poll fails
        #[arg(long, default_value = "0.2")]
        failure_rate: f64,
        /// Seconds between polls
        #[arg(long, default_value = "1")]
        interval: u64,
    },
    /// Track one order on the configured backend until Ctrl-C
    Track {
        order_id: String,
    },
    /// Try to accept an open order
    Accept {
        order_id: String,
        #[arg(long)]
        driver: String,
    },
    /// Page through order history
    History {
        /// Maximum number of pages to load
        #[arg(long, default_value = "1")]
        pages: u32,
    },
    /// List orders open for acceptance
    Available,
    /// Show the effective configuration
    Config {
        /// Write the effective configuration to ride-sync.toml
        #[arg(long)]
        save: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = config()?;
    init_telemetry(&settings.observability)?;

    match cli.command {
        None => {
            println!("🚕 ride-sync: run 'ride-sync --help' to see available commands");
            Ok(())
        }
        Some(Commands::Simulate { orders, failure_rate, interval }) => {
            tokio::runtime::Runtime::new()?.block_on(async {
                simulate_command(settings, orders, failure_rate, interval).await
            })
        }
        Some(Commands::Track { order_id }) => {
            tokio::runtime::Runtime::new()?.block_on(async {
                track_command(settings, &order_id).await
            })
        }
        Some(Commands::Accept { order_id, driver }) => {
            tokio::runtime::Runtime::new()?.block_on(async {
                accept_command(settings, &order_id, &driver).await
            })
        }
        Some(Commands::History { pages }) => {
            tokio::runtime::Runtime::new()?.block_on(async {
                history_command(settings, pages).await
            })
        }
        Some(Commands::Available) => {
            tokio::runtime::Runtime::new()?.block_on(async {
                available_command(settings).await
            })
        }
        Some(Commands::Config { save }) => config_command(settings, save),
    }
}

fn http_engine(settings: &RideSyncConfig) -> Result<Arc<OrderSyncEngine>> {
    let backend: Arc<dyn OrderBackend> = Arc::new(HttpOrderBackend::new(&settings.backend)?);
    Ok(Arc::new(OrderSyncEngine::new(backend, settings)))
}

fn print_events(engine: &OrderSyncEngine) {
    engine.subscribe(|event: &SyncEvent| match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(e) => eprintln!("⚠️  Could not encode event: {e}"),
    });
}

async fn simulate_command(settings: &RideSyncConfig, orders: u32, failure_rate: f64, interval: u64) -> Result<()> {
    println!("🧪 Simulating {} orders (poll every {}s, failure rate {:.0}%)", orders, interval, failure_rate * 100.0);
    println!();

    let backend = Arc::new(InMemoryBackend::new());
    let mut tracking = settings.tracking.clone();
    tracking.poll_interval_secs = interval;
    let engine = Arc::new(OrderSyncEngine::with_settings(
        Arc::clone(&backend) as Arc<dyn OrderBackend>,
        tracking,
        &settings.history,
    ));
    print_events(&engine);

    let mut ids = Vec::new();
    for i in 0..orders {
        let request = OrderRequest {
            pickup: Location::new(35.68 + f64::from(i) * 0.01, 139.76).with_address("Pickup"),
            destination: Location::new(35.63, 139.88).with_address("Drop-off"),
            scheduled_at: None,
            passenger_count: 1,
            service_options: Default::default(),
        };
        ids.push(engine.create_order(&request).await?.id);
    }
    backend.set_failure_rate(failure_rate);

    // Walk every order through its lifecycle on the backend side only; the
    // engine learns about each step by polling.
    let lifecycle = [
        OrderStatus::Matching,
        OrderStatus::Matched,
        OrderStatus::DriverEnRoute,
        OrderStatus::Arrived,
        OrderStatus::InProgress,
        OrderStatus::Completed,
    ];
    let step = Duration::from_secs(interval.max(1));
    for status in lifecycle {
        for id in &ids {
            if rand::rng().random_bool(0.1) && status.is_open() {
                backend.set_status(id, OrderStatus::Cancelled);
            } else if backend.order(id).is_some_and(|o| o.is_active()) {
                backend.set_status(id, status);
            }
        }
        tokio::time::sleep(step * 2).await;
    }

    for id in &ids {
        engine.acknowledge(id);
    }
    ShutdownCoordinator::new(Arc::clone(&engine), Duration::from_secs(2))
        .shutdown()
        .await;

    println!();
    println!("✅ Simulation finished");
    Ok(())
}

async fn track_command(settings: &RideSyncConfig, order_id: &str) -> Result<()> {
    let engine = http_engine(settings)?;
    print_events(&engine);

    let order = engine.refresh_order(order_id).await?;
    println!("📍 Tracking {} (currently {})", order.id, order.status);
    engine.track(order_id);

    ShutdownCoordinator::new(engine, Duration::from_secs(5))
        .wait_for_shutdown()
        .await
}

async fn accept_command(settings: &RideSyncConfig, order_id: &str, driver_id: &str) -> Result<()> {
    let engine = http_engine(settings)?;
    match engine.attempt_accept(order_id, driver_id).await {
        Ok(order) => {
            println!("✅ Accepted {} ({})", order.id, order.status);
        }
        Err(e) if e.is_informational() => {
            println!("ℹ️  {e}");
        }
        Err(e) => return Err(e.into()),
    }
    engine.shutdown(Duration::from_secs(1)).await;
    Ok(())
}

async fn history_command(settings: &RideSyncConfig, pages: u32) -> Result<()> {
    let engine = http_engine(settings)?;
    engine.load_history().await?;
    for _ in 1..pages {
        if engine.load_more_history().await?.is_none() {
            break;
        }
    }

    let orders = engine.history().await;
    println!("📜 {} orders{}", orders.len(), if engine.history_has_more().await { " (more available)" } else { "" });
    for order in orders {
        println!("  {}  {:<14} {}", order.id, order.status.as_str(), order.updated_at.format("%Y-%m-%d %H:%M"));
    }
    Ok(())
}

async fn available_command(settings: &RideSyncConfig) -> Result<()> {
    let engine = http_engine(settings)?;
    let orders = engine.refresh_available_orders().await?;
    if orders.is_empty() {
        println!("📋 No open orders right now");
        return Ok(());
    }
    for order in orders {
        println!(
            "  {}  {} passenger(s)  ({:.4}, {:.4}) -> ({:.4}, {:.4})",
            order.id,
            order.passenger_count,
            order.pickup.latitude,
            order.pickup.longitude,
            order.destination.latitude,
            order.destination.longitude
        );
    }
    Ok(())
}

fn config_command(settings: &RideSyncConfig, save: bool) -> Result<()> {
    if save {
        settings.save_to_file("ride-sync.toml")?;
        println!("💾 Wrote ride-sync.toml");
    } else {
        print!("{}", toml::to_string_pretty(settings)?);
    }
    Ok(())
}
