use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, Semaphore};
use tracing::info;

use roomkeeper::auth::PasswordAuth;
use roomkeeper::config::Config;
use roomkeeper::engine::{Engine, RoomStore};
use roomkeeper::notify::NotifyHub;
use roomkeeper::sweeper::{self, AutoCancelLate, AutoFinishDay, ConvertPending, SweepDuty};
use roomkeeper::wire;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    roomkeeper::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;

    let store = Arc::new(RoomStore::open(&config.wal_path(), config.lock_timeout)?.with_commit_timeout(config.commit_timeout));
    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(store.clone(), notify.clone()).with_commit_retries(config.commit_retries));
    let auth = Arc::new(PasswordAuth::new(config.password.clone()));

    // Default dispatcher: every domain event goes to the log.
    let mut events = notify.subscribe_all();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(
                    kind = ?event.kind,
                    booking = ?event.booking_id,
                    schedule = ?event.schedule_id,
                    room = ?event.room_id,
                    "domain event"
                ),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("event log lagged, {n} event(s) dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let duties: Vec<Arc<dyn SweepDuty>> = vec![
        Arc::new(AutoCancelLate {
            grace: config.grace,
            every: config.auto_cancel_interval,
        }),
        Arc::new(AutoFinishDay {
            cutoff: config.day_cutoff,
            offset: config.utc_offset,
        }),
        Arc::new(ConvertPending {
            every: config.convert_interval,
        }),
    ];
    for duty in duties {
        tokio::spawn(sweeper::run_duty(engine.clone(), duty));
    }
    tokio::spawn(sweeper::run_compactor(store.clone(), config.compact_threshold));

    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("roomkeeper listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {max_connections}");
    info!("  day cutoff: {} (UTC{})", config.day_cutoff.format("%H:%M"), config.utc_offset);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(roomkeeper::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(roomkeeper::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(roomkeeper::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                let auth = auth.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, engine, auth).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(roomkeeper::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    info!("roomkeeper stopped");
    Ok(())
}
