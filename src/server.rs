// `server.rs` composes the service: it loads configuration, recovers the
// durable logs, binds the listener, starts the writer on a blocking thread,
// mounts the HTTP routes and, on shutdown, closes the buffer and waits for
// the writer to drain it.
use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Router,
};
use prometheus::Registry;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::buffer::IngestBuffer;
use crate::config::Config;
use crate::handlers::{self, RetryAfter};
use crate::ingest::IngestPipeline;
use crate::log::DurableLog;
use crate::logging;
use crate::metrics::IngestMetrics;
use crate::validator::{SequenceCounter, Validator};
use crate::writer::Writer;

/// Build the HTTP app. `Extension` layers hand the shared pipeline and
/// registry to the handlers.
pub fn router(
    pipeline: IngestPipeline,
    registry: Arc<Registry>,
    max_body_bytes: usize,
    retry_after: RetryAfter,
) -> Router {
    Router::new()
        .route("/sensor-data", post(handlers::receive_sensor_data))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/health", get(handlers::health))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(Extension(pipeline))
        .layer(Extension(retry_after))
        .layer(Extension(registry))
        .layer(TraceLayer::new_for_http())
}

/// Open (and recover) the durable and dead-letter logs. The returned
/// sequence number is the highest found in either file; numbering resumes
/// after it.
pub fn open_logs(config: &Config) -> anyhow::Result<(DurableLog, DurableLog, u64)> {
    let (log, recovered) = DurableLog::open(&config.log_path)
        .with_context(|| format!("opening durable log {}", config.log_path.display()))?;
    let (dead_letter, dl_recovered) =
        DurableLog::open(&config.dead_letter_path).with_context(|| {
            format!("opening dead-letter log {}", config.dead_letter_path.display())
        })?;
    if dl_recovered.entries > 0 {
        info!(
            entries = dl_recovered.entries,
            path = %config.dead_letter_path.display(),
            "dead-letter file holds readings awaiting manual recovery"
        );
    }
    Ok((log, dead_letter, recovered.last_seq.max(dl_recovered.last_seq)))
}

pub async fn run() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    logging::init(&config.log_level, config.log_json)?;
    serve(config, shutdown_signal()).await
}

/// Run the service until `shutdown` resolves, then drain the buffer.
pub async fn serve(
    config: Config,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let registry = Arc::new(Registry::new());
    let metrics = IngestMetrics::register(&registry).context("registering metrics")?;

    let (log, dead_letter, last_seq) = open_logs(&config)?;
    let sequence = SequenceCounter::starting_after(last_seq)
        .with_context(|| format!("sequence numbers exhausted after {last_seq}"))?;

    // The writer thread only exits once the buffer is closed, so everything
    // that can fail happens before it is spawned.
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, next_seq = sequence.peek(), "listening");

    let buffer = Arc::new(IngestBuffer::new(config.buffer_capacity));
    let validator = Validator::new(config.limits(), sequence);
    let pipeline = IngestPipeline::new(validator, buffer.clone(), metrics.clone());

    let writer = Writer::new(
        buffer.clone(),
        Box::new(log),
        Box::new(dead_letter),
        config.writer(),
        metrics,
    )
    .spawn();

    let app = router(
        pipeline,
        registry,
        config.max_body_bytes,
        RetryAfter(config.retry_after_secs),
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;
    if let Err(e) = &served {
        error!(error = %e, "http server stopped with error");
    }

    // In-flight requests are done; stop admitting and let the writer drain.
    buffer.close();
    let stats = writer.await.context("writer task panicked")?;
    info!(
        readings_written = stats.readings_written,
        readings_dead_lettered = stats.readings_dead_lettered,
        readings_lost = stats.readings_lost,
        "shutdown complete"
    );

    served?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;
    use tempfile::TempDir;

    use crate::log::read_log;
    use crate::reading::ValidatedReading;

    fn reading(seq: u64) -> ValidatedReading {
        ValidatedReading {
            seq,
            device_id: "arduino-1".into(),
            metric: "temperature".into(),
            value: 21.5,
            unit: None,
            timestamp: Utc::now(),
            received_at: Utc::now(),
        }
    }

    fn config_in(dir: &TempDir) -> Config {
        Config {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            log_path: dir.path().join("readings.log"),
            dead_letter_path: dir.path().join("dead-letter.log"),
            ..Config::default()
        }
    }

    #[test]
    fn test_sequence_resumes_after_highest_in_either_log() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);

        let (_, _, last_seq) = open_logs(&config).unwrap();
        assert_eq!(last_seq, 0);

        {
            let (mut log, mut dead_letter, _) = open_logs(&config).unwrap();
            log.append_batch(&[reading(1), reading(2), reading(3)]).unwrap();
            dead_letter.append_batch(&[reading(7), reading(8)]).unwrap();
            log.append_batch(&[reading(9)]).unwrap();
        }
        let (_, _, last_seq) = open_logs(&config).unwrap();
        assert_eq!(last_seq, 9);

        {
            let (_, mut dead_letter, _) = open_logs(&config).unwrap();
            dead_letter.append_batch(&[reading(12)]).unwrap();
        }
        let (_, _, last_seq) = open_logs(&config).unwrap();
        assert_eq!(last_seq, 12);
        assert_eq!(SequenceCounter::starting_after(last_seq).unwrap().peek(), 13);
    }

    #[test]
    fn test_bind_failure_returns_an_error() {
        let dir = TempDir::new().unwrap();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = Config {
            bind_addr: taken.local_addr().unwrap(),
            ..config_in(&dir)
        };

        // Dropping the runtime waits for blocking tasks, so a writer left
        // running would keep this thread from finishing.
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        std::thread::spawn(move || {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let result = rt.block_on(serve(config, std::future::pending()));
            drop(rt);
            let _ = done_tx.send(result.map_err(|e| format!("{e:#}")));
        });

        let result = done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("serve did not return after the bind failed");
        let err = result.expect_err("binding a taken port must fail");
        assert!(err.contains("binding"), "{err}");
        drop(taken);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_serve_stops_on_shutdown_signal() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        let log_path = config.log_path.clone();

        tokio::time::timeout(Duration::from_secs(5), serve(config, async {}))
            .await
            .expect("serve did not stop")
            .expect("serve failed");

        assert!(read_log(&log_path).unwrap().is_empty());
    }
}
