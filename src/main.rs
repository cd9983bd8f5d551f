//! tiercache demo
//!
//! Drives a simulated metered-RPC workload through the cache and reports what
//! the cache saved.
//!
//! ```text
//! ┌──────────────┐   get_or_fetch   ┌──────────────┐  miss   ┌────────────────┐
//! │   workload   │─────────────────▶│ CacheManager │────────▶│ BatchProcessor │──▶ origin
//! │ (N requests) │                  │  + dedup     │         │  (by address)  │   (sleep)
//! └──────────────┘                  └──────────────┘         └────────────────┘
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use clap::Parser;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{filter::Directive, fmt, prelude::*, EnvFilter};

use tiercache::batch::{BatchConfig, BatchProcessor, ResultMapper};
use tiercache::cache::{CacheManager, SetOptions};
use tiercache::config::CacheConfig;
use tiercache::error::{Error, Result};
use tiercache::metrics::MetricsExporter;

// =============================================================================
// CLI Arguments
// =============================================================================

/// tiercache - tiered caching for metered RPC calls
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "TIERCACHE_CONFIG")]
    config: Option<String>,

    /// Requests to simulate
    #[arg(long, env = "TIERCACHE_REQUESTS", default_value = "2000")]
    requests: usize,

    /// Distinct addresses queried
    #[arg(long, env = "TIERCACHE_KEYS", default_value = "64")]
    keys: usize,

    /// Requests in flight at once
    #[arg(long, env = "TIERCACHE_CONCURRENCY", default_value = "32")]
    concurrency: usize,

    /// Simulated origin round trip per batch
    #[arg(long, env = "TIERCACHE_ORIGIN_LATENCY_MS", default_value = "25")]
    origin_latency_ms: u64,

    /// Serve /metrics and /healthz here after the run (until Ctrl-C)
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = match &args.config {
        Some(path) => CacheConfig::from_file(path)?,
        None => CacheConfig::default(),
    };

    info!("Starting tiercache simulation");
    info!("  Requests: {}", args.requests);
    info!("  Distinct keys: {}", args.keys);
    info!("  Concurrency: {}", args.concurrency);
    info!("  Origin latency: {} ms", args.origin_latency_ms);

    let cache = CacheManager::new(config)?;
    let origin = origin(Duration::from_millis(args.origin_latency_ms));

    let started = Instant::now();
    run_workload(&cache, &origin, &args).await;
    origin.wait_for_all().await;
    cache.flush_writes().await;

    report(&cache, &origin, started.elapsed());

    if let Some(addr) = &args.metrics_addr {
        let exporter = Arc::new(MetricsExporter::new()?);
        exporter.update(&cache);

        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
            trigger.cancel();
        });

        run_metrics_server(addr, cache.clone(), exporter, shutdown).await?;
    }

    info!("tiercache shutdown complete");
    Ok(())
}

// =============================================================================
// Workload
// =============================================================================

type Origin = BatchProcessor<String, (String, Bytes)>;

/// Simulated upstream: one round trip answers a whole batch of balance
/// lookups, in no particular order
fn origin(latency: Duration) -> Origin {
    BatchProcessor::with_mapper(
        BatchConfig {
            max_batch_size: 20,
            max_wait_time: Duration::from_millis(5),
            concurrency: 4,
        },
        move |addresses: Vec<String>| async move {
            tokio::time::sleep(latency).await;
            Ok(addresses
                .into_iter()
                .rev()
                .map(|address| {
                    let balance = Bytes::from(format!("0x{:x}", address.len() * 1_000_000_007));
                    (address, balance)
                })
                .collect())
        },
        ResultMapper::by_key(|address: &String| address.clone(), |(address, _): &(String, Bytes)| address.clone()),
    )
}

async fn run_workload(cache: &CacheManager, origin: &Origin, args: &Args) {
    let keys = args.keys.max(1);

    stream::iter(0..args.requests)
        .for_each_concurrent(args.concurrency.max(1), |i| async move {
            // Quadratic residues give a skewed, repeatable key mix
            let address = format!("0x{:040x}", (i * i + 7 * i) % keys);
            let key = format!("eth:1:balance:{}", address);
            let options = SetOptions::default().billable("eth_getBalance");

            let origin = origin.clone();
            let fetch = move || async move { origin.add(address).await.map(|(_, balance)| balance) };

            if let Err(e) = cache.get_or_fetch(&key, options, fetch).await {
                warn!(key = %key, error = %e, "Request failed");
            }
        })
        .await;
}

fn report(cache: &CacheManager, origin: &Origin, elapsed: Duration) {
    let stats = cache.stats();
    info!(
        hits = stats.requests.hits,
        misses = stats.requests.misses,
        hit_ratio = %format!("{:.3}", stats.hit_ratio),
        items = stats.item_count,
        bytes = stats.total_size,
        elapsed_ms = elapsed.as_millis() as u64,
        "Cache stats"
    );

    for (name, d) in cache.dedup_stats() {
        info!(
            dedup = name,
            total = d.total_requests,
            joined = d.deduplicated_requests,
            reused = d.cache_hits,
            "Deduplicator stats"
        );
    }

    let batches = origin.stats();
    info!(
        batches = batches.total_batches,
        items = batches.total_items,
        avg_batch_size = %format!("{:.1}", batches.avg_batch_size),
        "Origin batches"
    );

    if let Some(tracker) = cache.cost_tracker() {
        let summary = tracker.summary();
        info!(
            calls = summary.total_calls,
            cached = summary.cached_calls,
            spent = %format!("${:.6}", summary.total_cost),
            saved = %format!("${:.6}", summary.total_savings),
            savings_pct = %format!("{:.1}", summary.savings_percentage),
            "Cost summary"
        );
        for line in tracker.export_csv().lines() {
            info!("  {}", line);
        }
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "hyper_util=warn"] {
        if let Ok(d) = directive.parse::<Directive>() {
            filter = filter.add_directive(d);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(
    addr: &str,
    cache: CacheManager,
    exporter: Arc<MetricsExporter>,
    shutdown: CancellationToken,
) -> Result<()> {
    use http_body_util::Full;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(body.into()));
        *response.status_mut() = status;
        response
    }

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid metrics server address: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind metrics server: {}", e)))?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Metrics server stopping");
                return Ok(());
            }
            accepted = listener.accept() => accepted
                .map_err(|e| Error::Internal(format!("Metrics server accept error: {}", e)))?,
        };

        let io = TokioIo::new(stream);
        let cache = cache.clone();
        let exporter = Arc::clone(&exporter);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let cache = cache.clone();
                let exporter = Arc::clone(&exporter);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" => respond(StatusCode::OK, "ok"),
                        "/metrics" => {
                            exporter.update(&cache);
                            match exporter.render() {
                                Ok(text) => {
                                    let mut response = respond(StatusCode::OK, text);
                                    response
                                        .headers_mut()
                                        .insert(CONTENT_TYPE, HeaderValue::from_static(exporter.content_type()));
                                    response
                                }
                                Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                            }
                        }
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Metrics server connection error: {}", e);
            }
        });
    }
}
