use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use log::{info, warn};
use serde_json::json;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;

use dnslbd::config::Config;
use dnslbd::context::Context;
use dnslbd::metrics::Metrics;

#[derive(Parser, Debug)]
#[command(name = "dnslbd")]
#[command(about = "UDP DNS load balancing daemon")]
struct Args {
    /// Path to config file
    #[arg(long, value_name = "PATH", default_value = "/etc/dnslb/dnslb.toml")]
    config: PathBuf,
    /// Validate the configuration, print a summary and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let cfg = Config::load(&args.config)?;
    cfg.validate()?;

    if args.check_config {
        let summary = json!({
            "workers": cfg.runtime.workers,
            "policy": format!("{:?}", cfg.balancing.policy),
            "frontends": cfg.frontends.iter().map(|f| f.listen.to_string()).collect::<Vec<_>>(),
            "forwarders": cfg.forwarders.iter().map(|f| f.address.to_string()).collect::<Vec<_>>(),
        });
        println!("{summary}");
        return Ok(());
    }

    let metrics = Arc::new(Metrics::new());
    let mut ctx = Context::new(&cfg, Arc::clone(&metrics))?;
    let mut handles = ctx.spawn().await?;
    info!(
        "serving {} frontend(s) with {} worker(s)",
        cfg.frontends.len(),
        cfg.runtime.workers
    );

    handles.push(spawn_stats_logger(Arc::clone(&metrics), Arc::clone(&ctx)));

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                break;
            }
            _ = sighup.recv() => {
                info!("SIGHUP received, reloading configuration");
                match reload(&args.config, &metrics, &ctx).await {
                    Ok((next, next_handles)) => {
                        ctx.begin_shutdown();
                        for handle in handles.drain(..) {
                            let _ = handle.await;
                        }
                        info!(
                            "previous generation drained ({} still in flight)",
                            ctx.in_flight()
                        );
                        ctx = next;
                        handles = next_handles;
                    }
                    Err(e) => warn!("reload failed, keeping current configuration: {e:#}"),
                }
            }
        }
    }

    ctx.begin_shutdown();
    for handle in handles {
        let _ = handle.await;
    }
    info!("shutdown complete ({} in flight)", ctx.in_flight());
    Ok(())
}

/// Periodic counter line for operators, tied to one context generation:
/// the cumulative counters plus the context's in-flight and tracked-entry
/// gauges. Exits when the generation shuts down.
fn spawn_stats_logger(metrics: Arc<Metrics>, ctx: Arc<Context>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown = ctx.shutdown_signal();
        let mut tick = tokio::time::interval(Duration::from_secs(10));
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    info!(
                        "stats: accepted={} forwarded={} replied={} probes={} misses={} expired={} errors={} in_flight={} tracked={}",
                        metrics.queries_accepted(),
                        metrics.queries_forwarded(),
                        metrics.replies_sent(),
                        metrics.probes_sent(),
                        metrics.correlation_misses(),
                        metrics.expired_evictions(),
                        metrics.recv_errors() + metrics.parse_errors() + metrics.send_errors(),
                        ctx.in_flight(),
                        ctx.tracked_entries(),
                    );
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

/// Start a successor generation and link it as the reload target, so the
/// draining predecessor can route late replies through it.
async fn reload(
    path: &Path,
    metrics: &Arc<Metrics>,
    current: &Arc<Context>,
) -> anyhow::Result<(Arc<Context>, Vec<JoinHandle<()>>)> {
    let cfg = Config::load(path)?;
    cfg.validate()?;
    let next = Context::new(&cfg, Arc::clone(metrics))?;
    let mut handles = next.spawn().await?;
    handles.push(spawn_stats_logger(Arc::clone(metrics), Arc::clone(&next)));
    current.set_reload_target(Arc::clone(&next));
    Ok((next, handles))
}
