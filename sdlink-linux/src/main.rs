// sdlink Linux daemon: answers desktop discovery, accepts or dials the sync link, stores books.

mod config;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use config::{Config, Target};
use sdlink_core::{Callbacks, ErrorKind, FsStorage, SyncContext, SyncError};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wait between attempts to reach a desktop we dial ourselves.
const REDIAL_INTERVAL: Duration = Duration::from_secs(5);
/// How long one broadcast search for a desktop lasts.
const LOCATE_TIMEOUT: Duration = Duration::from_secs(3);

const USAGE: &str = "usage: sdlink-linux [--config <path>] [--verbose] [--version] [--help]";

struct Args {
    config: Option<PathBuf>,
    verbose: bool,
}

fn parse_args() -> anyhow::Result<Option<Args>> {
    let mut args = Args {
        config: None,
        verbose: false,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("sdlink-linux {}", VERSION);
                return Ok(None);
            }
            "--help" | "-h" => {
                println!("{USAGE}");
                return Ok(None);
            }
            "--verbose" | "-v" => args.verbose = true,
            "--config" | "-c" => {
                let path = it.next().context("--config needs a path")?;
                args.config = Some(PathBuf::from(path));
            }
            other => anyhow::bail!("unknown argument {other:?}\n{USAGE}"),
        }
    }
    Ok(Some(args))
}

fn main() -> anyhow::Result<()> {
    let Some(args) = parse_args()? else {
        return Ok(());
    };

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cfg = config::load(args.config.as_deref())?;
    let target = cfg.target()?;
    std::fs::create_dir_all(&cfg.books_root)
        .with_context(|| format!("creating {}", cfg.books_root.display()))?;
    info!(
        "sdlink-linux {} as {:?}, books under {}",
        VERSION,
        cfg.device.name,
        cfg.books_root.join(&cfg.device.books_dir).display()
    );

    let ctx = SyncContext::new(
        cfg.device.clone(),
        FsStorage::new(&cfg.books_root),
        logging_callbacks(),
    )
    .context("setting up sync context")?;
    let cancel = ctx.cancel_handle();
    let stop = Arc::new(AtomicBool::new(false));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let worker_stop = stop.clone();
        let mut worker = tokio::task::spawn_blocking(move || run(ctx, &cfg, target, &worker_stop));
        tokio::select! {
            done = &mut worker => return done?,
            r = shutdown_signal() => r?,
        }
        info!("Shutting down");
        stop.store(true, Ordering::SeqCst);
        cancel.cancel();
        worker.await?
    })
}

fn logging_callbacks() -> Callbacks {
    let mut last_logged = Instant::now();
    Callbacks::new()
        .on_progress(move |done, total| {
            if done == total || last_logged.elapsed() >= Duration::from_secs(1) {
                last_logged = Instant::now();
                info!("Receiving: {}/{} bytes", done, total);
            }
            true
        })
        .on_book_received(|meta, path| {
            info!("Stored {:?} ({} bytes) at {}", meta.title, meta.size, path)
        })
        .on_message(|msg| info!("Desktop says: {}", msg))
        .on_book_deleted(|lpath| info!("Deleted {}", lpath))
}

/// Blocking sync loop. Returns when `stop` is set or the setup cannot continue.
fn run(mut ctx: SyncContext, cfg: &Config, target: Target, stop: &AtomicBool) -> anyhow::Result<()> {
    let tick = Duration::from_millis(cfg.poll_interval_ms.max(1));
    if let Target::Listen(port) = target {
        let port = ctx.listen(port).context("opening the sync listener")?;
        if let Err(e) = ctx.start_discovery(port) {
            warn!("Discovery unavailable, desktop must connect to port {} directly: {}", port, e);
        }
    }

    let mut next_dial = Instant::now();
    while !stop.load(Ordering::SeqCst) {
        if !ctx.is_connected() && Instant::now() >= next_dial {
            let dialled = match &target {
                Target::Listen(_) => Ok(()),
                Target::Dial(host, port) => ctx.connect(host, *port),
                Target::Locate => ctx.connect_discovered(LOCATE_TIMEOUT).map(|_| ()),
            };
            if dialled.is_err() {
                next_dial = Instant::now() + REDIAL_INTERVAL;
            }
        }
        if let Err(e) = ctx.poll(tick) {
            report(&e, stop);
        }
    }
    ctx.shutdown();
    Ok(())
}

fn report(e: &SyncError, stop: &AtomicBool) {
    match e.kind() {
        ErrorKind::Cancelled if stop.load(Ordering::SeqCst) => {}
        ErrorKind::PeerDisconnected => info!("Desktop disconnected"),
        ErrorKind::AuthFailure => error!("Desktop refused us: {}", e),
        ErrorKind::Busy => warn!("Desktop is busy with another device"),
        _ => warn!("Sync error: {}", e),
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
