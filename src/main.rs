//! weave node startup: configuration, logging, scan loop wiring.
//!
//! The TLS transport, wire codec and discovery attach through
//! [`weave::proto::Connection`] and live outside this crate.

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use weave::config::Config;
use weave::model::Model;
use weave::proto::DEFAULT_REPO;
use weave::scanner::Walker;
use weave::suppressor::Suppressor;
use weave::{cache, scanner};

/// Environment variable holding a tracing filter directive, e.g.
/// "weave::puller=debug".
const TRACE_ENV: &str = "WEAVE_TRACE";

/// Set in a freshly exec'd replacement process; the parent needs a moment to
/// release its sockets.
const RESTART_ENV: &str = "WEAVE_RESTART";

#[derive(Parser)]
#[command(name = "weave", about = "Peer-to-peer file synchronization node", version)]
struct Cli {
    /// Configuration directory
    #[arg(long, default_value = "~/.weave")]
    home: PathBuf,

    /// More verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_env(TRACE_ENV).unwrap_or_else(|_| {
        EnvFilter::new(if cli.verbose { "debug" } else { "info" })
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(cli).await {
        eprintln!("weave: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if std::env::var_os(RESTART_ENV).is_some() {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    let home = expand_tilde(&cli.home);
    std::fs::create_dir_all(&home)
        .with_context(|| format!("create config directory {}", home.display()))?;

    let cfg_path = home.join("config.toml");
    let cfg = if cfg_path.exists() {
        Config::load(&cfg_path)?
    } else {
        info!(path = %cfg_path.display(), "no config file; writing defaults");
        let cfg = Config::default();
        cfg.save(&cfg_path)?;
        cfg
    };

    let dir = expand_tilde(&cfg.repository);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create repository {}", dir.display()))?;
    info!(repository = %dir.display(), "starting");

    let model = Model::new(&dir);
    if cfg.max_send_kbps > 0 {
        model.limit_send_rate(cfg.max_send_kbps);
    }

    // Warm start from the persisted index, then walk for real.
    if let Some(cached) = cache::load_index(&home, DEFAULT_REPO, &dir) {
        debug!(files = cached.len(), "seeding from index cache");
        model.seed_local(cached);
    }

    let suppressor = Arc::new(Suppressor::new(cfg.max_change_kbps));
    let walker = Walker::new(&dir)
        .follow_symlinks(cfg.follow_symlinks)
        .with_current_filer(Arc::clone(&model) as Arc<dyn scanner::CurrentFiler>)
        .with_suppressor(suppressor as Arc<dyn scanner::Suppress>);

    let walker = rescan(walker, &model, &home, &dir).await?;

    for addr in &cfg.listen_address {
        info!(addr = %addr, "transport listen address configured");
    }
    if cfg.gui_enabled {
        info!(addr = %cfg.gui_address, "GUI address configured");
    }

    if cfg.read_only {
        info!("ready to synchronize (read only; no external updates accepted)");
    } else {
        if cfg.allow_delete {
            info!("deletes from peer nodes are allowed");
        } else {
            info!("deletes from peer nodes will be ignored");
        }
        model.start_rw(cfg.allow_delete, cfg.parallel_requests);
        info!("ready to synchronize (read-write)");
    }

    tokio::spawn(rescan_loop(
        walker,
        Arc::clone(&model),
        home,
        dir,
        Duration::from_secs(cfg.rescan_interval_s.max(1)),
    ));

    std::future::pending::<()>().await;
    Ok(())
}

/// One scan pass: sweep temporaries, walk, install the result, persist the
/// cache. A failed walk keeps the previous index rather than tombstoning
/// everything.
async fn rescan(
    mut walker: Walker,
    model: &Arc<Model>,
    home: &Path,
    dir: &Path,
) -> anyhow::Result<Walker> {
    let (walker, files) = tokio::task::spawn_blocking(move || {
        walker.clean_temp_files();
        let files = walker.walk();
        (walker, files)
    })
    .await?;

    match files {
        Ok(files) => {
            debug!(files = files.len(), "scan complete");
            model.replace_local(files);

            // TODO: skip the save when the index has not changed since the
            // last pass.
            let index = model.protocol_index();
            if let Err(e) = cache::save_index(home, DEFAULT_REPO, dir, index) {
                debug!(error = %e, "index cache save failed");
            }
        }
        Err(e) => tracing::warn!(error = %e, "scan failed; keeping previous index"),
    }

    Ok(walker)
}

async fn rescan_loop(
    mut walker: Walker,
    model: Arc<Model>,
    home: PathBuf,
    dir: PathBuf,
    interval: Duration,
) {
    loop {
        tokio::time::sleep(interval).await;
        match rescan(walker, &model, &home, &dir).await {
            Ok(w) => walker = w,
            Err(e) => {
                tracing::warn!(error = %e, "rescan task failed");
                return;
            }
        }
    }
}

fn expand_tilde(p: &Path) -> PathBuf {
    let s = p.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return Path::new(&home).join(rest);
        }
    } else if s == "~" {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home);
        }
    }
    p.to_path_buf()
}
