use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use lantern::config::Config;
use lantern::server;

fn main() -> anyhow::Result<()> {
    let cfg = Config::load()?;

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(cfg.log_level())
        .init();

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || flag.store(true, Ordering::Release))
        .context("failed to install Ctrl-C handler")?;

    tracing::info!(
        root = %cfg.static_files.root.display(),
        workers = cfg.workers.threads,
        "starting lantern"
    );
    server::run(&cfg, shutdown)
}
