use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::{info, warn};

use wipecast::client;
use wipecast::errors::ClientError;
use wipecast::session::SessionBridge;
use wipecast::worker::CommentWorker;
use wipecast::{init_logging, AppConfig, ShutdownToken};

static SIGNAL_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Upper bound on the graceful drain before the process is forced out.
const FORCED_EXIT_GRACE: Duration = Duration::from_secs(10);
const SIGNAL_POLL: Duration = Duration::from_millis(100);

extern "C" fn handle_termination(_: libc::c_int) {
    SIGNAL_COUNT.fetch_add(1, Ordering::SeqCst);
}

fn install_signal_handlers() -> Result<()> {
    unsafe {
        let handler = handle_termination as *const () as libc::sighandler_t;
        if libc::signal(libc::SIGINT, handler) == libc::SIG_ERR {
            return Err(anyhow!("failed to install SIGINT handler"));
        }
        if libc::signal(libc::SIGTERM, handler) == libc::SIG_ERR {
            return Err(anyhow!("failed to install SIGTERM handler"));
        }
    }
    Ok(())
}

/// Translate raw signal counts into shutdown stages: the first signal asks
/// for a graceful drain and arms a forced-exit watchdog, a second one
/// cancels the in-flight exchange immediately.
fn spawn_signal_pump(shutdown: ShutdownToken) {
    thread::spawn(move || loop {
        let count = SIGNAL_COUNT.load(Ordering::SeqCst);
        if count >= 2 && !shutdown.should_abort() {
            warn!("second signal, cancelling in-flight work");
            shutdown.request_abort();
        } else if count >= 1 && shutdown.request_stop() {
            info!("shutdown requested, draining");
            let watchdog = shutdown.clone();
            thread::spawn(move || {
                thread::sleep(FORCED_EXIT_GRACE);
                warn!("drain did not finish in time, forcing exit");
                watchdog.request_abort();
                thread::sleep(Duration::from_secs(1));
                process::exit(1);
            });
        }
        thread::sleep(SIGNAL_POLL);
    });
}

fn main() -> Result<()> {
    let config = AppConfig::parse();
    config.validate()?;
    init_logging(&config);

    install_signal_handlers()?;
    let shutdown = ShutdownToken::new();
    spawn_signal_pump(shutdown.clone());

    let mut bridge = SessionBridge::new(config.session(), shutdown.clone())
        .context("session setup failed")?;
    bridge
        .initialize()
        .context("interactive session failed to start")?;

    let worker = CommentWorker::spawn(
        bridge,
        config.prompt_template.clone(),
        config.max_output_chars,
    );

    let result = client::run(&config, &shutdown, &worker.requests(), &worker.outcomes());
    worker.shutdown();

    match result {
        Ok(()) => {
            info!("stopped");
            Ok(())
        }
        Err(ClientError::Cancelled) => {
            warn!("stopped without a full drain");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}
