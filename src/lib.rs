//! Synchronizes the virtual-machine inventory of a remote management
//! service into local indexed caches (list-then-watch), and drives a
//! level-triggered controller that keeps one derived network-security
//! endpoint per network interface in sync with VM label state.

use std::sync::Arc;
use std::time::Duration;

use futures::future::select_all;
use log::{error, info};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub mod client;
pub mod controller;
pub mod informer;
pub mod queue;
pub mod schema;

#[cfg(test)]
pub(crate) mod testutil;

use client::Transport;
use controller::{EndpointApi, EndpointController};
use informer::SharedInformerFactory;

/// Broadcast stop signal observed by every long-lived task. Flipping the
/// sender to `true` (or dropping it) stops informers, resync timers and
/// workers.
pub type StopSignal = watch::Receiver<bool>;

/// Creates a stop signal pair. Call `send(true)` on the sender to stop.
pub fn stop_channel() -> (watch::Sender<bool>, StopSignal) {
    watch::channel(false)
}

#[derive(Clone, Debug)]
pub struct Options {
    pub workers: usize,
    pub resync_period: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            workers: 10,
            resync_period: Duration::from_secs(10 * 60 * 60),
        }
    }
}

impl Options {
    /// Reads overrides from `ENDPOINT_SYNC_WORKERS` and
    /// `ENDPOINT_SYNC_RESYNC_SECS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let workers = std::env::var("ENDPOINT_SYNC_WORKERS")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(defaults.workers);
        let resync_period = std::env::var("ENDPOINT_SYNC_RESYNC_SECS")
            .ok()
            .and_then(|value| value.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.resync_period);
        Self {
            workers,
            resync_period,
        }
    }
}

/// Wires the informer factory and the endpoint controller together, starts
/// the informers, and blocks until the stop signal fires. Returns an error
/// when an informer cannot reach its first sync (for example repeated
/// authentication failures), so callers see a failed startup instead of a
/// controller waiting on caches that will never fill.
pub async fn run<C: Transport, A: EndpointApi>(
    transport: Arc<C>,
    endpoint_api: Arc<A>,
    options: Options,
    stop: StopSignal,
) -> anyhow::Result<()> {
    info!(
        "starting endpoint sync: {} workers, resync every {:?}",
        options.workers, options.resync_period
    );

    let factory = SharedInformerFactory::new(transport);
    let controller = EndpointController::new(&factory, endpoint_api, options.resync_period)?;

    let informer_tasks = factory.start(stop.clone());
    // informers only fail before their first sync, so on the error branch
    // the controller is still waiting on the caches and has no workers yet
    tokio::select! {
        _ = controller.run(options.workers, stop) => Ok(()),
        err = first_informer_failure(informer_tasks) => {
            error!("endpoint sync startup failed: {err:#}");
            Err(err)
        }
    }
}

/// Resolves with the first fatal informer error. Pends forever once every
/// informer has exited cleanly.
async fn first_informer_failure(mut tasks: Vec<JoinHandle<anyhow::Result<()>>>) -> anyhow::Error {
    while !tasks.is_empty() {
        let (result, _, rest) = select_all(tasks).await;
        tasks = rest;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return e,
            Err(e) => return e.into(),
        }
    }
    std::future::pending().await
}
