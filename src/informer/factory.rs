//! Exactly-once construction of the per-kind informers and their joint
//! lifecycle.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::client::Transport;
use crate::informer::{InformerSynced, SharedInformer};
use crate::schema::{Label, VirtualMachine};
use crate::StopSignal;

const SYNC_POLL_PERIOD: Duration = Duration::from_millis(100);

pub struct SharedInformerFactory<C: Transport> {
    client: Arc<C>,
    informers: Mutex<Informers<C>>,
}

struct Informers<C: Transport> {
    vm: Option<Arc<SharedInformer<VirtualMachine, C>>>,
    label: Option<Arc<SharedInformer<Label, C>>>,
}

impl<C: Transport> SharedInformerFactory<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self {
            client,
            informers: Mutex::new(Informers {
                vm: None,
                label: None,
            }),
        }
    }

    /// The virtual-machine informer. Repeated calls return the same
    /// instance.
    pub fn vm(&self) -> Arc<SharedInformer<VirtualMachine, C>> {
        let mut informers = self.informers.lock().unwrap();
        informers
            .vm
            .get_or_insert_with(|| Arc::new(SharedInformer::new(Arc::clone(&self.client))))
            .clone()
    }

    /// The label informer. Repeated calls return the same instance.
    pub fn label(&self) -> Arc<SharedInformer<Label, C>> {
        let mut informers = self.informers.lock().unwrap();
        informers
            .label
            .get_or_insert_with(|| Arc::new(SharedInformer::new(Arc::clone(&self.client))))
            .clone()
    }

    /// Starts every constructed informer and returns one task handle per
    /// informer. Does not block; informers already running are left alone,
    /// so calling this again after constructing more informers is fine.
    /// A handle resolves with `Err` only when its informer gives up before
    /// the first sync.
    pub fn start(&self, stop: StopSignal) -> Vec<JoinHandle<anyhow::Result<()>>> {
        let informers = self.informers.lock().unwrap();
        let mut tasks = Vec::new();
        if let Some(vm) = &informers.vm {
            tasks.push(tokio::spawn(Arc::clone(vm).run(stop.clone())));
        }
        if let Some(label) = &informers.label {
            tasks.push(tokio::spawn(Arc::clone(label).run(stop)));
        }
        tasks
    }
}

/// Blocks until every informer reports `has_synced`, or the stop signal
/// fires first (returns false).
pub async fn wait_for_cache_sync(mut stop: StopSignal, informers: &[&dyn InformerSynced]) -> bool {
    loop {
        if informers.iter().all(|informer| informer.has_synced()) {
            return true;
        }
        if *stop.borrow() {
            return false;
        }
        tokio::select! {
            _ = sleep(SYNC_POLL_PERIOD) => {}
            _ = stop.changed() => return false,
        }
    }
}
