//! Shared informers: one reflector + one indexed store per watched kind,
//! fanning the applied event stream out to any number of handler
//! registrations.

mod factory;
mod reflector;
mod store;

pub use factory::{wait_for_cache_sync, SharedInformerFactory};
pub use store::{IndexFn, IndexedStore, StoreError};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{error, info, warn};
use tokio::time::{interval, MissedTickBehavior};

use crate::client::Transport;
use crate::informer::reflector::{EventSink, Reflector};
use crate::schema::Resource;
use crate::StopSignal;

/// One applied store mutation, as observed by handlers.
#[derive(Clone, Debug)]
pub enum Event<T> {
    Added(T),
    /// old, new
    Updated(T, T),
    Deleted(T),
}

/// Callbacks invoked for every event applied to the store. Invocations for
/// one key arrive in apply order; calls must be quick (typically just an
/// enqueue), they run on the watch task.
pub trait EventHandler<T>: Send + Sync {
    fn on_add(&self, new: &T);
    fn on_update(&self, old: &T, new: &T);
    fn on_delete(&self, old: &T);
}

/// Exposes the synced state of an informer, for `wait_for_cache_sync`.
pub trait InformerSynced: Send + Sync {
    fn has_synced(&self) -> bool;
}

struct HandlerEntry<T> {
    handler: Arc<dyn EventHandler<T>>,
    resync_period: Duration,
}

struct Registrations<T> {
    entries: Vec<HandlerEntry<T>>,
    started: bool,
    // present once started; used to wire resync timers for handlers
    // registered after the fact
    stop: Option<StopSignal>,
}

pub struct SharedInformer<T: Resource, C: Transport> {
    client: Arc<C>,
    store: Arc<IndexedStore<T>>,
    registrations: RwLock<Registrations<T>>,
    synced: AtomicBool,
}

impl<T: Resource, C: Transport> SharedInformer<T, C> {
    pub(crate) fn new(client: Arc<C>) -> Self {
        Self {
            client,
            store: Arc::new(IndexedStore::new()),
            registrations: RwLock::new(Registrations {
                entries: Vec::new(),
                started: false,
                stop: None,
            }),
            synced: AtomicBool::new(false),
        }
    }

    /// The store's indexed read surface. Indexers must be added through it
    /// before the informer starts receiving watch events.
    pub fn get_indexer(&self) -> Arc<IndexedStore<T>> {
        Arc::clone(&self.store)
    }

    /// Registers a handler set. With a non-zero `resync_period`, every
    /// cached object is additionally re-delivered as `on_update(obj, obj)`
    /// at that period, independent of source changes. Resync deliveries run
    /// on their own timer task and are not ordered against live watch
    /// events for the same key.
    pub fn add_event_handler(
        &self,
        handler: Arc<dyn EventHandler<T>>,
        resync_period: Duration,
    ) {
        let mut registrations = self.registrations.write().unwrap();
        if registrations.started && !resync_period.is_zero() {
            if let Some(stop) = registrations.stop.clone() {
                spawn_resync(Arc::clone(&self.store), Arc::clone(&handler), resync_period, stop);
            }
        }
        registrations.entries.push(HandlerEntry {
            handler,
            resync_period,
        });
    }

    /// Runs the list/watch loop until the stop signal fires. Idempotent:
    /// a second call returns immediately. An `Err` means the reflector gave
    /// up before the first sync and the informer will never become ready.
    pub async fn run(self: Arc<Self>, stop: StopSignal) -> anyhow::Result<()> {
        {
            let mut registrations = self.registrations.write().unwrap();
            if registrations.started {
                warn!("{}: informer already started", T::QUERY_FIELD);
                return Ok(());
            }
            registrations.started = true;
            registrations.stop = Some(stop.clone());
            for entry in &registrations.entries {
                if !entry.resync_period.is_zero() {
                    spawn_resync(
                        Arc::clone(&self.store),
                        Arc::clone(&entry.handler),
                        entry.resync_period,
                        stop.clone(),
                    );
                }
            }
        }

        info!("{}: starting informer", T::QUERY_FIELD);
        let sink: Arc<dyn EventSink<T>> = Arc::clone(&self) as Arc<dyn EventSink<T>>;
        let reflector = Reflector::new(Arc::clone(&self.client), Arc::clone(&self.store), sink);
        if let Err(e) = reflector.run(stop).await {
            error!("{}: informer stopped: {e:#}", T::QUERY_FIELD);
            return Err(e);
        }
        Ok(())
    }
}

impl<T: Resource, C: Transport> EventSink<T> for SharedInformer<T, C> {
    fn dispatch(&self, event: &Event<T>) {
        let registrations = self.registrations.read().unwrap();
        for entry in &registrations.entries {
            match event {
                Event::Added(new) => entry.handler.on_add(new),
                Event::Updated(old, new) => entry.handler.on_update(old, new),
                Event::Deleted(old) => entry.handler.on_delete(old),
            }
        }
    }

    fn initial_sync_done(&self) {
        self.synced.store(true, Ordering::SeqCst);
    }
}

impl<T: Resource, C: Transport> InformerSynced for SharedInformer<T, C> {
    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}


fn spawn_resync<T: Resource>(
    store: Arc<IndexedStore<T>>,
    handler: Arc<dyn EventHandler<T>>,
    period: Duration,
    mut stop: StopSignal,
) {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately, skip it
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for obj in store.list() {
                        handler.on_update(&obj, &obj);
                    }
                }
                _ = stop.changed() => return,
            }
        }
    });
}
