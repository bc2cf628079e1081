//! The endpoint controller: watches the VM and label caches, and keeps one
//! derived endpoint object per network interface in sync through the
//! orchestration API.
//!
//! Handlers never carry state of their own, they only enqueue the affected
//! interface keys; `reconcile` re-derives everything from the two indexed
//! stores, so any ordering of events converges to the same result.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use log::{error, info, warn};
use thiserror::Error;

use crate::client::Transport;
use crate::queue::WorkQueue;
use crate::informer::{
    wait_for_cache_sync, EventHandler, IndexedStore, SharedInformer, SharedInformerFactory,
    StoreError,
};
use crate::schema::{Endpoint, Label, VirtualMachine};
use crate::StopSignal;

/// VM store index: vnic id -> owning VM.
pub const VNIC_INDEX: &str = "vnic";
/// Label store index: vm id -> labels carried by that VM.
pub const VM_INDEX: &str = "vm";

/// The orchestration-side CRUD store for derived endpoints. List/watch on
/// this store stays with the collaborator owning it; deletes of absent
/// endpoints must surface as `NotFound` so the controller can treat them
/// as success.
pub trait EndpointApi: Send + Sync + 'static {
    fn get(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<Endpoint>, EndpointApiError>> + Send;
    fn create(&self, endpoint: &Endpoint)
        -> impl Future<Output = Result<(), EndpointApiError>> + Send;
    fn update(&self, endpoint: &Endpoint)
        -> impl Future<Output = Result<(), EndpointApiError>> + Send;
    fn delete(&self, key: &str) -> impl Future<Output = Result<(), EndpointApiError>> + Send;
}

#[derive(Debug, Error)]
pub enum EndpointApiError {
    #[error("endpoint {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
enum ReconcileError {
    /// The interface-uniqueness invariant is broken upstream. Not
    /// retryable: requeuing cannot fix the inventory.
    #[error("vnic {vnic} claimed by multiple vms: {vms:?}")]
    MultipleOwners { vnic: String, vms: Vec<String> },
    #[error(transparent)]
    Api(#[from] EndpointApiError),
}

impl ReconcileError {
    fn retryable(&self) -> bool {
        !matches!(self, ReconcileError::MultipleOwners { .. })
    }
}

pub struct EndpointController<C: Transport, A: EndpointApi> {
    api: Arc<A>,
    vm_informer: Arc<SharedInformer<VirtualMachine, C>>,
    vm_store: Arc<IndexedStore<VirtualMachine>>,
    label_informer: Arc<SharedInformer<Label, C>>,
    label_store: Arc<IndexedStore<Label>>,
    queue: Arc<WorkQueue>,
}

impl<C: Transport, A: EndpointApi> EndpointController<C, A> {
    /// Wires indexers and handlers onto the factory's informers. Must run
    /// before the factory starts, indexers are rejected afterwards.
    pub fn new(
        factory: &SharedInformerFactory<C>,
        api: Arc<A>,
        resync_period: std::time::Duration,
    ) -> Result<Self, StoreError> {
        let vm_informer = factory.vm();
        let label_informer = factory.label();
        let vm_store = vm_informer.get_indexer();
        let label_store = label_informer.get_indexer();
        let queue = Arc::new(WorkQueue::new());

        vm_store.add_indexer(
            VNIC_INDEX,
            Box::new(|vm: &VirtualMachine| {
                vm.vnics.iter().map(|vnic| vnic.meta.id.clone()).collect()
            }),
        )?;
        label_store.add_indexer(
            VM_INDEX,
            Box::new(|label: &Label| label.vms.iter().map(|vm| vm.id.clone()).collect()),
        )?;

        vm_informer.add_event_handler(
            Arc::new(VmHandler {
                queue: Arc::clone(&queue),
            }),
            resync_period,
        );
        label_informer.add_event_handler(
            Arc::new(LabelHandler {
                queue: Arc::clone(&queue),
                vm_store: Arc::clone(&vm_store),
            }),
            resync_period,
        );

        Ok(Self {
            api,
            vm_informer,
            vm_store,
            label_informer,
            label_store,
            queue: Arc::clone(&queue),
        })
    }

    /// Hook for the collaborator watching the orchestration store: any
    /// add/update/delete of an owned endpoint re-enqueues its key.
    pub fn handle_endpoint_event(&self, key: &str) {
        self.queue.add(key);
    }

    /// Blocks until both caches have synced, then runs `workers`
    /// reconciliation loops until the stop signal fires. In-flight
    /// reconciliations finish before this returns.
    pub async fn run(&self, workers: usize, mut stop: StopSignal) {
        if !wait_for_cache_sync(
            stop.clone(),
            &[&*self.vm_informer, &*self.label_informer],
        )
        .await
        {
            warn!("endpoint controller: stopped before caches synced");
            self.queue.shut_down();
            return;
        }
        info!("endpoint controller: caches synced, starting {workers} workers");

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let queue = Arc::clone(&self.queue);
            let api = Arc::clone(&self.api);
            let vm_store = Arc::clone(&self.vm_store);
            let label_store = Arc::clone(&self.label_store);
            handles.push(tokio::spawn(async move {
                worker(queue, api, vm_store, label_store).await;
            }));
        }

        if !*stop.borrow() {
            let _ = stop.changed().await;
        }
        self.queue.shut_down();
        join_all(handles).await;
        info!("endpoint controller: stopped");
    }
}

struct VmHandler {
    queue: Arc<WorkQueue>,
}

impl VmHandler {
    fn enqueue(&self, vm: &VirtualMachine) {
        for vnic in &vm.vnics {
            self.queue.add(&vnic.meta.id);
        }
    }
}

impl EventHandler<VirtualMachine> for VmHandler {
    fn on_add(&self, new: &VirtualMachine) {
        self.enqueue(new);
    }

    fn on_update(&self, old: &VirtualMachine, new: &VirtualMachine) {
        // old covers interfaces detached by this update
        self.enqueue(old);
        self.enqueue(new);
    }

    fn on_delete(&self, old: &VirtualMachine) {
        self.enqueue(old);
    }
}

struct LabelHandler {
    queue: Arc<WorkQueue>,
    vm_store: Arc<IndexedStore<VirtualMachine>>,
}

impl LabelHandler {
    fn enqueue(&self, label: &Label) {
        for vm_ref in &label.vms {
            let Some(vm) = self.vm_store.get(&vm_ref.id) else {
                // vm not cached yet; its own add event will enqueue
                continue;
            };
            for vnic in &vm.vnics {
                self.queue.add(&vnic.meta.id);
            }
        }
    }
}

impl EventHandler<Label> for LabelHandler {
    fn on_add(&self, new: &Label) {
        self.enqueue(new);
    }

    fn on_update(&self, old: &Label, new: &Label) {
        self.enqueue(old);
        self.enqueue(new);
    }

    fn on_delete(&self, old: &Label) {
        self.enqueue(old);
    }
}

async fn worker<A: EndpointApi>(
    queue: Arc<WorkQueue>,
    api: Arc<A>,
    vm_store: Arc<IndexedStore<VirtualMachine>>,
    label_store: Arc<IndexedStore<Label>>,
) {
    while let Some(key) = queue.get().await {
        match reconcile(&key, api.as_ref(), &vm_store, &label_store).await {
            Ok(()) => queue.forget(&key),
            Err(e) if e.retryable() => {
                warn!("failed to sync endpoint {key}, requeuing: {e}");
                queue.add_rate_limited(&key);
            }
            Err(e) => {
                // operator intervention needed, retrying cannot help
                error!("failed to sync endpoint {key}: {e}");
                queue.forget(&key);
            }
        }
        queue.done(&key);
    }
}

/// Level-triggered sync of one interface key: re-derives the desired
/// endpoint from the caches and applies it idempotently.
async fn reconcile<A: EndpointApi>(
    key: &str,
    api: &A,
    vm_store: &IndexedStore<VirtualMachine>,
    label_store: &IndexedStore<Label>,
) -> Result<(), ReconcileError> {
    let owners = vm_store.index_keys(VNIC_INDEX, key);
    match owners.len() {
        0 => delete_endpoint(api, key).await,
        1 => apply_endpoint(api, label_store, &owners[0], key).await,
        _ => Err(ReconcileError::MultipleOwners {
            vnic: key.to_string(),
            vms: owners,
        }),
    }
}

/// No VM owns the interface, so the endpoint must not exist. Already-absent
/// counts as success.
async fn delete_endpoint<A: EndpointApi>(api: &A, key: &str) -> Result<(), ReconcileError> {
    match api.delete(key).await {
        Ok(()) | Err(EndpointApiError::NotFound(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn apply_endpoint<A: EndpointApi>(
    api: &A,
    label_store: &IndexedStore<Label>,
    vm_key: &str,
    vnic_key: &str,
) -> Result<(), ReconcileError> {
    let mut labels = BTreeMap::new();
    for label in label_store.by_index(VM_INDEX, vm_key) {
        labels.insert(label.key, label.value.unwrap_or_default());
    }
    let desired = Endpoint {
        id: vnic_key.to_string(),
        labels,
    };

    match api.get(vnic_key).await? {
        None => Ok(api.create(&desired).await?),
        Some(current) if current.labels != desired.labels => Ok(api.update(&desired).await?),
        Some(_) => Ok(()),
    }
}
