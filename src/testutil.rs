//! In-crate fakes standing in for the two external collaborators: the
//! inventory transport and the orchestration endpoint store.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use serde_json::{json, Value as JsonValue};
use tokio::sync::mpsc;

use crate::client::{
    ErrorCode, Message, MessageType, MutationType, Request, Response, ResponseError, Transport,
};
use crate::controller::{EndpointApi, EndpointApiError};
use crate::schema::{Endpoint, Label, ObjectMeta, ObjectReference, Resource, VirtualMachine, Vnic, VmStatus};

pub(crate) fn vm(id: &str, vnic_ids: &[&str]) -> VirtualMachine {
    VirtualMachine {
        meta: ObjectMeta { id: id.to_string() },
        name: id.to_string(),
        vcpu: 1,
        memory: 1 << 30,
        status: VmStatus::Running,
        vnics: vnic_ids
            .iter()
            .map(|vnic_id| Vnic {
                meta: ObjectMeta {
                    id: vnic_id.to_string(),
                },
                vlan: None,
                enabled: true,
                mirror: false,
            })
            .collect(),
    }
}

pub(crate) fn label(id: &str, key: &str, value: Option<&str>, vm_ids: &[&str]) -> Label {
    Label {
        meta: ObjectMeta { id: id.to_string() },
        key: key.to_string(),
        value: value.map(str::to_string),
        vms: vm_ids
            .iter()
            .map(|vm_id| ObjectReference {
                id: vm_id.to_string(),
            })
            .collect(),
    }
}

/// An error the real service answers with when its token has lapsed.
pub(crate) fn auth_error() -> ResponseError {
    ResponseError {
        message: "token expired".to_string(),
        code: Some(ErrorCode::LoadTokenFailed),
    }
}

/// Scripted transport. Query responses are served per operation name in the
/// order they were pushed (the last one repeats); subscriptions hand out
/// channels the test feeds by hand. Dropping a subscription sender
/// simulates a connection drop.
#[derive(Default)]
pub(crate) struct FakeTransport {
    lists: Mutex<HashMap<String, VecDeque<Response>>>,
    subscriptions: Mutex<HashMap<String, VecDeque<mpsc::Receiver<Message>>>>,
    list_calls: AtomicUsize,
}

impl FakeTransport {
    /// Queues one list response for a kind; `objects` is the collection
    /// under the kind's query field.
    pub(crate) fn push_list<T: Resource + serde::Serialize>(&self, objects: &[T]) {
        let response = Response {
            data: json!({ T::QUERY_FIELD: objects }),
            errors: Vec::new(),
        };
        self.lists
            .lock()
            .unwrap()
            .entry(T::QUERY_FIELD.to_string())
            .or_default()
            .push_back(response);
    }

    /// Queues an error response for a kind's list query.
    pub(crate) fn push_query_errors<T: Resource>(&self, errors: Vec<ResponseError>) {
        let response = Response {
            data: JsonValue::Null,
            errors,
        };
        self.lists
            .lock()
            .unwrap()
            .entry(T::QUERY_FIELD.to_string())
            .or_default()
            .push_back(response);
    }

    /// Registers the channel served to the next subscription for a kind and
    /// returns the feeding side.
    pub(crate) fn push_subscription<T: Resource>(&self) -> mpsc::Sender<Message> {
        let (sender, receiver) = mpsc::channel(16);
        self.subscriptions
            .lock()
            .unwrap()
            .entry(T::SUBSCRIPTION_FIELD.to_string())
            .or_default()
            .push_back(receiver);
        sender
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

/// Builds the subscription data message a real connection would carry.
pub(crate) fn mutation_message<T: Resource + serde::Serialize>(
    mutation: MutationType,
    node: &T,
) -> Message {
    Message {
        id: "1".to_string(),
        message_type: MessageType::Data,
        payload: json!({
            "data": {
                T::SUBSCRIPTION_FIELD: {
                    "mutation": mutation,
                    "node": node,
                }
            }
        }),
    }
}

impl Transport for FakeTransport {
    async fn query(&self, request: Request) -> Result<Response> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let operation = request
            .operation_name
            .ok_or_else(|| anyhow!("request without operation name"))?;

        let mut lists = self.lists.lock().unwrap();
        let responses = lists
            .get_mut(&operation)
            .ok_or_else(|| anyhow!("no scripted list for {operation}"))?;
        if responses.len() > 1 {
            Ok(responses.pop_front().unwrap())
        } else {
            responses
                .front()
                .cloned()
                .ok_or_else(|| anyhow!("no scripted list for {operation}"))
        }
    }

    async fn subscribe(&self, request: Request) -> Result<mpsc::Receiver<Message>> {
        let operation = request
            .operation_name
            .ok_or_else(|| anyhow!("request without operation name"))?;
        self.subscriptions
            .lock()
            .unwrap()
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| anyhow!("no scripted subscription for {operation}"))
    }
}

/// In-memory endpoint store with call counters.
#[derive(Default)]
pub(crate) struct FakeEndpointApi {
    endpoints: Mutex<BTreeMap<String, Endpoint>>,
    creates: AtomicUsize,
    updates: AtomicUsize,
    deletes: AtomicUsize,
}

impl FakeEndpointApi {
    pub(crate) fn seed(&self, endpoint: Endpoint) {
        self.endpoints
            .lock()
            .unwrap()
            .insert(endpoint.id.clone(), endpoint);
    }

    pub(crate) fn get_sync(&self, key: &str) -> Option<Endpoint> {
        self.endpoints.lock().unwrap().get(key).cloned()
    }

    pub(crate) fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub(crate) fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub(crate) fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

impl EndpointApi for FakeEndpointApi {
    async fn get(&self, key: &str) -> Result<Option<Endpoint>, EndpointApiError> {
        Ok(self.get_sync(key))
    }

    async fn create(&self, endpoint: &Endpoint) -> Result<(), EndpointApiError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.endpoints
            .lock()
            .unwrap()
            .insert(endpoint.id.clone(), endpoint.clone());
        Ok(())
    }

    async fn update(&self, endpoint: &Endpoint) -> Result<(), EndpointApiError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.endpoints
            .lock()
            .unwrap()
            .insert(endpoint.id.clone(), endpoint.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), EndpointApiError> {
        let removed = self.endpoints.lock().unwrap().remove(key);
        match removed {
            Some(_) => {
                self.deletes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(EndpointApiError::NotFound(key.to_string())),
        }
    }
}
