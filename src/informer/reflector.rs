//! List-then-watch synchronization of one remote collection into the local
//! store. The subscription protocol has no resumable cursor, so any watch
//! failure falls back to a full relist after backoff.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::time::sleep;

use crate::client::{
    has_auth_error, Message, MessageType, MutationEvent, MutationType, ResponseError, Transport,
};
use crate::informer::store::IndexedStore;
use crate::informer::Event;
use crate::schema::Resource;
use crate::StopSignal;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Auth failures tolerated before the first successful sync. The transport
/// re-logins on its own; if it still cannot authenticate this many times in
/// a row, startup is considered failed.
const MAX_AUTH_FAILURES: u32 = 5;

#[derive(Debug, Error)]
pub(crate) enum ReflectorError {
    #[error("remote rejected authentication: {0:?}")]
    Auth(Vec<ResponseError>),
    #[error("list query failed: {0:?}")]
    List(Vec<ResponseError>),
    #[error("failed to decode {0}: {1}")]
    Decode(&'static str, #[source] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
    #[error("subscription error: {0:?}")]
    Subscription(Vec<ResponseError>),
    #[error("subscription completed by remote")]
    SubscriptionClosed,
}

/// Where the reflector hands applied events (and the initial-sync signal).
/// Implemented by the shared informer, which fans out to its handlers.
pub(crate) trait EventSink<T>: Send + Sync {
    fn dispatch(&self, event: &Event<T>);
    fn initial_sync_done(&self);
}

pub(crate) struct Reflector<T: Resource, C: Transport> {
    client: Arc<C>,
    store: Arc<IndexedStore<T>>,
    sink: Arc<dyn EventSink<T>>,
}

impl<T: Resource, C: Transport> Reflector<T, C> {
    pub(crate) fn new(
        client: Arc<C>,
        store: Arc<IndexedStore<T>>,
        sink: Arc<dyn EventSink<T>>,
    ) -> Self {
        Self { client, store, sink }
    }

    /// Runs until the stop signal fires. Every failure relists after a
    /// bounded exponential backoff; only repeated auth failures before the
    /// first sync abort the loop.
    pub(crate) async fn run(&self, mut stop: StopSignal) -> anyhow::Result<()> {
        let mut backoff = BACKOFF_BASE;
        let mut auth_failures = 0u32;
        let mut synced_once = false;

        while !*stop.borrow() {
            match self
                .list_and_watch(&mut stop, &mut synced_once, &mut backoff)
                .await
            {
                Ok(()) => return Ok(()), // stop fired
                Err(ReflectorError::Auth(errors)) if !synced_once => {
                    auth_failures += 1;
                    if auth_failures >= MAX_AUTH_FAILURES {
                        error!(
                            "{}: authentication failed {} times before first sync, giving up",
                            T::QUERY_FIELD,
                            auth_failures
                        );
                        return Err(ReflectorError::Auth(errors).into());
                    }
                    warn!(
                        "{}: authentication failed ({}/{}), will retry: {:?}",
                        T::QUERY_FIELD,
                        auth_failures,
                        MAX_AUTH_FAILURES,
                        errors
                    );
                }
                Err(e) => {
                    auth_failures = 0;
                    warn!("{}: watch failed, relisting in {:?}: {}", T::QUERY_FIELD, backoff, e);
                }
            }

            tokio::select! {
                _ = sleep(backoff) => {}
                _ = stop.changed() => return Ok(()),
            }
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
        Ok(())
    }

    /// One full cycle: list, seed the store, then consume the subscription
    /// until it fails or the stop signal fires. `Ok(())` means stop fired.
    async fn list_and_watch(
        &self,
        stop: &mut StopSignal,
        synced_once: &mut bool,
        backoff: &mut Duration,
    ) -> Result<(), ReflectorError> {
        let response = tokio::select! {
            result = self.client.query(T::list_request()) => result?,
            _ = stop.changed() => return Ok(()),
        };
        if !response.errors.is_empty() {
            if has_auth_error(&response.errors) {
                return Err(ReflectorError::Auth(response.errors));
            }
            return Err(ReflectorError::List(response.errors));
        }

        // the collection field is omitted entirely when empty
        let data = response.data[T::QUERY_FIELD].clone();
        let objects: Vec<T> = if data.is_null() {
            Vec::new()
        } else {
            serde_json::from_value(data).map_err(|e| ReflectorError::Decode(T::QUERY_FIELD, e))?
        };
        info!("{}: listed {} objects", T::QUERY_FIELD, objects.len());
        *backoff = BACKOFF_BASE;

        for event in self.store.replace(objects) {
            self.sink.dispatch(&event);
        }
        if !*synced_once {
            *synced_once = true;
            self.sink.initial_sync_done();
        }

        let mut messages = tokio::select! {
            result = self.client.subscribe(T::subscription_request()) => result?,
            _ = stop.changed() => return Ok(()),
        };

        loop {
            let message = tokio::select! {
                message = messages.recv() => message.ok_or(ReflectorError::SubscriptionClosed)?,
                _ = stop.changed() => return Ok(()),
            };
            self.handle_message(message)?;
        }
    }

    fn handle_message(&self, message: Message) -> Result<(), ReflectorError> {
        match message.message_type {
            MessageType::Start => Ok(()),
            MessageType::Complete => Err(ReflectorError::SubscriptionClosed),
            MessageType::Error => {
                let errors: Vec<ResponseError> =
                    serde_json::from_value(message.payload).unwrap_or_default();
                if has_auth_error(&errors) {
                    Err(ReflectorError::Auth(errors))
                } else {
                    Err(ReflectorError::Subscription(errors))
                }
            }
            MessageType::Data => {
                let event: MutationEvent = serde_json::from_value(
                    message.payload["data"][T::SUBSCRIPTION_FIELD].clone(),
                )
                .map_err(|e| ReflectorError::Decode(T::SUBSCRIPTION_FIELD, e))?;
                self.apply(event)
            }
        }
    }

    /// Applies one mutation event to the store and fans it out. The store
    /// decides the delivered flavor: an upsert of a known key is an update
    /// no matter what the wire said, a delete of an unknown key is dropped.
    fn apply(&self, event: MutationEvent) -> Result<(), ReflectorError> {
        match event.mutation {
            MutationType::Created | MutationType::Updated => {
                let new: T = serde_json::from_value(event.node)
                    .map_err(|e| ReflectorError::Decode(T::SUBSCRIPTION_FIELD, e))?;
                match self.store.upsert(new.clone()) {
                    Some(old) => self.sink.dispatch(&Event::Updated(old, new)),
                    None => self.sink.dispatch(&Event::Added(new)),
                }
            }
            MutationType::Deleted => {
                let gone: T = serde_json::from_value(event.node)
                    .map_err(|e| ReflectorError::Decode(T::SUBSCRIPTION_FIELD, e))?;
                match self.store.delete(gone.id()) {
                    Some(old) => self.sink.dispatch(&Event::Deleted(old)),
                    None => debug!(
                        "{}: delete for unknown key {}, ignoring",
                        T::SUBSCRIPTION_FIELD,
                        gone.id()
                    ),
                }
            }
        }
        Ok(())
    }
}
