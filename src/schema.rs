//! Object model of the inventory service, the derived endpoint object, and
//! the `Resource` trait binding each watched kind to its list query and
//! mutation subscription.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::client::Request;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectReference {
    pub id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachine {
    #[serde(flatten)]
    pub meta: ObjectMeta,
    pub name: String,
    #[serde(default)]
    pub vcpu: i32,
    #[serde(default)]
    pub memory: i64,
    pub status: VmStatus,
    #[serde(default, rename = "vm_nics")]
    pub vnics: Vec<Vnic>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmStatus {
    Running,
    Suspended,
    Stopped,
    Deleted,
    Unknown,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vnic {
    #[serde(flatten)]
    pub meta: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<Vlan>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mirror: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vlan {
    #[serde(flatten)]
    pub meta: ObjectMeta,
    #[serde(default)]
    pub name: String,
    pub vlan_id: i32,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub network_type: Option<NetworkType>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkType {
    Storage,
    Management,
    Vm,
    Access,
    Migration,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Label {
    #[serde(flatten)]
    pub meta: ObjectMeta,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default)]
    pub vms: Vec<ObjectReference>,
}

/// The derived network-security endpoint this crate keeps in sync. Its
/// identity is the owning network interface id.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// A watched inventory kind: how to list the full collection and how to
/// subscribe to its mutation stream.
pub trait Resource: Clone + std::fmt::Debug + DeserializeOwned + Send + Sync + 'static {
    /// Collection field selected by the list query, e.g. `vms`.
    const QUERY_FIELD: &'static str;
    /// Singular field selected by the mutation subscription, e.g. `vm`.
    const SUBSCRIPTION_FIELD: &'static str;
    /// Selection set shared by list and subscription.
    const FIELDS: &'static str;

    fn id(&self) -> &str;

    fn list_request() -> Request {
        Request::new(
            Self::QUERY_FIELD,
            format!(
                "query {} {{{} {}}}",
                Self::QUERY_FIELD,
                Self::QUERY_FIELD,
                Self::FIELDS
            ),
        )
    }

    fn subscription_request() -> Request {
        Request::new(
            Self::SUBSCRIPTION_FIELD,
            format!(
                "subscription {} {{{} {{mutation node {}}}}}",
                Self::SUBSCRIPTION_FIELD,
                Self::SUBSCRIPTION_FIELD,
                Self::FIELDS
            ),
        )
    }
}

impl Resource for VirtualMachine {
    const QUERY_FIELD: &'static str = "vms";
    const SUBSCRIPTION_FIELD: &'static str = "vm";
    const FIELDS: &'static str =
        "{id name vcpu memory status vm_nics {id enabled mirror vlan {id name vlan_id type}}}";

    fn id(&self) -> &str {
        &self.meta.id
    }
}

impl Resource for Label {
    const QUERY_FIELD: &'static str = "labels";
    const SUBSCRIPTION_FIELD: &'static str = "label";
    const FIELDS: &'static str = "{id key value vms {id}}";

    fn id(&self) -> &str {
        &self.meta.id
    }
}
