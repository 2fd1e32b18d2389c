use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::primitives::{ObjectKey, ObjectMeta, Resource, ResourceKind};

/// Allocation state of a grant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GrantStatus {
    /// Available for matching
    #[default]
    Free,
    /// Offered to a request, awaiting the client's acknowledgement
    Pending,
    /// Acknowledged and held by a request
    InUse,
}

/// One allocatable slice of a license token's capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    /// Id of the token this grant was carved from
    pub id: String,
    pub amount: u64,
    pub unit: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// Secret carrying the backing token
    pub license_secret: ObjectKey,
    #[serde(default)]
    pub status: GrantStatus,
    /// Request holding the reservation while Pending or InUse
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<ObjectKey>,
}

impl Grant {
    pub fn is_free(&self) -> bool {
        self.status == GrantStatus::Free && self.request.is_none()
    }

    /// Free, or already reserved for `request`.
    pub fn is_available_for(&self, request: &ObjectKey) -> bool {
        self.is_free() || self.request.as_ref() == Some(request)
    }

    /// Reserved for some request other than `request`.
    pub fn is_claimed_by_other(&self, request: &ObjectKey) -> bool {
        matches!(&self.request, Some(holder) if holder != request)
    }

    /// Returns true if anything changed.
    pub fn reserve(&mut self, status: GrantStatus, request: &ObjectKey) -> bool {
        let changed = self.status != status || self.request.as_ref() != Some(request);
        self.status = status;
        self.request = Some(request.clone());
        changed
    }

    /// Returns true if anything changed.
    pub fn release(&mut self) -> bool {
        let changed = !self.is_free();
        self.status = GrantStatus::Free;
        self.request = None;
        changed
    }
}

/// Grant pool and its derived aggregates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementStatus {
    /// Grants keyed by id; ordered so matching ties break by id
    #[serde(default)]
    pub grants: BTreeMap<String, Grant>,
    /// Number of distinct licenses contributing grants
    #[serde(default)]
    pub licenses: usize,
    /// Sorted, de-duplicated units offered by the pool
    #[serde(default)]
    pub units: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub earliest_expiration: Option<DateTime<Utc>>,
}

impl EntitlementStatus {
    /// Recomputes license count, unit set and earliest expiration from the grants.
    pub fn recompute_aggregates(&mut self) {
        self.licenses = self.grants.len();
        self.units = self
            .grants
            .values()
            .map(|g| g.unit.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        self.earliest_expiration = self.grants.values().map(|g| g.not_after).min();
    }

    /// Ids of grants reserved for `request`.
    pub fn grants_held_by(&self, request: &ObjectKey) -> Vec<String> {
        self.grants
            .values()
            .filter(|g| g.request.as_ref() == Some(request))
            .map(|g| g.id.clone())
            .collect()
    }
}

/// An aggregation pool of grants for one named capability in one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: EntitlementStatus,
}

impl Entitlement {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            status: EntitlementStatus::default(),
        }
    }
}

impl Resource for Entitlement {
    type Status = EntitlementStatus;

    const KIND: ResourceKind = ResourceKind::Entitlement;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn status(&self) -> &Self::Status {
        &self.status
    }

    fn status_mut(&mut self) -> &mut Self::Status {
        &mut self.status
    }
}
