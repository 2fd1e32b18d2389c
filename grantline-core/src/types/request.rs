use serde::{Deserialize, Serialize};

use super::primitives::{ObjectKey, ObjectMeta, Resource, ResourceKind};

/// Message a request carries after the grant it held was removed from the pool.
pub const PRIOR_GRANT_DELETED: &str = "prior grant deleted";

/// Phases of the three-step licensing handshake
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestPhase {
    /// Waiting for the control plane to find a grant
    #[default]
    Discover,
    /// A grant was offered; the client validates it
    Offer,
    /// The client accepted the offered grant
    Acknowledged,
}

impl std::fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestPhase::Discover => write!(f, "Discover"),
            RequestPhase::Offer => write!(f, "Offer"),
            RequestPhase::Acknowledged => write!(f, "Acknowledged"),
        }
    }
}

/// What the application asks for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSpec {
    /// Entitlement pool to draw from
    pub entitlement: ObjectKey,
    pub unit: String,
    pub amount: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStatus {
    #[serde(default)]
    pub phase: RequestPhase,
    /// Id of the offered or held grant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grant: Option<String>,
    /// Secret backing the offered grant, for client-side verification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_secret: Option<ObjectKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RequestStatus {
    /// Drops the grant reference and returns to Discover.
    pub fn revoke(&mut self, message: impl Into<String>) {
        self.phase = RequestPhase::Discover;
        self.grant = None;
        self.license_secret = None;
        self.message = Some(message.into());
    }
}

/// A declared usage intent from one application instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub metadata: ObjectMeta,
    pub spec: RequestSpec,
    #[serde(default)]
    pub status: RequestStatus,
}

impl Request {
    pub fn new(metadata: ObjectMeta, spec: RequestSpec) -> Self {
        Self {
            metadata,
            spec,
            status: RequestStatus::default(),
        }
    }

    /// The `"<entitlement>/<unit>"` key this request draws on inside a token.
    pub fn grant_key(&self) -> String {
        format!("{}/{}", self.spec.entitlement.name, self.spec.unit)
    }
}

impl Resource for Request {
    type Status = RequestStatus;

    const KIND: ResourceKind = ResourceKind::Request;

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
