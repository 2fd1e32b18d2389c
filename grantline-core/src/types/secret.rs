use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::primitives::{ObjectMeta, Resource, ResourceKind, LICENSE_DATA_KEY, LICENSE_LABEL};

/// An opaque key/value carrier. Labeled secrets hold a signed license token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    #[serde(skip)]
    status: (),
}

impl Secret {
    pub fn new(metadata: ObjectMeta) -> Self {
        Self {
            metadata,
            data: BTreeMap::new(),
            status: (),
        }
    }

    /// Builds a labeled secret carrying `token` under the well-known data key.
    pub fn license(namespace: &str, name: &str, token: impl Into<String>) -> Self {
        let mut metadata = ObjectMeta::new(namespace, name);
        metadata
            .labels
            .insert(LICENSE_LABEL.to_string(), "true".to_string());
        let mut secret = Self::new(metadata);
        secret.data.insert(LICENSE_DATA_KEY.to_string(), token.into());
        secret
    }

    pub fn is_license(&self) -> bool {
        self.metadata.has_label(LICENSE_LABEL)
    }

    pub fn license_token(&self) -> Option<&str> {
        self.data.get(LICENSE_DATA_KEY).map(String::as_str)
    }
}

impl Resource for Secret {
    type Status = ();

    const KIND: ResourceKind = ResourceKind::Secret;

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
