use serde::{Deserialize, Serialize};

use grantline_core::types::{
    Entitlement, GrantStatus, ObjectKey, ObjectMeta, Request, RequestSpec, Secret,
};

// ─── Validation Helpers ─────────────────────────────────────────────────────

/// Store names: lowercase alphanumerics, '-' and '.', starting and ending
/// with an alphanumeric, at most 63 characters.
pub fn validate_name(field: &str, value: &str) -> Result<(), String> {
    let valid = !value.is_empty()
        && value.len() <= 63
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        && !value.starts_with(['-', '.'])
        && !value.ends_with(['-', '.']);
    if valid {
        Ok(())
    } else {
        Err(format!(
            "{field} '{value}' must be 1-63 lowercase alphanumerics, '-' or '.'"
        ))
    }
}

// ─── Request Types ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateSecretRequest {
    pub namespace: String,
    pub name: String,
    /// Signed license token
    pub license: String,
}

impl CreateSecretRequest {
    pub fn validate(&self) -> Result<(), String> {
        validate_name("namespace", &self.namespace)?;
        validate_name("name", &self.name)?;
        if self.license.trim().is_empty() {
            return Err("license is required".to_string());
        }
        Ok(())
    }

    pub fn into_secret(self) -> Secret {
        Secret::license(&self.namespace, &self.name, self.license.trim())
    }
}

#[derive(Deserialize)]
pub struct CreateLicenseRequest {
    pub namespace: String,
    pub name: String,
    pub entitlement: String,
    pub unit: String,
    pub amount: u64,
}

impl CreateLicenseRequest {
    pub fn validate(&self) -> Result<(), String> {
        validate_name("namespace", &self.namespace)?;
        validate_name("name", &self.name)?;
        validate_name("entitlement", &self.entitlement)?;
        if self.unit.is_empty() || self.unit.contains('/') {
            return Err("unit must be non-empty and must not contain '/'".to_string());
        }
        if self.amount == 0 {
            return Err("amount must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn into_request(self) -> Request {
        let spec = RequestSpec {
            entitlement: ObjectKey::new(&self.namespace, self.entitlement),
            unit: self.unit,
            amount: self.amount,
        };
        Request::new(ObjectMeta::new(self.namespace, self.name), spec)
    }
}

// ─── Response Types ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub trust_anchors: usize,
    pub entitlements: usize,
    pub requests: usize,
    pub version: String,
}

/// Secrets are echoed back without their token.
#[derive(Serialize)]
pub struct SecretInfo {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl From<&Secret> for SecretInfo {
    fn from(secret: &Secret) -> Self {
        Self {
            namespace: secret.metadata.namespace.clone(),
            name: secret.metadata.name.clone(),
            uid: secret.metadata.uid.clone(),
        }
    }
}

#[derive(Serialize)]
pub struct EntitlementSummary {
    pub namespace: String,
    pub name: String,
    pub units: Vec<String>,
    pub grants: usize,
    pub free: usize,
    pub in_use: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub earliest_expiration: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<&Entitlement> for EntitlementSummary {
    fn from(pool: &Entitlement) -> Self {
        let count = |status: GrantStatus| {
            pool.status
                .grants
                .values()
                .filter(|g| g.status == status)
                .count()
        };
        Self {
            namespace: pool.metadata.namespace.clone(),
            name: pool.metadata.name.clone(),
            units: pool.status.units.clone(),
            grants: pool.status.grants.len(),
            free: count(GrantStatus::Free),
            in_use: count(GrantStatus::InUse),
            earliest_expiration: pool.status.earliest_expiration,
        }
    }
}

#[derive(Serialize)]
pub struct AcknowledgeResponse {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub request: Request,
}
