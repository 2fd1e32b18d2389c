//! Removal of a grant from its pool, shared by the secret and entitlement
//! reconcilers.
//!
//! Pool cleanliness wins over request notification: the grant is removed
//! even if the holding request could not be reset. A request left pointing
//! at a vanished grant is reset by the request reconciler the next time it
//! sees that request (see `RequestReconciler::heal_reference`).

use crate::infrastructure::{update_status_with, ResourceStore};
use crate::retry::RetryPolicy;
use crate::types::{Entitlement, GrantStatus, ObjectKey, Request, PRIOR_GRANT_DELETED};

/// Removes `grant_id` from `entitlement` in memory, first resetting the
/// request that holds it. The caller persists the entitlement.
///
/// Returns true if the grant was present.
pub fn delete_grant(
    requests: &dyn ResourceStore<Request>,
    policy: &RetryPolicy,
    entitlement: &mut Entitlement,
    grant_id: &str,
) -> bool {
    let Some(grant) = entitlement.status.grants.get(grant_id) else {
        return false;
    };

    let held = matches!(grant.status, GrantStatus::InUse | GrantStatus::Pending);
    if let (true, Some(holder)) = (held, grant.request.clone()) {
        reset_holder(requests, policy, &holder, grant_id);
    }

    entitlement.status.grants.remove(grant_id);
    tracing::info!(
        entitlement = %entitlement.metadata.key(),
        grant = grant_id,
        "grant removed from pool"
    );
    true
}

fn reset_holder(
    requests: &dyn ResourceStore<Request>,
    policy: &RetryPolicy,
    holder: &ObjectKey,
    grant_id: &str,
) {
    let result = update_status_with(requests, holder, policy, |request: &mut Request| {
        if request.status.grant.as_deref() != Some(grant_id) {
            return Ok(false);
        }
        request.status.revoke(PRIOR_GRANT_DELETED);
        Ok(true)
    });

    match result {
        Ok(Some(_)) => {
            tracing::info!(request = %holder, grant = grant_id, "request reset to Discover")
        }
        Ok(None) => {
            tracing::debug!(request = %holder, grant = grant_id, "request no longer holds grant")
        }
        Err(err) if err.is_not_found() => {
            tracing::debug!(request = %holder, grant = grant_id, "holding request already gone")
        }
        Err(err) => tracing::warn!(
            request = %holder,
            grant = grant_id,
            error = %err,
            "could not reset holding request; removing grant anyway"
        ),
    }
}
