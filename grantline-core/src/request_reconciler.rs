//! The Discover/Offer/Acknowledged licensing protocol.
//!
//! Request and entitlement are written independently. A request in Offer or
//! Acknowledged is checked against the pool on every pass, so a crash
//! between the two writes, or a grant deleted under a request, converges on
//! the next reconcile instead of leaking a reservation.

use crate::controller::{ReconcileContext, Reconciler};
use crate::error::{ignore_not_found, LicensingError, LicensingResult};
use crate::infrastructure::{update_status_with, update_with};
use crate::matcher::GrantMatcher;
use crate::types::{
    Entitlement, GrantStatus, ObjectKey, Request, RequestPhase, GRANT_RELEASE_FINALIZER,
    PRIOR_GRANT_DELETED,
};

pub const GRANT_CLAIMED_ELSEWHERE: &str = "offered grant was claimed by another request";

pub struct RequestReconciler {
    ctx: ReconcileContext,
}

impl RequestReconciler {
    pub fn new(ctx: ReconcileContext) -> Self {
        Self { ctx }
    }

    pub fn reconcile(&self, key: &ObjectKey) -> LicensingResult<()> {
        let Some(request) = ignore_not_found(self.ctx.stores.requests.get(key))? else {
            return Ok(());
        };

        if request.metadata.is_deleting() {
            if request.metadata.has_finalizer(GRANT_RELEASE_FINALIZER) {
                self.release(&request)?;
            }
            return Ok(());
        }

        let written = update_with(
            self.ctx.stores.requests.as_ref(),
            key,
            &self.ctx.retry,
            |r: &mut Request| Ok(r.metadata.add_finalizer(GRANT_RELEASE_FINALIZER)),
        )?;
        let request = written.unwrap_or(request);

        match request.status.phase {
            RequestPhase::Discover => self.discover(&request),
            RequestPhase::Offer | RequestPhase::Acknowledged => self.heal_reference(&request),
        }
    }

    fn discover(&self, request: &Request) -> LicensingResult<()> {
        let key = request.metadata.key();
        let pool_key = &request.spec.entitlement;
        let Some(pool) = ignore_not_found(self.ctx.stores.entitlements.get(pool_key))? else {
            return self.set_message(&key, format!("entitlement {pool_key} not found"));
        };

        let grant = match GrantMatcher::select(&key, &request.spec, &pool.status.grants) {
            Ok(grant) => grant,
            Err(err @ LicensingError::NoMatchingGrant { .. }) => {
                self.release_pool(&key, pool_key)?;
                return self.set_message(&key, err.to_string());
            }
            Err(err) => return Err(err),
        };
        let grant_id = grant.id.clone();
        let secret = grant.license_secret.clone();

        let offered = update_status_with(
            self.ctx.stores.requests.as_ref(),
            &key,
            &self.ctx.retry,
            |r: &mut Request| {
                if r.status.phase != RequestPhase::Discover {
                    return Ok(false);
                }
                r.status.phase = RequestPhase::Offer;
                r.status.grant = Some(grant_id.clone());
                r.status.license_secret = Some(secret.clone());
                r.status.message = None;
                Ok(true)
            },
        )?;
        if offered.is_none() {
            return Ok(());
        }
        tracing::info!(request = %key, grant = %grant_id, "grant offered");

        // Another request may have reserved the grant since the pool was read.
        if !self.reserve(&key, pool_key, &grant_id, GrantStatus::Pending)? {
            return self.reset(&key, Some(&grant_id), GRANT_CLAIMED_ELSEWHERE);
        }
        Ok(())
    }

    /// Checks that the grant named by an Offer or Acknowledged request is
    /// still there and ours, and brings its reservation in line with the phase.
    pub fn heal_reference(&self, request: &Request) -> LicensingResult<()> {
        let key = request.metadata.key();
        let phase = request.status.phase;
        let Some(grant_id) = request.status.grant.clone() else {
            return self.reset(&key, None, "request lost its grant reference");
        };

        let pool_key = &request.spec.entitlement;
        let Some(pool) = ignore_not_found(self.ctx.stores.entitlements.get(pool_key))? else {
            return self.reset(&key, Some(&grant_id), PRIOR_GRANT_DELETED);
        };
        let Some(grant) = pool.status.grants.get(&grant_id) else {
            return self.reset(&key, Some(&grant_id), PRIOR_GRANT_DELETED);
        };
        if grant.is_claimed_by_other(&key) {
            return self.reset(&key, Some(&grant_id), GRANT_CLAIMED_ELSEWHERE);
        }

        let target = match phase {
            RequestPhase::Acknowledged => GrantStatus::InUse,
            // An Offer only re-reserves a grant whose Pending write was lost.
            _ if grant.is_free() => GrantStatus::Pending,
            _ => grant.status,
        };
        if !self.reserve(&key, pool_key, &grant_id, target)? {
            return self.reset(&key, Some(&grant_id), GRANT_CLAIMED_ELSEWHERE);
        }
        Ok(())
    }

    /// Marks `grant_id` as held by `request` and frees anything else it held.
    /// Returns whether the grant ended up held by `request`.
    fn reserve(
        &self,
        request: &ObjectKey,
        pool_key: &ObjectKey,
        grant_id: &str,
        status: GrantStatus,
    ) -> LicensingResult<bool> {
        let mut held = false;
        let written = update_status_with(
            self.ctx.stores.entitlements.as_ref(),
            pool_key,
            &self.ctx.retry,
            |ent: &mut Entitlement| {
                held = false;
                let mut changed = false;
                for id in ent.status.grants_held_by(request) {
                    if id != grant_id {
                        if let Some(stale) = ent.status.grants.get_mut(&id) {
                            changed |= stale.release();
                        }
                    }
                }
                if let Some(grant) = ent.status.grants.get_mut(grant_id) {
                    if !grant.is_claimed_by_other(request) {
                        changed |= grant.reserve(status, request);
                        held = true;
                    }
                }
                Ok(changed)
            },
        );
        match ignore_not_found(written)? {
            Some(Some(_)) => {
                tracing::info!(request = %request, entitlement = %pool_key, grant = grant_id, ?status, "grant reserved")
            }
            Some(None) => {}
            None => held = false,
        }
        Ok(held)
    }

    /// Frees every grant in the pool held by `request`.
    fn release_pool(&self, request: &ObjectKey, pool_key: &ObjectKey) -> LicensingResult<()> {
        let written = update_status_with(
            self.ctx.stores.entitlements.as_ref(),
            pool_key,
            &self.ctx.retry,
            |ent: &mut Entitlement| {
                let mut changed = false;
                for id in ent.status.grants_held_by(request) {
                    if let Some(grant) = ent.status.grants.get_mut(&id) {
                        changed |= grant.release();
                    }
                }
                Ok(changed)
            },
        );
        if let Some(Some(_)) = ignore_not_found(written)? {
            tracing::info!(request = %request, entitlement = %pool_key, "grants released");
        }
        Ok(())
    }

    fn release(&self, request: &Request) -> LicensingResult<()> {
        let key = request.metadata.key();
        self.release_pool(&key, &request.spec.entitlement)?;

        let result = update_with(
            self.ctx.stores.requests.as_ref(),
            &key,
            &self.ctx.retry,
            |r: &mut Request| Ok(r.metadata.remove_finalizer(GRANT_RELEASE_FINALIZER)),
        );
        ignore_not_found(result)?;
        tracing::info!(request = %key, "request removed");
        Ok(())
    }

    /// Returns the request to Discover, provided it still names `expected`.
    fn reset(&self, key: &ObjectKey, expected: Option<&str>, message: &str) -> LicensingResult<()> {
        let written = update_status_with(
            self.ctx.stores.requests.as_ref(),
            key,
            &self.ctx.retry,
            |r: &mut Request| {
                if r.status.phase == RequestPhase::Discover || r.status.grant.as_deref() != expected {
                    return Ok(false);
                }
                r.status.revoke(message);
                Ok(true)
            },
        )?;
        if written.is_some() {
            tracing::info!(request = %key, grant = ?expected, reason = message, "request reset to Discover");
        }
        Ok(())
    }

    fn set_message(&self, key: &ObjectKey, message: String) -> LicensingResult<()> {
        let written = update_status_with(
            self.ctx.stores.requests.as_ref(),
            key,
            &self.ctx.retry,
            |r: &mut Request| {
                if r.status.phase != RequestPhase::Discover
                    || r.status.message.as_deref() == Some(message.as_str())
                {
                    return Ok(false);
                }
                r.status.message = Some(message.clone());
                Ok(true)
            },
        )?;
        if written.is_some() {
            tracing::info!(request = %key, reason = %message, "request waiting");
        }
        Ok(())
    }
}

impl Reconciler for RequestReconciler {
    type Object = Request;

    const NAME: &'static str = "request";

    fn reconcile(&self, key: &ObjectKey) -> LicensingResult<()> {
        RequestReconciler::reconcile(self, key)
    }
}
