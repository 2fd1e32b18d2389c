//! Periodic revalidation of every grant against its backing token.

use crate::controller::{ReconcileContext, Reconciler};
use crate::error::{ignore_not_found, LicensingError, LicensingResult};
use crate::grant_deletion::delete_grant;
use crate::infrastructure::update_status_with;
use crate::types::{Entitlement, Grant, ObjectKey};

/// What a sweep decided for one grant.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Verdict {
    Keep {
        amount: u64,
        not_before: chrono::DateTime<chrono::Utc>,
        not_after: chrono::DateTime<chrono::Utc>,
    },
    Delete(&'static str),
}

pub struct EntitlementReconciler {
    ctx: ReconcileContext,
}

impl EntitlementReconciler {
    pub fn new(ctx: ReconcileContext) -> Self {
        Self { ctx }
    }

    fn judge(&self, entitlement: &str, grant: &Grant) -> LicensingResult<Verdict> {
        let Some(secret) = ignore_not_found(self.ctx.stores.secrets.get(&grant.license_secret))?
        else {
            return Ok(Verdict::Delete("backing secret missing"));
        };
        if !secret.is_license() {
            return Err(LicensingError::Unlabeled(grant.license_secret.clone()));
        }
        if secret.metadata.is_deleting() {
            // The secret reconciler owns teardown of grants whose secret is going away.
            return Ok(Verdict::Delete("backing secret deleting"));
        }

        let token = match self
            .ctx
            .trust
            .verify(secret.license_token().unwrap_or_default().as_bytes())
        {
            Ok(token) => token,
            Err(_) => return Ok(Verdict::Delete("backing token invalid")),
        };
        if token.id != grant.id {
            return Ok(Verdict::Delete("backing token reissued"));
        }
        if !token.is_valid_at(self.ctx.clock.now()) {
            return Ok(Verdict::Delete("backing token outside validity window"));
        }
        match token.amount_for(entitlement, &grant.unit) {
            Some(amount) => Ok(Verdict::Keep {
                amount,
                not_before: token.not_before,
                not_after: token.not_after,
            }),
            None => Ok(Verdict::Delete("token no longer grants this unit")),
        }
    }

    /// Judges every grant first so an unlabeled secret aborts before anything changes.
    fn sweep(&self, entitlement: &mut Entitlement) -> LicensingResult<bool> {
        let name = entitlement.metadata.name.clone();
        let verdicts = entitlement
            .status
            .grants
            .values()
            .map(|grant| Ok((grant.id.clone(), self.judge(&name, grant)?)))
            .collect::<LicensingResult<Vec<_>>>()?;

        let before = entitlement.status.clone();
        for (id, verdict) in verdicts {
            match verdict {
                Verdict::Delete(reason) => {
                    tracing::info!(entitlement = %entitlement.metadata.key(), grant = %id, reason, "revoking grant");
                    delete_grant(
                        self.ctx.stores.requests.as_ref(),
                        &self.ctx.retry,
                        entitlement,
                        &id,
                    );
                }
                Verdict::Keep {
                    amount,
                    not_before,
                    not_after,
                } => {
                    if let Some(grant) = entitlement.status.grants.get_mut(&id) {
                        grant.amount = amount;
                        grant.not_before = not_before;
                        grant.not_after = not_after;
                    }
                }
            }
        }
        entitlement.status.recompute_aggregates();
        Ok(entitlement.status != before)
    }

    pub fn reconcile(&self, key: &ObjectKey) -> LicensingResult<()> {
        let result = update_status_with(
            self.ctx.stores.entitlements.as_ref(),
            key,
            &self.ctx.retry,
            |entitlement: &mut Entitlement| self.sweep(entitlement),
        );
        match ignore_not_found(result)? {
            Some(Some(ent)) => tracing::debug!(
                entitlement = %key,
                grants = ent.status.grants.len(),
                licenses = ent.status.licenses,
                "entitlement revalidated"
            ),
            Some(None) | None => {}
        }
        Ok(())
    }
}

impl Reconciler for EntitlementReconciler {
    type Object = Entitlement;

    const NAME: &'static str = "entitlement";

    fn reconcile(&self, key: &ObjectKey) -> LicensingResult<()> {
        EntitlementReconciler::reconcile(self, key)
    }
}
