//! Ingests signed tokens from labeled secrets into entitlement grant pools.

use std::collections::BTreeSet;

use crate::controller::{ReconcileContext, Reconciler};
use crate::error::{ignore_not_found, LicensingError, LicensingResult};
use crate::grant_deletion::delete_grant;
use crate::infrastructure::{update_status_with, update_with, Selector};
use crate::token::LicenseToken;
use crate::types::{
    Entitlement, Grant, GrantStatus, ObjectKey, Resource, Secret, GRANT_CLEANUP_FINALIZER,
};

pub struct SecretReconciler {
    ctx: ReconcileContext,
}

impl SecretReconciler {
    pub fn new(ctx: ReconcileContext) -> Self {
        Self { ctx }
    }

    pub fn reconcile(&self, key: &ObjectKey) -> LicensingResult<()> {
        let Some(secret) = ignore_not_found(self.ctx.stores.secrets.get(key))? else {
            return Ok(());
        };

        if secret.metadata.is_deleting() {
            if secret.metadata.has_finalizer(GRANT_CLEANUP_FINALIZER) {
                self.on_remove(&secret)?;
            }
            return Ok(());
        }

        if !secret.is_license() {
            // Label dropped after we started tracking it: stop blocking deletion.
            if secret.metadata.has_finalizer(GRANT_CLEANUP_FINALIZER) {
                self.set_finalizer(key, false)?;
            }
            return Ok(());
        }

        self.set_finalizer(key, true)?;

        let token = match self
            .ctx
            .trust
            .verify(secret.license_token().unwrap_or_default().as_bytes())
        {
            Ok(token) => token,
            Err(err) => {
                tracing::warn!(secret = %key, error = %err, "ignoring secret with invalid license token");
                return Ok(());
            }
        };

        self.ingest(key, &token)
    }

    fn ingest(&self, secret: &ObjectKey, token: &LicenseToken) -> LicensingResult<()> {
        let in_window = token.is_valid_at(self.ctx.clock.now());
        let mut seen = BTreeSet::new();

        for entry in token.grant_entries() {
            let (grant_key, amount) = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(secret = %secret, license = %token.id, error = %err, "skipping grant entry");
                    continue;
                }
            };
            // Grants are keyed by token id, so one token yields one grant per pool.
            if !seen.insert(grant_key.entitlement.clone()) {
                tracing::warn!(
                    secret = %secret,
                    license = %token.id,
                    grant = %grant_key,
                    "token already granted another unit of this entitlement; skipping"
                );
                continue;
            }

            let entitlement = ObjectKey::new(secret.namespace.clone(), grant_key.entitlement.clone());
            self.ensure_entitlement(&entitlement)?;

            if !in_window {
                tracing::info!(
                    secret = %secret,
                    license = %token.id,
                    not_before = %token.not_before,
                    not_after = %token.not_after,
                    "license outside its validity window; not adding grant"
                );
                continue;
            }

            let incoming = Grant {
                id: token.id.clone(),
                amount,
                unit: grant_key.unit.clone(),
                not_before: token.not_before,
                not_after: token.not_after,
                license_secret: secret.clone(),
                status: GrantStatus::Free,
                request: None,
            };

            let written = update_status_with(
                self.ctx.stores.entitlements.as_ref(),
                &entitlement,
                &self.ctx.retry,
                |ent: &mut Entitlement| Ok(upsert_grant(ent, incoming.clone())),
            )?;
            if written.is_some() {
                tracing::info!(
                    entitlement = %entitlement,
                    grant = %token.id,
                    unit = %grant_key.unit,
                    amount,
                    "grant upserted"
                );
            }
        }
        Ok(())
    }

    fn ensure_entitlement(&self, key: &ObjectKey) -> LicensingResult<()> {
        let entitlements = &self.ctx.stores.entitlements;
        if ignore_not_found(entitlements.get(key))?.is_some() {
            return Ok(());
        }
        match entitlements.create(Entitlement::new(key.namespace.clone(), key.name.clone())) {
            Ok(_) => {
                tracing::info!(entitlement = %key, "entitlement created");
                Ok(())
            }
            Err(LicensingError::AlreadyExists { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Removes every grant backed by `secret`, then releases the finalizer.
    fn on_remove(&self, secret: &Secret) -> LicensingResult<()> {
        let secret_key = secret.key();
        let pools = self
            .ctx
            .stores
            .entitlements
            .list(&Selector::namespace(secret_key.namespace.clone()))?;

        for pool in pools {
            if !pool.status.grants.values().any(|g| g.license_secret == secret_key) {
                continue;
            }
            let result = update_status_with(
                self.ctx.stores.entitlements.as_ref(),
                &pool.key(),
                &self.ctx.retry,
                |ent: &mut Entitlement| {
                    let backed: Vec<String> = ent
                        .status
                        .grants
                        .values()
                        .filter(|g| g.license_secret == secret_key)
                        .map(|g| g.id.clone())
                        .collect();
                    if backed.is_empty() {
                        return Ok(false);
                    }
                    for id in &backed {
                        delete_grant(
                            self.ctx.stores.requests.as_ref(),
                            &self.ctx.retry,
                            ent,
                            id,
                        );
                    }
                    ent.status.recompute_aggregates();
                    Ok(true)
                },
            );
            ignore_not_found(result)?;
        }

        self.set_finalizer(&secret_key, false)?;
        tracing::info!(secret = %secret_key, "license secret removed");
        Ok(())
    }

    fn set_finalizer(&self, key: &ObjectKey, present: bool) -> LicensingResult<()> {
        let result = update_with(
            self.ctx.stores.secrets.as_ref(),
            key,
            &self.ctx.retry,
            |secret: &mut Secret| {
                Ok(if present {
                    secret.metadata.add_finalizer(GRANT_CLEANUP_FINALIZER)
                } else {
                    secret.metadata.remove_finalizer(GRANT_CLEANUP_FINALIZER)
                })
            },
        );
        ignore_not_found(result).map(|_| ())
    }
}

/// Inserts or refreshes `incoming`, keeping any live reservation.
/// Returns true if the pool changed.
fn upsert_grant(entitlement: &mut Entitlement, mut incoming: Grant) -> bool {
    if let Some(existing) = entitlement.status.grants.get(&incoming.id) {
        // A refresh must never free an allocated grant.
        incoming.status = existing.status;
        incoming.request = existing.request.clone();
        if *existing == incoming {
            return false;
        }
    }
    entitlement
        .status
        .grants
        .insert(incoming.id.clone(), incoming);
    entitlement.status.recompute_aggregates();
    true
}

impl Reconciler for SecretReconciler {
    type Object = Secret;

    const NAME: &'static str = "secret";

    fn reconcile(&self, key: &ObjectKey) -> LicensingResult<()> {
        SecretReconciler::reconcile(self, key)
    }
}
