//! Client-side watcher that turns request transitions into license signals.
//!
//! Each registered request gets a single-slot latest-value channel. `true`
//! means the request reached Acknowledged. `false` means it was deleted, or
//! lost a license it had been granted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::clock::Clock;
use crate::error::{ignore_not_found, LicensingResult};
use crate::infrastructure::{update_status_with, Stores, WatchEvent};
use crate::retry::RetryPolicy;
use crate::token::TrustAnchors;
use crate::types::{ObjectKey, Request, RequestPhase};

struct Registration {
    key: ObjectKey,
    /// Changes older than the registration are stale
    min_version: u64,
    tx: watch::Sender<Option<bool>>,
    /// A `true` has been delivered
    licensed: bool,
}

pub struct Notifier {
    stores: Stores,
    trust: Arc<TrustAnchors>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    registrations: Mutex<HashMap<String, Registration>>,
}

impl Notifier {
    pub fn new(
        stores: Stores,
        trust: Arc<TrustAnchors>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            stores,
            trust,
            clock,
            retry,
            registrations: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Registration>> {
        self.registrations.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Starts tracking `request` by uid, replacing any earlier registration.
    /// Changes older than `request` are ignored.
    pub fn register(&self, request: &Request) -> watch::Receiver<Option<bool>> {
        let (tx, rx) = watch::channel(None);
        self.lock().insert(
            request.metadata.uid.clone(),
            Registration {
                key: request.metadata.key(),
                min_version: request.metadata.resource_version,
                tx,
                licensed: false,
            },
        );
        rx
    }

    pub fn unregister(&self, uid: &str) {
        self.lock().remove(uid);
    }

    pub fn is_registered(&self, uid: &str) -> bool {
        self.lock().contains_key(uid)
    }

    fn is_current(&self, request: &Request) -> bool {
        self.lock()
            .get(&request.metadata.uid)
            .is_some_and(|reg| request.metadata.resource_version >= reg.min_version)
    }

    pub fn registered_keys(&self) -> Vec<ObjectKey> {
        self.lock().values().map(|r| r.key.clone()).collect()
    }

    pub fn handle(&self, event: &WatchEvent<Request>) -> LicensingResult<()> {
        self.evaluate(event.object(), event.is_deleted())
    }

    /// Re-reads every registered request. Used after the watch lagged.
    pub fn resync(&self) -> LicensingResult<()> {
        for key in self.registered_keys() {
            match ignore_not_found(self.stores.requests.get(&key))? {
                Some(request) => self.evaluate(&request, false)?,
                None => self.deliver_removed(&key),
            }
        }
        Ok(())
    }

    pub fn evaluate(&self, request: &Request, deleted: bool) -> LicensingResult<()> {
        let uid = &request.metadata.uid;
        if deleted {
            self.deliver(uid, false);
            return Ok(());
        }
        if !self.is_current(request) {
            return Ok(());
        }

        if request.metadata.is_deleting() {
            self.deliver(uid, false);
            return Ok(());
        }

        match request.status.phase {
            RequestPhase::Offer => self.acknowledge(request).map(|_| ()),
            RequestPhase::Acknowledged => {
                self.deliver(uid, true);
                Ok(())
            }
            RequestPhase::Discover => {
                let revoked = {
                    let mut registrations = self.lock();
                    match registrations.get_mut(uid) {
                        Some(reg) if reg.licensed => {
                            reg.licensed = false;
                            let _ = reg.tx.send(Some(false));
                            true
                        }
                        _ => false,
                    }
                };
                if revoked {
                    tracing::warn!(
                        request = %request.metadata.key(),
                        reason = request.status.message.as_deref().unwrap_or_default(),
                        "license revoked"
                    );
                }
                Ok(())
            }
        }
    }

    fn deliver(&self, uid: &str, licensed: bool) {
        if let Some(reg) = self.lock().get_mut(uid) {
            if licensed == reg.licensed && reg.tx.borrow().is_some() {
                return;
            }
            reg.licensed = licensed;
            let _ = reg.tx.send(Some(licensed));
            tracing::debug!(request = %reg.key, licensed, "license signal delivered");
        }
    }

    fn deliver_removed(&self, key: &ObjectKey) {
        let uids: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, reg)| reg.key == *key)
            .map(|(uid, _)| uid.clone())
            .collect();
        for uid in uids {
            self.deliver(&uid, false);
        }
    }

    /// Checks the offered grant against the token in its secret, then
    /// acknowledges it or records why it was refused. Returns the verdict.
    pub fn acknowledge(&self, request: &Request) -> LicensingResult<Result<(), String>> {
        let key = request.metadata.key();
        let offered = request.status.grant.clone();

        let verdict = self.check_offer(request);
        let written = update_status_with(
            self.stores.requests.as_ref(),
            &key,
            &self.retry,
            |r: &mut Request| {
                if r.status.phase != RequestPhase::Offer || r.status.grant != offered {
                    return Ok(false);
                }
                match &verdict {
                    Ok(()) => {
                        r.status.phase = RequestPhase::Acknowledged;
                        r.status.message = None;
                    }
                    Err(reason) => {
                        let message = format!("offer rejected: {reason}");
                        if r.status.message.as_deref() == Some(message.as_str()) {
                            return Ok(false);
                        }
                        r.status.message = Some(message);
                    }
                }
                Ok(true)
            },
        );

        match (ignore_not_found(written)?, &verdict) {
            (Some(Some(_)), Ok(())) => {
                tracing::info!(request = %key, grant = ?offered, "offer acknowledged")
            }
            (Some(Some(_)), Err(reason)) => {
                tracing::warn!(request = %key, grant = ?offered, reason = %reason, "offer rejected")
            }
            _ => {}
        }
        Ok(verdict)
    }

    fn check_offer(&self, request: &Request) -> Result<(), String> {
        let grant = request
            .status
            .grant
            .as_deref()
            .ok_or_else(|| "offer names no grant".to_string())?;
        let secret_key = request
            .status
            .license_secret
            .as_ref()
            .ok_or_else(|| "offer names no license secret".to_string())?;

        let secret = self
            .stores
            .secrets
            .get(secret_key)
            .map_err(|e| e.to_string())?;
        let token = self
            .trust
            .verify(secret.license_token().unwrap_or_default().as_bytes())
            .map_err(|e| e.to_string())?;

        if !token.is_valid_at(self.clock.now()) {
            return Err(format!(
                "license {} is valid only from {} until {}",
                token.id, token.not_before, token.not_after
            ));
        }
        if token.id != grant {
            return Err(format!("license {} does not back grant {grant}", token.id));
        }
        let spec = &request.spec;
        match token.amount_for(&spec.entitlement.name, &spec.unit) {
            Some(amount) if amount >= spec.amount => {}
            Some(amount) => {
                return Err(format!(
                    "license grants {amount} {} but {} were requested",
                    spec.unit, spec.amount
                ))
            }
            None => return Err(format!("license does not grant {}", request.grant_key())),
        }

        let pool = self
            .stores
            .entitlements
            .get(&spec.entitlement)
            .map_err(|e| e.to_string())?;
        match pool.status.grants.get(grant) {
            None => Err(format!("grant {grant} is no longer in {}", spec.entitlement)),
            Some(held) if held.is_claimed_by_other(&request.metadata.key()) => {
                Err(format!("grant {grant} is held by another request"))
            }
            Some(_) => Ok(()),
        }
    }
}
