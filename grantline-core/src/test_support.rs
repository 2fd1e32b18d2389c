//! Fixtures shared by the unit tests.

use chrono::{DateTime, TimeZone, Utc};
use rsa::RsaPrivateKey;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use crate::clock::ManualClock;
use crate::controller::ReconcileContext;
use crate::error::LicensingResult;
use crate::infrastructure::{ResourceStore, Selector, Stores, WatchEvent};
use crate::infrastructure_in_memory::InMemoryStore;
use crate::keys;
use crate::retry::RetryPolicy;
use crate::token::{sign, LicenseToken, TrustAnchors};
use crate::types::{
    Entitlement, Grant, GrantStatus, ObjectKey, ObjectMeta, Request, RequestSpec, Resource,
    Secret,
};

pub const NS: &str = "tenant";

pub fn trusted_key() -> RsaPrivateKey {
    keys::decode_private_key(include_str!("../testdata/trusted.key")).unwrap()
}

pub fn untrusted_key() -> RsaPrivateKey {
    keys::decode_private_key(include_str!("../testdata/untrusted.key")).unwrap()
}

pub fn trust() -> Arc<TrustAnchors> {
    Arc::new(TrustAnchors::from_pems([include_str!("../testdata/trusted.pub")]).unwrap())
}

pub fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
}

/// Fixed "now" inside every default token window.
pub fn now() -> DateTime<Utc> {
    at(2026, 6, 1)
}

/// A token valid for all of 2026.
pub fn token(id: &str, grants: &[(&str, u64)]) -> LicenseToken {
    LicenseToken {
        id: id.to_string(),
        licensee: "Acme Corp".to_string(),
        metadata: BTreeMap::from([("tier".to_string(), "gold".to_string())]),
        grants: grants.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        not_before: at(2026, 1, 1),
        not_after: at(2027, 1, 1),
    }
}

pub fn signed(token: &LicenseToken) -> String {
    sign(token, &trusted_key()).unwrap()
}

pub fn license_secret(name: &str, token: &LicenseToken) -> Secret {
    Secret::license(NS, name, signed(token))
}

pub fn key(name: &str) -> ObjectKey {
    ObjectKey::new(NS, name)
}

pub fn grant(id: &str, unit: &str, amount: u64, secret: &str) -> Grant {
    Grant {
        id: id.to_string(),
        amount,
        unit: unit.to_string(),
        not_before: at(2026, 1, 1),
        not_after: at(2027, 1, 1),
        license_secret: key(secret),
        status: GrantStatus::Free,
        request: None,
    }
}

pub fn request(name: &str, entitlement: &str, unit: &str, amount: u64) -> Request {
    Request::new(
        ObjectMeta::new(NS, name),
        RequestSpec {
            entitlement: key(entitlement),
            unit: unit.to_string(),
            amount,
        },
    )
}

/// An in-memory store with a manual clock and an immediate retry policy.
pub struct Harness {
    pub stores: Stores,
    pub clock: Arc<ManualClock>,
    pub ctx: ReconcileContext,
}

impl Harness {
    pub fn new() -> Self {
        let (_, stores) = InMemoryStore::shared();
        let clock = Arc::new(ManualClock::new(now()));
        let ctx = ReconcileContext {
            stores: stores.clone(),
            trust: trust(),
            clock: clock.clone(),
            retry: RetryPolicy::immediate(5),
        };
        Self {
            stores,
            clock,
            ctx,
        }
    }

    /// Same backend, but entitlement status writes go through `store`.
    pub fn with_entitlements(&self, store: Arc<dyn ResourceStore<Entitlement>>) -> ReconcileContext {
        let mut ctx = self.ctx.clone();
        ctx.stores.entitlements = store;
        ctx
    }

    pub fn put_secret(&self, secret: Secret) -> Secret {
        self.stores.secrets.create(secret).unwrap()
    }

    /// Creates an entitlement holding `grants`.
    pub fn put_pool(&self, name: &str, grants: Vec<Grant>) -> Entitlement {
        let created = self.stores.entitlements.create(Entitlement::new(NS, name)).unwrap();
        let mut pool = created.clone();
        for grant in grants {
            pool.status.grants.insert(grant.id.clone(), grant);
        }
        pool.status.recompute_aggregates();
        self.stores.entitlements.update_status(pool).unwrap()
    }

    pub fn put_request(&self, request: Request) -> Request {
        let status = request.status.clone();
        let mut created = self.stores.requests.create(request).unwrap();
        if created.status != status {
            created.status = status;
            created = self.stores.requests.update_status(created).unwrap();
        }
        created
    }

    pub fn pool(&self, name: &str) -> Entitlement {
        self.stores.entitlements.get(&key(name)).unwrap()
    }

    pub fn request(&self, name: &str) -> Request {
        self.stores.requests.get(&key(name)).unwrap()
    }
}

type Interference = Box<dyn FnOnce() + Send>;

/// Runs a queued concurrent writer right before each status write, so the
/// write arrives with a stale version.
pub struct InterferingStore<R: Resource> {
    inner: Arc<dyn ResourceStore<R>>,
    pending: Mutex<Vec<Interference>>,
}

impl<R: Resource> InterferingStore<R> {
    pub fn new(inner: Arc<dyn ResourceStore<R>>) -> Self {
        Self {
            inner,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn interfere(&self, writer: impl FnOnce() + Send + 'static) {
        self.pending.lock().unwrap().push(Box::new(writer));
    }

    fn run_pending(&self) {
        let next = {
            let mut pending = self.pending.lock().unwrap();
            if pending.is_empty() { None } else { Some(pending.remove(0)) }
        };
        if let Some(writer) = next {
            writer();
        }
    }
}

impl<R: Resource> ResourceStore<R> for InterferingStore<R> {
    fn get(&self, key: &ObjectKey) -> LicensingResult<R> {
        self.inner.get(key)
    }

    fn list(&self, selector: &Selector) -> LicensingResult<Vec<R>> {
        self.inner.list(selector)
    }

    fn create(&self, object: R) -> LicensingResult<R> {
        self.inner.create(object)
    }

    fn update(&self, object: R) -> LicensingResult<R> {
        self.inner.update(object)
    }

    fn update_status(&self, object: R) -> LicensingResult<R> {
        self.run_pending();
        self.inner.update_status(object)
    }

    fn delete(&self, key: &ObjectKey) -> LicensingResult<()> {
        self.inner.delete(key)
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent<R>> {
        self.inner.watch()
    }
}
