//! Application-side entry point: declare a usage intent and learn whether it
//! is licensed.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};

use crate::clock::{Clock, SystemClock};
use crate::config::ClientConfig;
use crate::error::{ignore_not_found, LicensingError, LicensingResult};
use crate::infrastructure::{update_status_with, update_with, Stores};
use crate::notifier::Notifier;
use crate::retry::retry_on_conflict;
use crate::token::TrustAnchors;
use crate::types::{ObjectKey, ObjectMeta, Request, RequestPhase, RequestSpec, ResourceKind};

/// What an application wants to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseIntent {
    /// Entitlement name in the client's namespace
    pub entitlement: String,
    pub unit: String,
    pub amount: u64,
}

impl LicenseIntent {
    pub fn new(entitlement: impl Into<String>, unit: impl Into<String>, amount: u64) -> Self {
        Self {
            entitlement: entitlement.into(),
            unit: unit.into(),
            amount,
        }
    }
}

/// Live view of one request's license state.
///
/// Yields `Some(true)` once acknowledged and `Some(false)` when the request is
/// deleted or its license is revoked. Dropping it stops tracking.
pub struct LicenseSubscription {
    rx: watch::Receiver<Option<bool>>,
    notifier: Arc<Notifier>,
    uid: String,
    key: ObjectKey,
}

impl LicenseSubscription {
    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    /// Latest delivered value without waiting.
    pub fn current(&self) -> Option<bool> {
        *self.rx.borrow()
    }

    /// Waits for the next delivered value. `None` once tracking stopped.
    pub async fn next(&mut self) -> Option<bool> {
        self.rx.changed().await.ok()?;
        *self.rx.borrow_and_update()
    }

    /// Waits for the first value, which may already be there.
    pub async fn settled(&mut self) -> LicensingResult<bool> {
        loop {
            if let Some(licensed) = *self.rx.borrow_and_update() {
                return Ok(licensed);
            }
            if self.rx.changed().await.is_err() {
                return Err(LicensingError::Runtime("license notifier stopped".to_string()));
            }
        }
    }
}

impl Drop for LicenseSubscription {
    fn drop(&mut self) {
        self.notifier.unregister(&self.uid);
    }
}

pub struct LicenseClient {
    stores: Stores,
    notifier: Arc<Notifier>,
    config: ClientConfig,
    runtime: Handle,
    shutdown: watch::Sender<bool>,
}

impl LicenseClient {
    /// Starts the notifier on the current tokio runtime.
    pub fn start(
        stores: Stores,
        trust: Arc<TrustAnchors>,
        config: ClientConfig,
    ) -> LicensingResult<Self> {
        Self::start_with_clock(stores, trust, Arc::new(SystemClock), config)
    }

    pub fn start_with_clock(
        stores: Stores,
        trust: Arc<TrustAnchors>,
        clock: Arc<dyn Clock>,
        config: ClientConfig,
    ) -> LicensingResult<Self> {
        let runtime = Handle::try_current().map_err(|e| LicensingError::Runtime(e.to_string()))?;
        let notifier = Arc::new(Notifier::new(
            stores.clone(),
            trust,
            clock,
            config.retry.clone(),
        ));
        let (shutdown, signal) = watch::channel(false);

        // Subscribe now so no transition after setup can be missed.
        let events = stores.requests.watch();
        runtime.spawn(run_notifier(notifier.clone(), events, signal));

        tracing::info!(namespace = %config.namespace, identifier = %config.identifier, "license client started");
        Ok(Self {
            stores,
            notifier,
            config,
            runtime,
            shutdown,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Blocks until the intent is licensed or refused.
    ///
    /// Must not be called from inside an async task; use
    /// [`license_async`](Self::license_async) there.
    pub fn license(
        &self,
        intent: &LicenseIntent,
        timeout: Option<Duration>,
    ) -> LicensingResult<bool> {
        let mut subscription = self.subscribe(intent)?;
        self.runtime.block_on(async move {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, subscription.settled())
                    .await
                    .map_err(|_| LicensingError::Timeout)?,
                None => subscription.settled().await,
            }
        })
    }

    /// Sets up the request and returns a subscription to its license state.
    pub async fn license_async(
        &self,
        intent: &LicenseIntent,
    ) -> LicensingResult<LicenseSubscription> {
        let stores = self.stores.clone();
        let notifier = self.notifier.clone();
        let config = self.config.clone();
        let intent = intent.clone();
        tokio::task::spawn_blocking(move || setup(&stores, &notifier, &config, &intent))
            .await
            .map_err(|e| LicensingError::Runtime(e.to_string()))?
    }

    /// Deletes the request named `identifier`, releasing its grant.
    pub fn release(&self, identifier: &str) -> LicensingResult<()> {
        let key = ObjectKey::new(self.config.namespace.clone(), identifier);
        if ignore_not_found(self.stores.requests.delete(&key))?.is_some() {
            tracing::info!(request = %key, "license released");
        }
        Ok(())
    }

    fn subscribe(&self, intent: &LicenseIntent) -> LicensingResult<LicenseSubscription> {
        setup(&self.stores, &self.notifier, &self.config, intent)
    }
}

impl Drop for LicenseClient {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Creates or updates this instance's request, resets it to Discover and
/// registers it with the notifier.
fn setup(
    stores: &Stores,
    notifier: &Arc<Notifier>,
    config: &ClientConfig,
    intent: &LicenseIntent,
) -> LicensingResult<LicenseSubscription> {
    let key = ObjectKey::new(config.namespace.clone(), config.identifier.clone());
    let spec = RequestSpec {
        entitlement: ObjectKey::new(config.namespace.clone(), intent.entitlement.clone()),
        unit: intent.unit.clone(),
        amount: intent.amount,
    };

    let request = retry_on_conflict(&config.retry, || {
        match ignore_not_found(stores.requests.get(&key))? {
            Some(existing) if existing.metadata.is_deleting() => Err(LicensingError::Conflict {
                kind: ResourceKind::Request,
                key: key.clone(),
            }),
            Some(_) => {
                let updated = update_with(stores.requests.as_ref(), &key, &config.retry, |r: &mut Request| {
                    if r.spec == spec {
                        return Ok(false);
                    }
                    r.spec = spec.clone();
                    Ok(true)
                })?;
                match updated {
                    Some(request) => Ok(request),
                    None => stores.requests.get(&key),
                }
            }
            None => match stores
                .requests
                .create(Request::new(ObjectMeta::new(key.namespace.clone(), key.name.clone()), spec.clone()))
            {
                Err(LicensingError::AlreadyExists { kind, key }) => {
                    Err(LicensingError::Conflict { kind, key })
                }
                created => created,
            },
        }
    })?;

    let reset = ignore_not_found(update_status_with(stores.requests.as_ref(), &key, &config.retry, |r: &mut Request| {
        if r.status.phase == RequestPhase::Discover && r.status.grant.is_none() {
            return Ok(false);
        }
        r.status.phase = RequestPhase::Discover;
        r.status.grant = None;
        r.status.license_secret = None;
        r.status.message = None;
        Ok(true)
    }))?;
    // A request deleted this early is reported as unlicensed below.
    let request = reset.flatten().unwrap_or(request);

    let rx = notifier.register(&request);
    let subscription = LicenseSubscription {
        rx,
        notifier: notifier.clone(),
        uid: request.metadata.uid.clone(),
        key: key.clone(),
    };

    // Anything written between the reset and the registration is picked up here.
    match ignore_not_found(stores.requests.get(&key))? {
        Some(latest) if latest.metadata.uid == request.metadata.uid => {
            notifier.evaluate(&latest, false)?
        }
        _ => notifier.evaluate(&request, true)?,
    }

    tracing::info!(request = %key, entitlement = %spec.entitlement, unit = %spec.unit, amount = spec.amount, "license requested");
    Ok(subscription)
}

async fn run_notifier(
    notifier: Arc<Notifier>,
    mut events: broadcast::Receiver<crate::infrastructure::WatchEvent<Request>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let notifier = notifier.clone();
                let outcome = match event {
                    Ok(event) => tokio::task::spawn_blocking(move || notifier.handle(&event)).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "request watch lagged; resyncing");
                        tokio::task::spawn_blocking(move || notifier.resync()).await
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => tracing::warn!(error = %err, "notifier could not process request change"),
                    Err(err) => tracing::error!(error = %err, "notifier task failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!("license notifier stopped");
}
