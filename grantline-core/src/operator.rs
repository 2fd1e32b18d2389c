//! Wires the secret, entitlement and request controllers together.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::config::OperatorConfig;
use crate::controller::{spawn_related, Controller, ReconcileContext};
use crate::entitlement_reconciler::EntitlementReconciler;
use crate::infrastructure::{ResourceStore, Selector, Stores};
use crate::request_reconciler::RequestReconciler;
use crate::secret_reconciler::SecretReconciler;
use crate::token::TrustAnchors;
use crate::types::{Entitlement, ObjectKey, Request, Resource, Secret};

/// The running control plane. Dropping it does not stop the tasks; call
/// [`Operator::shutdown`].
pub struct Operator {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Operator {
    /// Starts all controllers on the current tokio runtime.
    pub fn spawn(
        stores: Stores,
        trust: Arc<TrustAnchors>,
        clock: Arc<dyn Clock>,
        config: &OperatorConfig,
    ) -> Self {
        let (shutdown, signal) = watch::channel(false);
        let ctx = ReconcileContext {
            stores: stores.clone(),
            trust,
            clock,
            retry: config.retry.clone(),
        };
        let controller_config = config.controller();

        let secrets = Controller::new(
            SecretReconciler::new(ctx.clone()),
            stores.secrets.clone(),
            controller_config.clone(),
        );
        let entitlements = Controller::new(
            EntitlementReconciler::new(ctx.clone()),
            stores.entitlements.clone(),
            controller_config.clone(),
        );
        let requests = Controller::new(
            RequestReconciler::new(ctx),
            stores.requests.clone(),
            controller_config,
        );

        let mut handles = Vec::new();

        // New capacity re-evaluates requests waiting on the pool.
        let request_store = stores.requests.clone();
        handles.push(spawn_related(
            "entitlement->request",
            stores.entitlements.clone(),
            requests.queue(),
            move |entitlement: &Entitlement| requests_targeting(&request_store, &entitlement.key()),
            signal.clone(),
        ));

        // Secrets removed without a tombstone still invalidate their grants.
        let entitlement_store = stores.entitlements.clone();
        handles.push(spawn_related(
            "secret->entitlement",
            stores.secrets.clone(),
            entitlements.queue(),
            move |secret: &Secret| pools_backed_by(&entitlement_store, &secret.key()),
            signal.clone(),
        ));

        handles.extend(secrets.spawn(signal.clone()));
        handles.extend(entitlements.spawn(signal.clone()));
        handles.extend(requests.spawn(signal));

        tracing::info!(tasks = handles.len(), "operator started");
        Self { shutdown, handles }
    }

    /// Signals every controller to stop and waits for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "controller task failed");
            }
        }
        tracing::info!("operator stopped");
    }
}

fn requests_targeting(
    requests: &Arc<dyn ResourceStore<Request>>,
    entitlement: &ObjectKey,
) -> Vec<ObjectKey> {
    match requests.list(&Selector::namespace(entitlement.namespace.clone())) {
        Ok(found) => found
            .iter()
            .filter(|r| r.spec.entitlement == *entitlement)
            .map(Resource::key)
            .collect(),
        Err(err) => {
            tracing::warn!(entitlement = %entitlement, error = %err, "cannot list requests");
            Vec::new()
        }
    }
}

fn pools_backed_by(
    entitlements: &Arc<dyn ResourceStore<Entitlement>>,
    secret: &ObjectKey,
) -> Vec<ObjectKey> {
    match entitlements.list(&Selector::namespace(secret.namespace.clone())) {
        Ok(found) => found
            .iter()
            .filter(|e| e.status.grants.values().any(|g| g.license_secret == *secret))
            .map(Resource::key)
            .collect(),
        Err(err) => {
            tracing::warn!(secret = %secret, error = %err, "cannot list entitlements");
            Vec::new()
        }
    }
}
