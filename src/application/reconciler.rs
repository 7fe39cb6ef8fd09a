use crate::domain::entitlement::{
    EntitlementRecord, EntitlementStatus, IntentOutcome, RegistrationIntent, ResourceStatus,
};
use crate::domain::payment::PaymentMethod;
use crate::domain::ports::RemoteApi;
use crate::error::{ApiError, FlowError};
use crate::infrastructure::in_memory::LocalEntitlementStore;
use std::sync::Arc;
use tracing::{info, warn};

/// Settles what a registration write actually did.
///
/// A duplicate/conflict response from the backend does not say whether the
/// registration exists, so the reconciler re-reads the authoritative listing
/// instead of interpreting the error. Only that read decides. When it fails
/// too, the outcome stays `Unknown` and no record is rewritten.
#[derive(Clone)]
pub struct EntitlementReconciler {
    api: Arc<dyn RemoteApi>,
    store: LocalEntitlementStore,
}

impl EntitlementReconciler {
    pub fn new(api: Arc<dyn RemoteApi>, store: LocalEntitlementStore) -> Self {
        Self { api, store }
    }

    /// Registers the user for a resource and settles the intent outcome.
    ///
    /// Clean writes confirm immediately. Ambiguous writes fall through to
    /// `reconcile`; unambiguous rejections report failure without touching
    /// the local record.
    pub async fn register_or_reconcile(
        &self,
        resource_id: &str,
        user_id: &str,
        method: PaymentMethod,
        phone: Option<&str>,
        payment_reference: Option<&str>,
    ) -> RegistrationIntent {
        let mut intent = RegistrationIntent::new(resource_id, user_id, payment_reference);
        match self
            .api
            .register_for_resource(resource_id, user_id, method, phone)
            .await
        {
            Ok(()) => {
                self.store
                    .apply(EntitlementRecord::confirmed(
                        resource_id,
                        user_id,
                        EntitlementStatus::Active,
                    ))
                    .await;
                intent.outcome = IntentOutcome::Confirmed;
            }
            Err(err) if err.is_ambiguous() => {
                info!(resource_id, %err, "ambiguous registration write, reconciling");
                intent.outcome = self.reconcile(resource_id, user_id).await;
            }
            Err(err) => {
                // A clean rejection says nothing about what the user already
                // holds; the local record is left alone.
                warn!(resource_id, %err, "registration rejected");
                intent.outcome = IntentOutcome::Failed;
            }
        }
        intent
    }

    /// Settles an ambiguous write against the authoritative listing.
    pub async fn reconcile(&self, resource_id: &str, user_id: &str) -> IntentOutcome {
        match self.api.fetch_my_resources(user_id).await {
            Ok(listing) => {
                let held = listing
                    .iter()
                    .any(|r| r.resource_id == resource_id && r.status != ResourceStatus::Cancelled);
                let status = if held {
                    EntitlementStatus::Active
                } else {
                    EntitlementStatus::Absent
                };
                self.store
                    .apply(EntitlementRecord::confirmed(resource_id, user_id, status))
                    .await;
                if held {
                    info!(resource_id, "reconciled: registration exists");
                    IntentOutcome::Confirmed
                } else {
                    info!(resource_id, "reconciled: registration absent");
                    IntentOutcome::Failed
                }
            }
            Err(err) => {
                // Non-committal: keep whatever record is present and let a
                // later listing refresh settle it.
                warn!(resource_id, %err, "reconciliation read failed, outcome unknown");
                IntentOutcome::Unknown
            }
        }
    }

    /// Cancels a registration. Unregistration is a plain write; a failure
    /// here is unambiguous and leaves the local record untouched.
    pub async fn unregister(&self, resource_id: &str, user_id: &str) -> Result<(), FlowError> {
        self.api
            .unregister_from_resource(resource_id, user_id)
            .await
            .map_err(|err: ApiError| FlowError::Network(err.to_string()))?;
        self.store
            .apply(EntitlementRecord::confirmed(
                resource_id,
                user_id,
                EntitlementStatus::Cancelled,
            ))
            .await;
        info!(resource_id, "unregistered from resource");
        Ok(())
    }
}
