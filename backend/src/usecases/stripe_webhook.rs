use std::sync::Arc;

use axum::http::StatusCode;
use chrono::{TimeZone, Utc};
use lms::{
    domain::repositories::{
        students::StudentRepository, subscription_episodes::SubscriptionLedgerRepository,
    },
    payments::stripe_client::{StripeEvent, WebhookPayloadError},
};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::usecases::{
    billing_gateway::BillingGateway,
    entitlement_reconciler::{
        ApplyOutcome, EntitlementReconciler, ReconcileError, episode_id_from_metadata,
        observation_from_subscription,
    },
};

pub const SUBSCRIPTION_CREATED: &str = "customer.subscription.created";
pub const SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
pub const SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Webhook signature verification failed")]
    InvalidSignature(#[source] anyhow::Error),
    /// Persistence could not take the event right now; the provider redelivers it.
    #[error("Webhook could not be processed, retry later")]
    Retryable(#[source] ReconcileError),
}

impl WebhookError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            WebhookError::InvalidSignature(_) => StatusCode::BAD_REQUEST,
            WebhookError::Retryable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// What happened to an acknowledged event. Every variant is answered with 200.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookReceipt {
    Applied { episode_id: Uuid },
    Stale { episode_id: Uuid, reason: String },
    Ignored { event_type: String },
    Dropped { reason: String },
}

pub struct StripeWebhookUseCase<L, St, G>
where
    L: SubscriptionLedgerRepository + Send + Sync + 'static,
    St: StudentRepository + Send + Sync + 'static,
    G: BillingGateway + Send + Sync + 'static,
{
    ledger_repo: Arc<L>,
    gateway: Arc<G>,
    reconciler: Arc<EntitlementReconciler<L, St>>,
}

impl<L, St, G> StripeWebhookUseCase<L, St, G>
where
    L: SubscriptionLedgerRepository + Send + Sync + 'static,
    St: StudentRepository + Send + Sync + 'static,
    G: BillingGateway + Send + Sync + 'static,
{
    pub fn new(
        ledger_repo: Arc<L>,
        gateway: Arc<G>,
        reconciler: Arc<EntitlementReconciler<L, St>>,
    ) -> Self {
        Self {
            ledger_repo,
            gateway,
            reconciler,
        }
    }

    /// Checks the signature over the raw body before anything is parsed.
    /// `Ok(None)` is a correctly signed body that is not a readable event.
    pub fn verify(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> Result<Option<StripeEvent>, WebhookError> {
        match self.gateway.verify_webhook_signature(payload, signature) {
            Ok(event) => Ok(Some(event)),
            Err(err) if err.downcast_ref::<WebhookPayloadError>().is_some() => {
                error!(
                    error = ?err,
                    payload_bytes = payload.len(),
                    "stripe_webhook: signed payload could not be read, acknowledging"
                );
                Ok(None)
            }
            Err(err) => {
                warn!(
                    status = StatusCode::BAD_REQUEST.as_u16(),
                    error = %err,
                    "stripe_webhook: signature verification failed"
                );
                Err(WebhookError::InvalidSignature(err))
            }
        }
    }

    /// Feeds a verified event into the reconciler. Events that can never apply
    /// (unknown type, no correlating episode) are acknowledged; a persistence
    /// failure is returned so the provider delivers the event again.
    pub async fn ingest(&self, event: StripeEvent) -> Result<WebhookReceipt, WebhookError> {
        let event_id = event.id.clone().unwrap_or_default();
        info!(
            %event_id,
            event_type = %event.type_,
            "stripe_webhook: event received"
        );

        if !matches!(
            event.type_.as_str(),
            SUBSCRIPTION_CREATED | SUBSCRIPTION_UPDATED | SUBSCRIPTION_DELETED
        ) {
            info!(%event_id, event_type = %event.type_, "stripe_webhook: unhandled event type");
            return Ok(WebhookReceipt::Ignored {
                event_type: event.type_,
            });
        }

        let subscription = match event.subscription() {
            Ok(subscription) => subscription,
            Err(err) => {
                error!(%event_id, error = ?err, "stripe_webhook: malformed subscription payload");
                return Ok(dropped("malformed subscription payload"));
            }
        };

        let observed_at = event
            .created
            .and_then(|created| Utc.timestamp_opt(created, 0).single())
            .unwrap_or_else(Utc::now);
        let Some(observation) = observation_from_subscription(&subscription, observed_at) else {
            warn!(
                %event_id,
                remote_subscription_id = %subscription.id,
                remote_status = %subscription.status,
                "stripe_webhook: status not tracked by the ledger"
            );
            return Ok(dropped("untracked status"));
        };

        let episode_id = match episode_id_from_metadata(&subscription) {
            Some(episode_id) => episode_id,
            None => match self
                .ledger_repo
                .find_latest_by_remote_subscription_id(&subscription.id)
                .await
            {
                Ok(Some(episode)) => {
                    info!(
                        %event_id,
                        remote_subscription_id = %subscription.id,
                        episode_id = %episode.id,
                        "stripe_webhook: correlated by remote subscription id"
                    );
                    episode.id
                }
                Ok(None) => {
                    error!(
                        %event_id,
                        remote_subscription_id = %subscription.id,
                        "stripe_webhook: no episode correlates with this subscription"
                    );
                    return Ok(dropped("missing correlation id"));
                }
                Err(err) => {
                    error!(
                        %event_id,
                        remote_subscription_id = %subscription.id,
                        db_error = ?err,
                        "stripe_webhook: correlation lookup failed"
                    );
                    return Err(WebhookError::Retryable(ReconcileError::Internal(err)));
                }
            },
        };

        match self.reconciler.apply(episode_id, observation).await {
            Ok(ApplyOutcome::Applied { entitlement, .. }) => {
                info!(
                    %event_id,
                    %episode_id,
                    remote_status = %subscription.status,
                    remaining_enrollment_credits = entitlement.remaining_enrollment_credits,
                    "stripe_webhook: event applied"
                );
                Ok(WebhookReceipt::Applied { episode_id })
            }
            Ok(ApplyOutcome::Stale { reason, .. }) => Ok(WebhookReceipt::Stale {
                episode_id,
                reason: reason.to_string(),
            }),
            Err(
                err @ (ReconcileError::EpisodeNotFound(_)
                | ReconcileError::StudentNotFound(_)
                | ReconcileError::Catalog(_)),
            ) => {
                error!(
                    %event_id,
                    %episode_id,
                    error = %err,
                    "stripe_webhook: event does not match the ledger, dropping"
                );
                Ok(dropped(&err.to_string()))
            }
            Err(err) => {
                error!(
                    %event_id,
                    %episode_id,
                    error = ?err,
                    "stripe_webhook: event could not be applied, asking for redelivery"
                );
                Err(WebhookError::Retryable(err))
            }
        }
    }

    pub async fn handle(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> Result<WebhookReceipt, WebhookError> {
        let Some(event) = self.verify(payload, signature)? else {
            return Ok(dropped("unreadable payload"));
        };
        self.ingest(event).await
    }
}

fn dropped(reason: &str) -> WebhookReceipt {
    WebhookReceipt::Dropped {
        reason: reason.to_string(),
    }
}
