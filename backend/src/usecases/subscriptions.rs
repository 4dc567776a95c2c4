use std::{collections::HashMap, sync::Arc};

use anyhow::anyhow;
use axum::http::StatusCode;
use chrono::{Duration, Utc};
use lms::{
    domain::{
        entities::{
            students::StudentEntity,
            subscription_episodes::{
                EpisodeUpdate, InsertSubscriptionEpisodeEntity, SubscriptionEpisodeEntity,
            },
        },
        repositories::{
            students::StudentRepository,
            subscription_episodes::{EpisodeCreation, SubscriptionLedgerRepository},
        },
        value_objects::{
            entitlements::EPISODE_METADATA_KEY,
            enums::{episode_statuses::EpisodeStatus, plan_names::PlanName},
            plans::{PlanCatalog, PlanEntry},
            subscriptions::{
                ChangePlanModel, EpisodeDto, ResubscribeModel, SubscribeModel,
                SubscriptionStateDto,
            },
        },
    },
    payments::stripe_client::{NewCustomer, StripeSubscription},
};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::usecases::{
    billing_gateway::{BillingGateway, GatewayFailure, classify},
    entitlement_reconciler::{
        EntitlementReconciler, episode_id_from_metadata, observation_from_subscription,
    },
};

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),
    #[error("Invalid payment method ID")]
    InvalidPaymentMethod,
    #[error("student not found")]
    StudentNotFound,
    #[error("Not registered on the billing provider")]
    MissingCustomer,
    #[error("No active subscription found")]
    NoActiveSubscription,
    #[error("Subscription already canceled")]
    AlreadyCanceled,
    #[error("Already subscribed to {0} plan")]
    AlreadyOnPlan(PlanName),
    #[error("A subscription is already active or being processed")]
    AlreadySubscribed,
    #[error("Unauthorized: you do not own this subscription")]
    NotOwner,
    #[error("Subscription failed with '{0}' status")]
    NotActive(String),
    #[error("Failed to cancel subscription. Status: {0}")]
    CancellationNotConfirmed(String),
    #[error("{0}")]
    CardDeclined(String),
    #[error("{0}")]
    GatewayRejected(String),
    #[error("billing provider unavailable")]
    GatewayUnavailable(#[source] anyhow::Error),
    #[error("subscription is being synchronized with the billing provider")]
    Consistency(#[source] anyhow::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SubscriptionError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SubscriptionError::InvalidPlan(_)
            | SubscriptionError::InvalidPaymentMethod
            | SubscriptionError::MissingCustomer
            | SubscriptionError::AlreadyCanceled
            | SubscriptionError::AlreadyOnPlan(_)
            | SubscriptionError::CancellationNotConfirmed(_)
            | SubscriptionError::GatewayRejected(_) => StatusCode::BAD_REQUEST,
            SubscriptionError::StudentNotFound | SubscriptionError::NoActiveSubscription => {
                StatusCode::NOT_FOUND
            }
            SubscriptionError::AlreadySubscribed => StatusCode::CONFLICT,
            SubscriptionError::NotOwner => StatusCode::FORBIDDEN,
            SubscriptionError::NotActive(_) | SubscriptionError::CardDeclined(_) => {
                StatusCode::PAYMENT_REQUIRED
            }
            SubscriptionError::GatewayUnavailable(_) => StatusCode::BAD_GATEWAY,
            SubscriptionError::Consistency(_) | SubscriptionError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

pub type UseCaseResult<T> = std::result::Result<T, SubscriptionError>;

fn gateway_error(err: anyhow::Error) -> SubscriptionError {
    match classify(&err) {
        GatewayFailure::CardDeclined(message) => SubscriptionError::CardDeclined(message),
        GatewayFailure::Rejected(message) => SubscriptionError::GatewayRejected(message),
        GatewayFailure::Unavailable => SubscriptionError::GatewayUnavailable(err),
    }
}

fn episode_metadata(episode: &SubscriptionEpisodeEntity, student: &StudentEntity) -> HashMap<String, String> {
    HashMap::from([
        (EPISODE_METADATA_KEY.to_string(), episode.id.to_string()),
        ("user_id".to_string(), student.id.to_string()),
        ("name".to_string(), student.full_name()),
    ])
}

pub struct SubscriptionUseCase<L, St, G>
where
    L: SubscriptionLedgerRepository + Send + Sync + 'static,
    St: StudentRepository + Send + Sync + 'static,
    G: BillingGateway + Send + Sync + 'static,
{
    ledger_repo: Arc<L>,
    student_repo: Arc<St>,
    gateway: Arc<G>,
    reconciler: Arc<EntitlementReconciler<L, St>>,
    catalog: Arc<PlanCatalog>,
    pending_episode_grace: Duration,
}

impl<L, St, G> SubscriptionUseCase<L, St, G>
where
    L: SubscriptionLedgerRepository + Send + Sync + 'static,
    St: StudentRepository + Send + Sync + 'static,
    G: BillingGateway + Send + Sync + 'static,
{
    pub fn new(
        ledger_repo: Arc<L>,
        student_repo: Arc<St>,
        gateway: Arc<G>,
        reconciler: Arc<EntitlementReconciler<L, St>>,
        catalog: Arc<PlanCatalog>,
        pending_episode_grace: Duration,
    ) -> Self {
        Self {
            ledger_repo,
            student_repo,
            gateway,
            reconciler,
            catalog,
            pending_episode_grace,
        }
    }

    pub async fn subscribe(
        &self,
        student_id: Uuid,
        subscribe_model: SubscribeModel,
    ) -> UseCaseResult<SubscriptionStateDto> {
        info!(
            %student_id,
            plan = %subscribe_model.plan,
            "subscriptions: subscribe request received"
        );
        let plan = self.resolve_plan(&subscribe_model.plan)?;
        if !subscribe_model.payment_method_id.starts_with("pm_") {
            warn!(
                %student_id,
                status = StatusCode::BAD_REQUEST.as_u16(),
                "subscriptions: payment method id rejected"
            );
            return Err(SubscriptionError::InvalidPaymentMethod);
        }

        let student = self.load_student(student_id).await?;
        self.ensure_slot_free(&student).await?;
        let customer_id = self
            .ensure_customer(&student, &subscribe_model.payment_method_id)
            .await?;

        self.start_episode(&student, &customer_id, &plan).await
    }

    pub async fn resubscribe(
        &self,
        student_id: Uuid,
        resubscribe_model: ResubscribeModel,
    ) -> UseCaseResult<SubscriptionStateDto> {
        info!(
            %student_id,
            plan = %resubscribe_model.plan,
            "subscriptions: resubscribe request received"
        );
        let plan = self.resolve_plan(&resubscribe_model.plan)?;
        let student = self.load_student(student_id).await?;
        let Some(customer_id) = student.customer_id.clone() else {
            warn!(%student_id, "subscriptions: resubscribe without billing customer");
            return Err(SubscriptionError::MissingCustomer);
        };
        self.ensure_slot_free(&student).await?;

        let customer = self
            .gateway
            .retrieve_customer(&customer_id)
            .await
            .map_err(|err| {
                error!(
                    %student_id,
                    %customer_id,
                    gateway_error = ?err,
                    "subscriptions: failed to retrieve billing customer"
                );
                gateway_error(err)
            })?;
        if customer.deleted.unwrap_or(false) {
            warn!(%student_id, %customer_id, "subscriptions: billing customer was deleted");
            return Err(SubscriptionError::MissingCustomer);
        }

        self.start_episode(&student, &customer_id, &plan).await
    }

    /// Moves the student's active subscription to another plan on the same
    /// remote subscription. The old episode is superseded only once the
    /// provider confirms the change.
    pub async fn change_plan(
        &self,
        student_id: Uuid,
        change_plan_model: ChangePlanModel,
    ) -> UseCaseResult<SubscriptionStateDto> {
        info!(
            %student_id,
            new_plan = %change_plan_model.new_plan,
            "subscriptions: plan change request received"
        );
        let plan = self.resolve_plan(&change_plan_model.new_plan)?;
        let student = self.load_student(student_id).await?;

        let current = match student.active_episode_id {
            Some(episode_id) => self.find_episode(episode_id).await?,
            None => None,
        };
        let Some(current) = current else {
            info!(%student_id, "subscriptions: no active subscription to change");
            return Err(SubscriptionError::NoActiveSubscription);
        };
        if current.user_id != student.id {
            warn!(
                %student_id,
                episode_id = %current.id,
                owner_id = %current.user_id,
                "subscriptions: plan change on an episode owned by someone else"
            );
            return Err(SubscriptionError::NotOwner);
        }
        let grants_access = current
            .episode_status()
            .is_some_and(|status| status.grants_access());
        let Some(remote_subscription_id) = current
            .remote_subscription_id
            .clone()
            .filter(|_| grants_access)
        else {
            return Err(SubscriptionError::NoActiveSubscription);
        };
        if current.price_id == plan.price_id {
            return Err(SubscriptionError::AlreadyOnPlan(plan.name));
        }

        let remote = self
            .gateway
            .retrieve_subscription(&remote_subscription_id)
            .await
            .map_err(|err| {
                error!(
                    %student_id,
                    %remote_subscription_id,
                    gateway_error = ?err,
                    "subscriptions: failed to retrieve subscription before plan change"
                );
                gateway_error(err)
            })?;
        let Some(item_id) = remote.first_item_id().map(str::to_string) else {
            error!(%remote_subscription_id, "subscriptions: remote subscription has no items");
            return Err(SubscriptionError::Internal(anyhow!(
                "remote subscription {remote_subscription_id} has no items"
            )));
        };

        let insert_episode = InsertSubscriptionEpisodeEntity {
            remote_subscription_id: Some(remote_subscription_id.clone()),
            ..InsertSubscriptionEpisodeEntity::pending(
                student.id,
                &current.remote_customer_id,
                &plan.price_id,
            )
        };
        let next = self.create_episode(insert_episode, Some(current.id)).await?;

        let updated = match self
            .gateway
            .update_subscription_price(
                &remote_subscription_id,
                &item_id,
                &plan.price_id,
                episode_metadata(&next, &student),
            )
            .await
        {
            Ok(subscription) => subscription,
            Err(err) => {
                self.recover_plan_change(&next, &remote_subscription_id, err)
                    .await?
            }
        };

        if updated.status == EpisodeStatus::Active.as_str() {
            self.ledger_repo
                .mark_superseded(current.id)
                .await
                .map_err(|err| {
                    error!(
                        %student_id,
                        episode_id = %current.id,
                        db_error = ?err,
                        "subscriptions: plan changed remotely but superseding the old episode failed"
                    );
                    SubscriptionError::Consistency(err)
                })?;
        }

        self.settle(&next, &updated, EpisodeStatus::Active).await
    }

    pub async fn cancel(&self, student_id: Uuid) -> UseCaseResult<SubscriptionStateDto> {
        info!(%student_id, "subscriptions: cancel request received");
        let student = self.load_student(student_id).await?;

        let pointed = match student.active_episode_id {
            Some(episode_id) => self.find_episode(episode_id).await?,
            None => None,
        };
        let episode = match pointed.filter(|episode| episode.is_live()) {
            Some(episode) => Some(episode),
            None => self.find_live_episode(student.id).await?,
        };
        let Some(episode) = episode else {
            info!(%student_id, "subscriptions: nothing live to cancel");
            return Err(SubscriptionError::AlreadyCanceled);
        };
        if episode.user_id != student.id {
            return Err(SubscriptionError::NotOwner);
        }
        let Some(remote_subscription_id) = episode.remote_subscription_id.clone() else {
            info!(
                %student_id,
                episode_id = %episode.id,
                "subscriptions: live episode has no remote subscription yet"
            );
            return Err(SubscriptionError::NoActiveSubscription);
        };

        let canceled = self
            .gateway
            .cancel_subscription(&remote_subscription_id)
            .await
            .map_err(|err| {
                error!(
                    %student_id,
                    %remote_subscription_id,
                    gateway_error = ?err,
                    "subscriptions: cancel request failed"
                );
                gateway_error(err)
            })?;

        if canceled.status != EpisodeStatus::Canceled.as_str() {
            warn!(
                %student_id,
                %remote_subscription_id,
                remote_status = %canceled.status,
                "subscriptions: provider did not confirm cancellation"
            );
            return Err(SubscriptionError::CancellationNotConfirmed(canceled.status));
        }

        let state = self
            .settle(&episode, &canceled, EpisodeStatus::Canceled)
            .await?;
        info!(%student_id, episode_id = %episode.id, "subscriptions: subscription canceled");
        Ok(state)
    }

    pub async fn current_subscription(&self, student_id: Uuid) -> UseCaseResult<SubscriptionStateDto> {
        let student = self.load_student(student_id).await?;

        let episode = match student.active_episode_id {
            Some(episode_id) => self.find_episode(episode_id).await?,
            None => None,
        };
        if episode.is_none() {
            info!(%student_id, "subscriptions: no active subscription");
        }

        Ok(SubscriptionStateDto::new(
            episode.map(|episode| EpisodeDto::from_entity(&episode, &self.catalog)),
            student.entitlement(),
        ))
    }

    fn resolve_plan(&self, plan_name: &str) -> UseCaseResult<PlanEntry> {
        self.catalog.resolve(plan_name).cloned().map_err(|_| {
            warn!(
                plan = %plan_name,
                status = StatusCode::BAD_REQUEST.as_u16(),
                "subscriptions: unknown plan requested"
            );
            SubscriptionError::InvalidPlan(plan_name.to_string())
        })
    }

    async fn load_student(&self, student_id: Uuid) -> UseCaseResult<StudentEntity> {
        self.student_repo
            .find_by_id(student_id)
            .await
            .map_err(|err| {
                error!(%student_id, db_error = ?err, "subscriptions: failed to load student");
                SubscriptionError::Internal(err)
            })?
            .ok_or(SubscriptionError::StudentNotFound)
    }

    async fn find_episode(&self, episode_id: Uuid) -> UseCaseResult<Option<SubscriptionEpisodeEntity>> {
        self.ledger_repo.find_by_id(episode_id).await.map_err(|err| {
            error!(%episode_id, db_error = ?err, "subscriptions: failed to load episode");
            SubscriptionError::Internal(err)
        })
    }

    async fn find_live_episode(&self, student_id: Uuid) -> UseCaseResult<Option<SubscriptionEpisodeEntity>> {
        self.ledger_repo
            .find_live_episode(student_id)
            .await
            .map_err(|err| {
                error!(%student_id, db_error = ?err, "subscriptions: failed to load live episode");
                SubscriptionError::Internal(err)
            })
    }

    /// Refuses when a live episode exists. A `pending` episode that never got a
    /// remote subscription and is older than the grace period is abandoned first.
    async fn ensure_slot_free(&self, student: &StudentEntity) -> UseCaseResult<()> {
        let Some(live) = self.find_live_episode(student.id).await? else {
            return Ok(());
        };

        let abandoned = live.episode_status() == Some(EpisodeStatus::Pending)
            && live.remote_subscription_id.is_none()
            && live.created_at + self.pending_episode_grace < Utc::now();
        if !abandoned {
            info!(
                student_id = %student.id,
                episode_id = %live.id,
                status = %live.status,
                "subscriptions: student already holds a live episode"
            );
            return Err(SubscriptionError::AlreadySubscribed);
        }

        warn!(
            student_id = %student.id,
            episode_id = %live.id,
            created_at = %live.created_at,
            "subscriptions: abandoning stale pending episode"
        );
        self.expire_episode(&live).await;
        Ok(())
    }

    async fn ensure_customer(&self, student: &StudentEntity, payment_method_id: &str) -> UseCaseResult<String> {
        if let Some(customer_id) = student.customer_id.clone() {
            self.gateway
                .attach_payment_method(payment_method_id, &customer_id)
                .await
                .map_err(|err| {
                    error!(
                        student_id = %student.id,
                        %customer_id,
                        gateway_error = ?err,
                        "subscriptions: failed to attach payment method"
                    );
                    gateway_error(err)
                })?;
            self.gateway
                .set_default_payment_method(&customer_id, payment_method_id)
                .await
                .map_err(|err| {
                    error!(
                        student_id = %student.id,
                        %customer_id,
                        gateway_error = ?err,
                        "subscriptions: failed to set default payment method"
                    );
                    gateway_error(err)
                })?;
            return Ok(customer_id);
        }

        let customer_id = self
            .gateway
            .create_customer(NewCustomer {
                email: student.email.clone(),
                name: student.full_name(),
                payment_method_id: payment_method_id.to_string(),
                user_id: student.id,
            })
            .await
            .map_err(|err| {
                error!(
                    student_id = %student.id,
                    gateway_error = ?err,
                    "subscriptions: failed to create billing customer"
                );
                gateway_error(err)
            })?;

        self.student_repo
            .set_customer_id(student.id, &customer_id)
            .await
            .map_err(|err| {
                error!(
                    student_id = %student.id,
                    %customer_id,
                    db_error = ?err,
                    "subscriptions: billing customer created but not stored"
                );
                SubscriptionError::Consistency(err)
            })?;
        info!(student_id = %student.id, %customer_id, "subscriptions: billing customer created");

        Ok(customer_id)
    }

    async fn create_episode(
        &self,
        insert_episode: InsertSubscriptionEpisodeEntity,
        superseding: Option<Uuid>,
    ) -> UseCaseResult<SubscriptionEpisodeEntity> {
        let user_id = insert_episode.user_id;
        match self
            .ledger_repo
            .create_episode(insert_episode, superseding)
            .await
            .map_err(|err| {
                error!(%user_id, db_error = ?err, "subscriptions: failed to create episode");
                SubscriptionError::Internal(err)
            })? {
            EpisodeCreation::Created(episode) => {
                info!(
                    %user_id,
                    episode_id = %episode.id,
                    price_id = %episode.price_id,
                    "subscriptions: pending episode created"
                );
                Ok(episode)
            }
            EpisodeCreation::LiveEpisodeExists(existing) => {
                info!(
                    %user_id,
                    episode_id = %existing.id,
                    status = %existing.status,
                    "subscriptions: concurrent attempt holds the live slot"
                );
                Err(SubscriptionError::AlreadySubscribed)
            }
        }
    }

    async fn start_episode(
        &self,
        student: &StudentEntity,
        customer_id: &str,
        plan: &PlanEntry,
    ) -> UseCaseResult<SubscriptionStateDto> {
        let episode = self
            .create_episode(
                InsertSubscriptionEpisodeEntity::pending(student.id, customer_id, &plan.price_id),
                None,
            )
            .await?;

        let subscription = match self
            .gateway
            .create_subscription(customer_id, &plan.price_id, episode_metadata(&episode, student))
            .await
        {
            Ok(subscription) => subscription,
            Err(err) => return Err(self.fail_episode(&episode, err).await),
        };

        self.settle(&episode, &subscription, EpisodeStatus::Active)
            .await
    }

    /// Maps a failed remote mutation. A definite rejection expires the episode;
    /// an unknown outcome leaves it pending for the webhook to settle.
    async fn fail_episode(&self, episode: &SubscriptionEpisodeEntity, err: anyhow::Error) -> SubscriptionError {
        let failure = gateway_error(err);
        if let SubscriptionError::GatewayUnavailable(source) = &failure {
            error!(
                episode_id = %episode.id,
                gateway_error = ?source,
                "subscriptions: remote outcome unknown, episode left pending"
            );
        } else {
            warn!(
                episode_id = %episode.id,
                reason = %failure,
                status = failure.status_code().as_u16(),
                "subscriptions: provider rejected the request"
            );
            self.expire_episode(episode).await;
        }
        failure
    }

    async fn recover_plan_change(
        &self,
        next: &SubscriptionEpisodeEntity,
        remote_subscription_id: &str,
        err: anyhow::Error,
    ) -> UseCaseResult<StripeSubscription> {
        if classify(&err) != GatewayFailure::Unavailable {
            return Err(self.fail_episode(next, err).await);
        }

        // Read back to learn whether the change landed before the failure.
        match self.gateway.retrieve_subscription(remote_subscription_id).await {
            Ok(subscription) if episode_id_from_metadata(&subscription) == Some(next.id) => {
                warn!(
                    episode_id = %next.id,
                    %remote_subscription_id,
                    gateway_error = ?err,
                    "subscriptions: plan change applied despite transport failure"
                );
                Ok(subscription)
            }
            Ok(_) => {
                warn!(
                    episode_id = %next.id,
                    %remote_subscription_id,
                    gateway_error = ?err,
                    "subscriptions: plan change did not land"
                );
                self.expire_episode(next).await;
                Err(SubscriptionError::GatewayUnavailable(err))
            }
            Err(read_err) => {
                error!(
                    episode_id = %next.id,
                    %remote_subscription_id,
                    gateway_error = ?err,
                    read_error = ?read_err,
                    "subscriptions: plan change outcome unknown, episode left pending"
                );
                Err(SubscriptionError::GatewayUnavailable(err))
            }
        }
    }

    /// Records what the provider returned, then fails unless the remote status
    /// is the one the caller asked for.
    async fn settle(
        &self,
        episode: &SubscriptionEpisodeEntity,
        subscription: &StripeSubscription,
        expected: EpisodeStatus,
    ) -> UseCaseResult<SubscriptionStateDto> {
        let Some(observation) = observation_from_subscription(subscription, Utc::now()) else {
            error!(
                episode_id = %episode.id,
                remote_subscription_id = %subscription.id,
                remote_status = %subscription.status,
                "subscriptions: provider returned an unsupported status"
            );
            return Err(SubscriptionError::NotActive(subscription.status.clone()));
        };

        let outcome = self
            .reconciler
            .apply(episode.id, observation)
            .await
            .map_err(|err| {
                error!(
                    episode_id = %episode.id,
                    remote_subscription_id = %subscription.id,
                    remote_status = %subscription.status,
                    error = ?err,
                    "subscriptions: remote change succeeded but the ledger write failed; awaiting webhook"
                );
                SubscriptionError::Consistency(err.into())
            })?;

        if subscription.status != expected.as_str() {
            warn!(
                episode_id = %episode.id,
                remote_status = %subscription.status,
                status = StatusCode::PAYMENT_REQUIRED.as_u16(),
                "subscriptions: subscription is not active"
            );
            return Err(SubscriptionError::NotActive(subscription.status.clone()));
        }

        Ok(SubscriptionStateDto::new(
            Some(EpisodeDto::from_entity(outcome.episode(), &self.catalog)),
            outcome.entitlement(),
        ))
    }

    async fn expire_episode(&self, episode: &SubscriptionEpisodeEntity) {
        let update = EpisodeUpdate::local_status_change(episode, EpisodeStatus::IncompleteExpired);
        match self.ledger_repo.update_episode(update).await {
            Ok(true) => info!(episode_id = %episode.id, "subscriptions: episode expired"),
            Ok(false) => warn!(
                episode_id = %episode.id,
                "subscriptions: episode changed concurrently, not expired"
            ),
            Err(err) => error!(
                episode_id = %episode.id,
                db_error = ?err,
                "subscriptions: failed to expire episode"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use lms::{
        domain::{
            repositories::{
                students::MockStudentRepository,
                subscription_episodes::MockSubscriptionLedgerRepository,
            },
            value_objects::plans::PlanPrices,
        },
        payments::stripe_client::StripeApiError,
    };
    use serde_json::json;

    use crate::usecases::billing_gateway::MockBillingGateway;

    fn catalog() -> Arc<PlanCatalog> {
        Arc::new(PlanCatalog::new(PlanPrices {
            daily: "price_daily".to_string(),
            bronze: "price_bronze".to_string(),
            silver: "price_silver".to_string(),
            gold: "price_gold".to_string(),
        }))
    }

    fn student(id: Uuid) -> StudentEntity {
        StudentEntity {
            id,
            email: "student@example.com".to_string(),
            first_name: "Test".to_string(),
            last_name: "Student".to_string(),
            customer_id: Some("cus_1".to_string()),
            active_episode_id: None,
            remaining_enrollment_credits: 0,
            entitlement_version: 1,
        }
    }

    fn episode(id: Uuid, user_id: Uuid, price_id: &str, status: &str) -> SubscriptionEpisodeEntity {
        let created = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        SubscriptionEpisodeEntity {
            id,
            user_id,
            remote_customer_id: "cus_1".to_string(),
            remote_subscription_id: None,
            price_id: price_id.to_string(),
            status: status.to_string(),
            billing_cycle_anchor: None,
            current_period_start: None,
            current_period_end: None,
            trial_ends_at: None,
            ended_at: None,
            remote_observed_at: None,
            version: 0,
            created_at: created,
            updated_at: created,
        }
    }

    fn remote(status: &str, episode_id: Uuid, price_id: &str) -> StripeSubscription {
        serde_json::from_value(json!({
            "id": "sub_1",
            "customer": "cus_1",
            "status": status,
            "current_period_start": 1_735_689_600,
            "current_period_end": 1_738_368_000,
            "metadata": { "episode_id": episode_id.to_string() },
            "items": { "data": [{ "id": "si_1", "price": { "id": price_id } }] }
        }))
        .unwrap()
    }

    fn api_error(status: u16, error_type: &str) -> anyhow::Error {
        StripeApiError {
            context: "test".to_string(),
            status,
            error_type: Some(error_type.to_string()),
            code: None,
            message: Some("Your card was declined.".to_string()),
            decline_code: None,
            request_id: None,
        }
        .into()
    }

    fn use_case(
        ledger: MockSubscriptionLedgerRepository,
        students: MockStudentRepository,
        gateway: MockBillingGateway,
    ) -> SubscriptionUseCase<MockSubscriptionLedgerRepository, MockStudentRepository, MockBillingGateway>
    {
        let ledger = Arc::new(ledger);
        let students = Arc::new(students);
        let reconciler = Arc::new(EntitlementReconciler::new(
            Arc::clone(&ledger),
            Arc::clone(&students),
            catalog(),
        ));
        SubscriptionUseCase::new(
            ledger,
            students,
            Arc::new(gateway),
            reconciler,
            catalog(),
            Duration::minutes(15),
        )
    }

    fn subscribe_model(plan: &str) -> SubscribeModel {
        SubscribeModel {
            plan: plan.to_string(),
            payment_method_id: "pm_card".to_string(),
        }
    }

    /// Gateway that accepts the payment method of an existing customer.
    fn gateway_with_customer() -> MockBillingGateway {
        let mut gateway = MockBillingGateway::new();
        gateway.expect_attach_payment_method().returning(|pm, customer| {
            Ok(serde_json::from_value(json!({
                "id": pm, "created": 1, "customer": customer
            }))
            .unwrap())
        });
        gateway
            .expect_set_default_payment_method()
            .returning(|customer, _| {
                Ok(serde_json::from_value(json!({ "id": customer })).unwrap())
            });
        gateway
    }

    #[tokio::test]
    async fn unknown_plan_is_rejected_before_touching_the_ledger() {
        let mut ledger = MockSubscriptionLedgerRepository::new();
        ledger.expect_create_episode().times(0);
        ledger.expect_find_live_episode().times(0);
        let mut students = MockStudentRepository::new();
        students.expect_find_by_id().times(0);

        let result = use_case(ledger, students, MockBillingGateway::new())
            .subscribe(Uuid::new_v4(), subscribe_model("Platinum"))
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, SubscriptionError::InvalidPlan(ref plan) if plan == "Platinum"));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn payment_method_without_pm_prefix_is_rejected() {
        let mut ledger = MockSubscriptionLedgerRepository::new();
        ledger.expect_create_episode().times(0);

        let result = use_case(ledger, MockStudentRepository::new(), MockBillingGateway::new())
            .subscribe(
                Uuid::new_v4(),
                SubscribeModel {
                    plan: "Silver".to_string(),
                    payment_method_id: "card_123".to_string(),
                },
            )
            .await;

        assert!(matches!(result, Err(SubscriptionError::InvalidPaymentMethod)));
    }

    #[tokio::test]
    async fn subscribe_activates_episode_and_grants_plan_credits() {
        let student_id = Uuid::new_v4();
        let episode_id = Uuid::new_v4();
        let pending = episode(episode_id, student_id, "price_silver", "pending");

        let mut ledger = MockSubscriptionLedgerRepository::new();
        ledger.expect_find_live_episode().returning(|_| Ok(None));
        let created = pending.clone();
        ledger
            .expect_create_episode()
            .withf(|insert, superseding| {
                insert.status == "pending" && insert.price_id == "price_silver" && superseding.is_none()
            })
            .times(1)
            .returning(move |_, _| Ok(EpisodeCreation::Created(created.clone())));
        ledger
            .expect_find_by_id()
            .returning(move |_| Ok(Some(pending.clone())));
        ledger
            .expect_commit_reconciliation()
            .times(1)
            .returning(|_, _| Ok(true));

        let mut students = MockStudentRepository::new();
        students
            .expect_find_by_id()
            .returning(|id| Ok(Some(student(id))));

        let mut gateway = gateway_with_customer();
        gateway
            .expect_create_subscription()
            .withf(move |customer, price, metadata| {
                customer == "cus_1"
                    && price == "price_silver"
                    && metadata.get(EPISODE_METADATA_KEY) == Some(&episode_id.to_string())
            })
            .times(1)
            .returning(move |_, price, _| Ok(remote("active", episode_id, price)));

        let state = use_case(ledger, students, gateway)
            .subscribe(student_id, subscribe_model("Silver"))
            .await
            .unwrap();

        assert_eq!(state.remaining_enrollment_credits, 8);
        let subscription = state.subscription.unwrap();
        assert_eq!(subscription.episode_id, episode_id);
        assert_eq!(subscription.status, "active");
    }

    #[tokio::test]
    async fn declined_card_expires_the_pending_episode() {
        let student_id = Uuid::new_v4();
        let episode_id = Uuid::new_v4();
        let pending = episode(episode_id, student_id, "price_gold", "pending");

        let mut ledger = MockSubscriptionLedgerRepository::new();
        ledger.expect_find_live_episode().returning(|_| Ok(None));
        ledger
            .expect_create_episode()
            .returning(move |_, _| Ok(EpisodeCreation::Created(pending.clone())));
        ledger
            .expect_update_episode()
            .withf(move |update| {
                update.episode_id == episode_id
                    && update.status == EpisodeStatus::IncompleteExpired
                    && update.remote_observed_at.is_none()
            })
            .times(1)
            .returning(|_| Ok(true));
        ledger.expect_commit_reconciliation().times(0);

        let mut students = MockStudentRepository::new();
        students
            .expect_find_by_id()
            .returning(|id| Ok(Some(student(id))));

        let mut gateway = gateway_with_customer();
        gateway
            .expect_create_subscription()
            .returning(|_, _, _| Err(api_error(402, "card_error")));

        let err = use_case(ledger, students, gateway)
            .subscribe(student_id, subscribe_model("Gold"))
            .await
            .unwrap_err();

        assert!(matches!(err, SubscriptionError::CardDeclined(_)));
        assert_eq!(err.status_code(), StatusCode::PAYMENT_REQUIRED);
    }

    #[tokio::test]
    async fn provider_outage_leaves_episode_pending() {
        let student_id = Uuid::new_v4();
        let pending = episode(Uuid::new_v4(), student_id, "price_gold", "pending");

        let mut ledger = MockSubscriptionLedgerRepository::new();
        ledger.expect_find_live_episode().returning(|_| Ok(None));
        ledger
            .expect_create_episode()
            .returning(move |_, _| Ok(EpisodeCreation::Created(pending.clone())));
        ledger.expect_update_episode().times(0);

        let mut students = MockStudentRepository::new();
        students
            .expect_find_by_id()
            .returning(|id| Ok(Some(student(id))));

        let mut gateway = gateway_with_customer();
        gateway
            .expect_create_subscription()
            .returning(|_, _, _| Err(anyhow!("connection reset by peer")));

        let err = use_case(ledger, students, gateway)
            .subscribe(student_id, subscribe_model("Gold"))
            .await
            .unwrap_err();

        assert!(matches!(err, SubscriptionError::GatewayUnavailable(_)));
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn incomplete_remote_status_is_recorded_then_reported() {
        let student_id = Uuid::new_v4();
        let episode_id = Uuid::new_v4();
        let pending = episode(episode_id, student_id, "price_bronze", "pending");

        let mut ledger = MockSubscriptionLedgerRepository::new();
        ledger.expect_find_live_episode().returning(|_| Ok(None));
        let created = pending.clone();
        ledger
            .expect_create_episode()
            .returning(move |_, _| Ok(EpisodeCreation::Created(created.clone())));
        ledger
            .expect_find_by_id()
            .returning(move |_| Ok(Some(pending.clone())));
        ledger
            .expect_update_episode()
            .withf(|update| {
                update.status == EpisodeStatus::Incomplete
                    && update.remote_subscription_id.as_deref() == Some("sub_1")
            })
            .times(1)
            .returning(|_| Ok(true));
        ledger.expect_commit_reconciliation().times(0);

        let mut students = MockStudentRepository::new();
        students
            .expect_find_by_id()
            .returning(|id| Ok(Some(student(id))));

        let mut gateway = gateway_with_customer();
        gateway
            .expect_create_subscription()
            .returning(move |_, price, _| Ok(remote("incomplete", episode_id, price)));

        let err = use_case(ledger, students, gateway)
            .subscribe(student_id, subscribe_model("Bronze"))
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Subscription failed with 'incomplete' status");
        assert_eq!(err.status_code(), StatusCode::PAYMENT_REQUIRED);
    }

    #[tokio::test]
    async fn live_episode_blocks_a_second_subscription() {
        let student_id = Uuid::new_v4();
        let mut live = episode(Uuid::new_v4(), student_id, "price_silver", "active");
        live.remote_subscription_id = Some("sub_1".to_string());

        let mut ledger = MockSubscriptionLedgerRepository::new();
        ledger
            .expect_find_live_episode()
            .returning(move |_| Ok(Some(live.clone())));
        ledger.expect_create_episode().times(0);

        let mut students = MockStudentRepository::new();
        students
            .expect_find_by_id()
            .returning(|id| Ok(Some(student(id))));

        let err = use_case(ledger, students, MockBillingGateway::new())
            .subscribe(student_id, subscribe_model("Gold"))
            .await
            .unwrap_err();

        assert!(matches!(err, SubscriptionError::AlreadySubscribed));
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn abandoned_pending_episode_is_expired_before_retrying() {
        let student_id = Uuid::new_v4();
        let abandoned_id = Uuid::new_v4();
        let abandoned = episode(abandoned_id, student_id, "price_gold", "pending");

        let mut ledger = MockSubscriptionLedgerRepository::new();
        ledger
            .expect_find_live_episode()
            .returning(move |_| Ok(Some(abandoned.clone())));
        ledger
            .expect_update_episode()
            .withf(move |update| {
                update.episode_id == abandoned_id
                    && update.status == EpisodeStatus::IncompleteExpired
            })
            .times(1)
            .returning(|_| Ok(true));
        // The retry itself is refused by the unique live slot.
        let holder = episode(Uuid::new_v4(), student_id, "price_gold", "pending");
        ledger
            .expect_create_episode()
            .times(1)
            .returning(move |_, _| Ok(EpisodeCreation::LiveEpisodeExists(holder.clone())));

        let mut students = MockStudentRepository::new();
        students
            .expect_find_by_id()
            .returning(|id| Ok(Some(student(id))));

        let err = use_case(ledger, students, gateway_with_customer())
            .subscribe(student_id, subscribe_model("Gold"))
            .await
            .unwrap_err();

        assert!(matches!(err, SubscriptionError::AlreadySubscribed));
    }

    fn upgrade_fixture(
        student_id: Uuid,
        current_id: Uuid,
        next_id: Uuid,
    ) -> (MockSubscriptionLedgerRepository, MockStudentRepository) {
        let mut current = episode(current_id, student_id, "price_silver", "active");
        current.remote_subscription_id = Some("sub_1".to_string());
        let mut next = episode(next_id, student_id, "price_gold", "pending");
        next.remote_subscription_id = Some("sub_1".to_string());

        let mut ledger = MockSubscriptionLedgerRepository::new();
        let loaded_next = next.clone();
        ledger.expect_find_by_id().returning(move |id| {
            Ok(Some(if id == current_id {
                current.clone()
            } else {
                loaded_next.clone()
            }))
        });
        ledger
            .expect_create_episode()
            .withf(move |insert, superseding| {
                insert.price_id == "price_gold"
                    && insert.remote_subscription_id.as_deref() == Some("sub_1")
                    && *superseding == Some(current_id)
            })
            .returning(move |_, _| Ok(EpisodeCreation::Created(next.clone())));

        let mut students = MockStudentRepository::new();
        students.expect_find_by_id().returning(move |id| {
            Ok(Some(StudentEntity {
                active_episode_id: Some(current_id),
                remaining_enrollment_credits: 8,
                ..student(id)
            }))
        });

        (ledger, students)
    }

    fn change_to(plan: &str) -> ChangePlanModel {
        ChangePlanModel {
            new_plan: plan.to_string(),
        }
    }

    #[tokio::test]
    async fn upgrade_supersedes_previous_episode_and_grants_new_credits() {
        let student_id = Uuid::new_v4();
        let current_id = Uuid::new_v4();
        let next_id = Uuid::new_v4();
        let (mut ledger, students) = upgrade_fixture(student_id, current_id, next_id);
        ledger
            .expect_mark_superseded()
            .withf(move |id| *id == current_id)
            .times(1)
            .returning(|_| Ok(()));
        ledger
            .expect_commit_reconciliation()
            .withf(move |_, entitlement| {
                entitlement.active_episode_id == Some(next_id)
                    && entitlement.supersede_episode_id == Some(current_id)
            })
            .times(1)
            .returning(|_, _| Ok(true));

        let mut gateway = MockBillingGateway::new();
        gateway
            .expect_retrieve_subscription()
            .returning(move |_| Ok(remote("active", current_id, "price_silver")));
        gateway
            .expect_update_subscription_price()
            .withf(move |sub, item, price, metadata| {
                sub == "sub_1"
                    && item == "si_1"
                    && price == "price_gold"
                    && metadata.get(EPISODE_METADATA_KEY) == Some(&next_id.to_string())
            })
            .times(1)
            .returning(move |_, _, price, _| Ok(remote("active", next_id, price)));

        let state = use_case(ledger, students, gateway)
            .change_plan(student_id, change_to("Gold"))
            .await
            .unwrap();

        assert_eq!(state.remaining_enrollment_credits, 12);
        assert_eq!(state.subscription.unwrap().episode_id, next_id);
    }

    #[tokio::test]
    async fn rejected_upgrade_keeps_current_plan() {
        let student_id = Uuid::new_v4();
        let current_id = Uuid::new_v4();
        let next_id = Uuid::new_v4();
        let (mut ledger, students) = upgrade_fixture(student_id, current_id, next_id);
        ledger.expect_mark_superseded().times(0);
        ledger.expect_commit_reconciliation().times(0);
        ledger
            .expect_update_episode()
            .withf(move |update| {
                update.episode_id == next_id && update.status == EpisodeStatus::IncompleteExpired
            })
            .times(1)
            .returning(|_| Ok(true));

        let mut gateway = MockBillingGateway::new();
        gateway
            .expect_retrieve_subscription()
            .returning(move |_| Ok(remote("active", current_id, "price_silver")));
        gateway
            .expect_update_subscription_price()
            .returning(|_, _, _, _| Err(api_error(402, "card_error")));

        let err = use_case(ledger, students, gateway)
            .change_plan(student_id, change_to("Gold"))
            .await
            .unwrap_err();

        assert!(matches!(err, SubscriptionError::CardDeclined(_)));
    }

    #[tokio::test]
    async fn upgrade_with_lost_response_is_confirmed_by_reading_back() {
        let student_id = Uuid::new_v4();
        let current_id = Uuid::new_v4();
        let next_id = Uuid::new_v4();
        let (mut ledger, students) = upgrade_fixture(student_id, current_id, next_id);
        ledger.expect_mark_superseded().times(1).returning(|_| Ok(()));
        ledger
            .expect_commit_reconciliation()
            .times(1)
            .returning(|_, _| Ok(true));

        let mut gateway = MockBillingGateway::new();
        let mut reads = 0;
        gateway.expect_retrieve_subscription().times(2).returning(move |_| {
            reads += 1;
            Ok(if reads == 1 {
                remote("active", current_id, "price_silver")
            } else {
                remote("active", next_id, "price_gold")
            })
        });
        gateway
            .expect_update_subscription_price()
            .returning(|_, _, _, _| Err(anyhow!("operation timed out")));

        let state = use_case(ledger, students, gateway)
            .change_plan(student_id, change_to("Gold"))
            .await
            .unwrap();

        assert_eq!(state.remaining_enrollment_credits, 12);
    }

    #[tokio::test]
    async fn changing_to_the_current_plan_is_refused() {
        let student_id = Uuid::new_v4();
        let current_id = Uuid::new_v4();
        let mut current = episode(current_id, student_id, "price_silver", "active");
        current.remote_subscription_id = Some("sub_1".to_string());

        let mut ledger = MockSubscriptionLedgerRepository::new();
        ledger
            .expect_find_by_id()
            .returning(move |_| Ok(Some(current.clone())));
        ledger.expect_create_episode().times(0);

        let mut students = MockStudentRepository::new();
        students.expect_find_by_id().returning(move |id| {
            Ok(Some(StudentEntity {
                active_episode_id: Some(current_id),
                ..student(id)
            }))
        });

        let err = use_case(ledger, students, MockBillingGateway::new())
            .change_plan(student_id, change_to("Silver"))
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Already subscribed to Silver plan");
    }

    #[tokio::test]
    async fn cancel_applies_only_after_remote_confirmation() {
        let student_id = Uuid::new_v4();
        let episode_id = Uuid::new_v4();
        let mut active = episode(episode_id, student_id, "price_silver", "active");
        active.remote_subscription_id = Some("sub_1".to_string());
        active.remote_observed_at = Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());

        let mut ledger = MockSubscriptionLedgerRepository::new();
        ledger
            .expect_find_by_id()
            .returning(move |_| Ok(Some(active.clone())));
        ledger
            .expect_commit_reconciliation()
            .withf(|episode, entitlement| {
                episode.status == EpisodeStatus::Canceled
                    && entitlement.active_episode_id.is_none()
                    && entitlement.remaining_enrollment_credits == 0
            })
            .times(1)
            .returning(|_, _| Ok(true));

        let mut students = MockStudentRepository::new();
        students.expect_find_by_id().returning(move |id| {
            Ok(Some(StudentEntity {
                active_episode_id: Some(episode_id),
                remaining_enrollment_credits: 5,
                ..student(id)
            }))
        });

        let mut gateway = MockBillingGateway::new();
        gateway
            .expect_cancel_subscription()
            .times(1)
            .returning(move |_| Ok(remote("canceled", episode_id, "price_silver")));

        let state = use_case(ledger, students, gateway)
            .cancel(student_id)
            .await
            .unwrap();

        assert_eq!(state.remaining_enrollment_credits, 0);
        assert_eq!(state.subscription.unwrap().status, "canceled");
    }

    #[tokio::test]
    async fn unconfirmed_cancel_leaves_entitlement_untouched() {
        let student_id = Uuid::new_v4();
        let episode_id = Uuid::new_v4();
        let mut active = episode(episode_id, student_id, "price_silver", "active");
        active.remote_subscription_id = Some("sub_1".to_string());

        let mut ledger = MockSubscriptionLedgerRepository::new();
        ledger
            .expect_find_by_id()
            .returning(move |_| Ok(Some(active.clone())));
        ledger.expect_commit_reconciliation().times(0);
        ledger.expect_update_episode().times(0);

        let mut students = MockStudentRepository::new();
        students.expect_find_by_id().returning(move |id| {
            Ok(Some(StudentEntity {
                active_episode_id: Some(episode_id),
                ..student(id)
            }))
        });

        let mut gateway = MockBillingGateway::new();
        gateway
            .expect_cancel_subscription()
            .returning(move |_| Ok(remote("active", episode_id, "price_silver")));

        let err = use_case(ledger, students, gateway)
            .cancel(student_id)
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Failed to cancel subscription. Status: active");
    }

    #[tokio::test]
    async fn cancel_without_live_episode_reports_already_canceled() {
        let mut ledger = MockSubscriptionLedgerRepository::new();
        ledger.expect_find_live_episode().returning(|_| Ok(None));

        let mut students = MockStudentRepository::new();
        students
            .expect_find_by_id()
            .returning(|id| Ok(Some(student(id))));

        let mut gateway = MockBillingGateway::new();
        gateway.expect_cancel_subscription().times(0);

        let err = use_case(ledger, students, gateway)
            .cancel(Uuid::new_v4())
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Subscription already canceled");
    }
}
