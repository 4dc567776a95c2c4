use std::sync::Arc;

use chrono::{TimeZone, Utc};
use lms::{
    domain::{
        repositories::{
            students::StudentRepository, subscription_episodes::SubscriptionLedgerRepository,
        },
        value_objects::{
            billing::{
                InvoiceDto, InvoiceListQuery, InvoicePageDto, InvoiceStatsDto, PaidInvoiceDto,
                PayInvoiceModel,
            },
            plans::PlanCatalog,
            subscriptions::{EpisodeDto, SubscriptionStateDto},
        },
    },
    payments::stripe_client::{InvoiceFilter, StripeInvoice},
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::usecases::{
    billing_gateway::{BillingError, BillingGateway, is_not_found},
    entitlement_reconciler::{
        EntitlementReconciler, episode_id_from_metadata, observation_from_subscription,
    },
};

pub const DEFAULT_PAGE_LENGTH: u32 = 10;
const MAX_PAGE_LENGTH: u32 = 100;
const OPEN: &str = "open";
const PAID: &str = "paid";

type UseCaseResult<T> = std::result::Result<T, BillingError>;

fn format_date(seconds: i64) -> Option<String> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .map(|date| date.format("%Y-%m-%d").to_string())
}

fn title_case(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn invoice_view(invoice: &StripeInvoice, catalog: &PlanCatalog) -> InvoiceDto {
    let price_id = invoice.price_id().map(str::to_string);
    let plan_details = price_id
        .as_deref()
        .and_then(|price| catalog.by_price(price))
        .map(|entry| entry.details());

    InvoiceDto {
        invoice_id: invoice.id.clone(),
        customer_id: invoice.customer.clone(),
        subscription_id: invoice.subscription.clone(),
        amount_due: invoice.amount_due,
        amount_paid: invoice.amount_paid,
        amount_remaining: invoice.amount_remaining,
        invoice_status: title_case(invoice.status.as_deref().unwrap_or_default()),
        price_id,
        plan_details,
        paid_status: invoice.paid.unwrap_or(false),
        issue_date: format_date(invoice.created).unwrap_or_default(),
        due_date: invoice
            .due_date
            .and_then(format_date)
            .unwrap_or_else(|| "N/A".to_string()),
        paid_at: invoice
            .status_transitions
            .as_ref()
            .and_then(|transitions| transitions.paid_at)
            .and_then(format_date),
        amount: format!("{:.2}", invoice.amount_due as f64 / 100.0),
    }
}

/// Customer id of an expanded invoice, whether `customer` is an id or an object.
fn expanded_customer_id(invoice: &serde_json::Value) -> Option<&str> {
    let customer = invoice.get("customer")?;
    customer
        .as_str()
        .or_else(|| customer.get("id").and_then(|id| id.as_str()))
}

pub struct InvoiceUseCase<L, St, G>
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
}

impl<L, St, G> InvoiceUseCase<L, St, G>
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
    ) -> Self {
        Self {
            ledger_repo,
            student_repo,
            gateway,
            reconciler,
            catalog,
        }
    }

    pub async fn list(&self, student_id: Uuid, query: InvoiceListQuery) -> UseCaseResult<InvoicePageDto> {
        let customer_id = self.customer_id(student_id).await?;
        let filter = InvoiceFilter {
            customer_id,
            status: query
                .paid
                .map(|paid| (if paid { PAID } else { OPEN }).to_string()),
            subscription_id: None,
            limit: query
                .length
                .unwrap_or(DEFAULT_PAGE_LENGTH)
                .clamp(1, MAX_PAGE_LENGTH),
            starting_after: query.starting_after,
        };

        let page = self
            .gateway
            .list_invoices(filter)
            .await
            .map_err(|err| {
                error!(%student_id, gateway_error = ?err, "invoices: listing failed");
                BillingError::from_gateway(err)
            })?;

        Ok(InvoicePageDto {
            invoices: page
                .data
                .iter()
                .map(|invoice| invoice_view(invoice, &self.catalog))
                .collect(),
            has_more: page.has_more,
        })
    }

    pub async fn get(&self, student_id: Uuid, invoice_id: &str) -> UseCaseResult<serde_json::Value> {
        let customer_id = self.customer_id(student_id).await?;
        let invoice = self
            .gateway
            .retrieve_invoice_expanded(invoice_id)
            .await
            .map_err(|err| {
                if is_not_found(&err) {
                    BillingError::InvoiceNotFound
                } else {
                    error!(%student_id, %invoice_id, gateway_error = ?err, "invoices: retrieve failed");
                    BillingError::from_gateway(err)
                }
            })?;

        if expanded_customer_id(&invoice) != Some(customer_id.as_str()) {
            warn!(%student_id, %invoice_id, "invoices: invoice belongs to another customer");
            return Err(BillingError::InvoiceNotFound);
        }

        Ok(invoice)
    }

    /// Pays an open invoice. When that leaves the subscription with no open
    /// invoices, its remote status is reconciled into the correlated episode.
    pub async fn pay(&self, student_id: Uuid, pay_invoice_model: PayInvoiceModel) -> UseCaseResult<PaidInvoiceDto> {
        let customer_id = self.customer_id(student_id).await?;
        let invoice_id = pay_invoice_model.invoice_id;

        let invoice = self
            .gateway
            .retrieve_invoice(&invoice_id)
            .await
            .map_err(|err| {
                if is_not_found(&err) {
                    BillingError::InvoiceNotFound
                } else {
                    BillingError::from_gateway(err)
                }
            })?;
        if invoice.customer.as_deref() != Some(customer_id.as_str()) {
            warn!(%student_id, %invoice_id, "invoices: pay attempt on another customer's invoice");
            return Err(BillingError::InvoiceNotFound);
        }
        let status = invoice.status.clone().unwrap_or_default();
        if status != OPEN {
            return Err(BillingError::InvoiceNotOpen(status));
        }

        let payment_method_id = match pay_invoice_model.payment_method_id {
            Some(payment_method_id) => payment_method_id,
            None => self
                .gateway
                .retrieve_customer(&customer_id)
                .await
                .map_err(BillingError::from_gateway)?
                .default_payment_method()
                .map(str::to_string)
                .ok_or(BillingError::NoPaymentMethod)?,
        };

        let paid = self
            .gateway
            .pay_invoice(&invoice_id, Some(payment_method_id))
            .await
            .map_err(|err| {
                error!(%student_id, %invoice_id, gateway_error = ?err, "invoices: payment failed");
                BillingError::from_gateway(err)
            })?;
        info!(
            %student_id,
            %invoice_id,
            amount_paid = paid.amount_paid,
            "invoices: invoice paid"
        );

        let subscription = match invoice.subscription.as_deref() {
            Some(remote_subscription_id) => {
                self.settle_subscription(&customer_id, remote_subscription_id)
                    .await
            }
            None => None,
        };

        Ok(PaidInvoiceDto {
            invoice_id: paid.id,
            status: paid.status,
            amount_paid: paid.amount_paid,
            subscription,
        })
    }

    /// Invoice counts across every page of the customer's history.
    pub async fn stats(&self, student_id: Uuid) -> UseCaseResult<InvoiceStatsDto> {
        let customer_id = self.customer_id(student_id).await?;
        let mut stats = InvoiceStatsDto { total: 0, paid: 0 };
        let mut starting_after = None;

        loop {
            let page = self
                .gateway
                .list_invoices(InvoiceFilter {
                    customer_id: customer_id.clone(),
                    limit: MAX_PAGE_LENGTH,
                    starting_after: starting_after.take(),
                    ..InvoiceFilter::default()
                })
                .await
                .map_err(BillingError::from_gateway)?;

            stats.total += page.data.len() as u64;
            stats.paid += page
                .data
                .iter()
                .filter(|invoice| invoice.status.as_deref() == Some(PAID))
                .count() as u64;

            match page.data.last() {
                Some(last) if page.has_more => starting_after = Some(last.id.clone()),
                _ => break,
            }
        }

        Ok(stats)
    }

    async fn settle_subscription(
        &self,
        customer_id: &str,
        remote_subscription_id: &str,
    ) -> Option<SubscriptionStateDto> {
        let still_open = self
            .gateway
            .list_invoices(InvoiceFilter {
                customer_id: customer_id.to_string(),
                status: Some(OPEN.to_string()),
                subscription_id: Some(remote_subscription_id.to_string()),
                limit: 1,
                starting_after: None,
            })
            .await;
        match still_open {
            Ok(page) if page.data.is_empty() => {}
            Ok(_) => return None,
            Err(err) => {
                warn!(
                    %remote_subscription_id,
                    gateway_error = ?err,
                    "invoices: could not check remaining open invoices"
                );
                return None;
            }
        }

        let subscription = match self.gateway.retrieve_subscription(remote_subscription_id).await {
            Ok(subscription) => subscription,
            Err(err) => {
                warn!(
                    %remote_subscription_id,
                    gateway_error = ?err,
                    "invoices: could not refresh subscription after payment"
                );
                return None;
            }
        };

        let episode_id = match episode_id_from_metadata(&subscription) {
            Some(episode_id) => Some(episode_id),
            None => self
                .ledger_repo
                .find_latest_by_remote_subscription_id(remote_subscription_id)
                .await
                .ok()
                .flatten()
                .map(|episode| episode.id),
        };
        let (Some(episode_id), Some(observation)) = (
            episode_id,
            observation_from_subscription(&subscription, Utc::now()),
        ) else {
            error!(
                %remote_subscription_id,
                remote_status = %subscription.status,
                "invoices: paid subscription does not correlate with an episode"
            );
            return None;
        };

        match self.reconciler.apply(episode_id, observation).await {
            Ok(outcome) => Some(SubscriptionStateDto::new(
                Some(EpisodeDto::from_entity(outcome.episode(), &self.catalog)),
                outcome.entitlement(),
            )),
            Err(err) => {
                error!(
                    %episode_id,
                    %remote_subscription_id,
                    error = ?err,
                    "invoices: invoice paid but the ledger write failed; awaiting webhook"
                );
                None
            }
        }
    }

    async fn customer_id(&self, student_id: Uuid) -> UseCaseResult<String> {
        let student = self
            .student_repo
            .find_by_id(student_id)
            .await
            .map_err(|err| {
                error!(%student_id, db_error = ?err, "invoices: failed to load student");
                BillingError::Internal(err)
            })?
            .ok_or(BillingError::StudentNotFound)?;

        student.customer_id.ok_or(BillingError::MissingCustomer)
    }
}
