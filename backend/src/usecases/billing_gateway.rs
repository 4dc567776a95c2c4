use std::collections::HashMap;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use axum::http::StatusCode;
use lms::payments::stripe_client::{
    InvoiceFilter, NewCustomer, StripeApiError, StripeClient, StripeCustomer, StripeEvent,
    StripeInvoice, StripeList, StripePaymentMethod, StripeSubscription,
};
use thiserror::Error;

/// Billing provider operations the use cases depend on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BillingGateway: Send + Sync {
    async fn create_customer(&self, customer: NewCustomer) -> AnyResult<String>;

    async fn retrieve_customer(&self, customer_id: &str) -> AnyResult<StripeCustomer>;

    async fn set_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> AnyResult<StripeCustomer>;

    async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        metadata: HashMap<String, String>,
    ) -> AnyResult<StripeSubscription>;

    async fn retrieve_subscription(&self, subscription_id: &str) -> AnyResult<StripeSubscription>;

    async fn update_subscription_price(
        &self,
        subscription_id: &str,
        item_id: &str,
        price_id: &str,
        metadata: HashMap<String, String>,
    ) -> AnyResult<StripeSubscription>;

    async fn cancel_subscription(&self, subscription_id: &str) -> AnyResult<StripeSubscription>;

    async fn list_invoices(&self, filter: InvoiceFilter) -> AnyResult<StripeList<StripeInvoice>>;

    async fn retrieve_invoice(&self, invoice_id: &str) -> AnyResult<StripeInvoice>;

    async fn retrieve_invoice_expanded(&self, invoice_id: &str) -> AnyResult<serde_json::Value>;

    async fn pay_invoice(
        &self,
        invoice_id: &str,
        payment_method_id: Option<String>,
    ) -> AnyResult<StripeInvoice>;

    async fn list_payment_methods(&self, customer_id: &str) -> AnyResult<Vec<StripePaymentMethod>>;

    async fn attach_payment_method(
        &self,
        payment_method_id: &str,
        customer_id: &str,
    ) -> AnyResult<StripePaymentMethod>;

    async fn detach_payment_method(&self, payment_method_id: &str)
    -> AnyResult<StripePaymentMethod>;

    async fn flag_payment_method_default(
        &self,
        payment_method_id: &str,
        is_default: bool,
    ) -> AnyResult<StripePaymentMethod>;

    fn verify_webhook_signature(&self, payload: &[u8], signature: &str) -> AnyResult<StripeEvent>;
}

#[async_trait]
impl BillingGateway for StripeClient {
    async fn create_customer(&self, customer: NewCustomer) -> AnyResult<String> {
        self.create_customer(&customer).await
    }

    async fn retrieve_customer(&self, customer_id: &str) -> AnyResult<StripeCustomer> {
        self.retrieve_customer(customer_id).await
    }

    async fn set_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> AnyResult<StripeCustomer> {
        self.set_default_payment_method(customer_id, payment_method_id)
            .await
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        metadata: HashMap<String, String>,
    ) -> AnyResult<StripeSubscription> {
        self.create_subscription(customer_id, price_id, metadata)
            .await
    }

    async fn retrieve_subscription(&self, subscription_id: &str) -> AnyResult<StripeSubscription> {
        self.retrieve_subscription(subscription_id).await
    }

    async fn update_subscription_price(
        &self,
        subscription_id: &str,
        item_id: &str,
        price_id: &str,
        metadata: HashMap<String, String>,
    ) -> AnyResult<StripeSubscription> {
        self.update_subscription_price(subscription_id, item_id, price_id, metadata)
            .await
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> AnyResult<StripeSubscription> {
        self.cancel_subscription(subscription_id).await
    }

    async fn list_invoices(&self, filter: InvoiceFilter) -> AnyResult<StripeList<StripeInvoice>> {
        self.list_invoices(&filter).await
    }

    async fn retrieve_invoice(&self, invoice_id: &str) -> AnyResult<StripeInvoice> {
        self.retrieve_invoice(invoice_id).await
    }

    async fn retrieve_invoice_expanded(&self, invoice_id: &str) -> AnyResult<serde_json::Value> {
        self.retrieve_invoice_expanded(invoice_id).await
    }

    async fn pay_invoice(
        &self,
        invoice_id: &str,
        payment_method_id: Option<String>,
    ) -> AnyResult<StripeInvoice> {
        self.pay_invoice(invoice_id, payment_method_id).await
    }

    async fn list_payment_methods(&self, customer_id: &str) -> AnyResult<Vec<StripePaymentMethod>> {
        self.list_payment_methods(customer_id).await
    }

    async fn attach_payment_method(
        &self,
        payment_method_id: &str,
        customer_id: &str,
    ) -> AnyResult<StripePaymentMethod> {
        self.attach_payment_method(payment_method_id, customer_id)
            .await
    }

    async fn detach_payment_method(
        &self,
        payment_method_id: &str,
    ) -> AnyResult<StripePaymentMethod> {
        self.detach_payment_method(payment_method_id).await
    }

    async fn flag_payment_method_default(
        &self,
        payment_method_id: &str,
        is_default: bool,
    ) -> AnyResult<StripePaymentMethod> {
        self.flag_payment_method_default(payment_method_id, is_default)
            .await
    }

    fn verify_webhook_signature(&self, payload: &[u8], signature: &str) -> AnyResult<StripeEvent> {
        self.verify_webhook_signature(payload, signature)
    }
}

/// How a failed gateway call should be reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayFailure {
    /// The provider refused a card; the caller can retry with another one.
    CardDeclined(String),
    /// The provider refused the request; nothing changed remotely.
    Rejected(String),
    /// Transport error or provider fault; the remote outcome is unknown.
    Unavailable,
}

pub fn classify(err: &anyhow::Error) -> GatewayFailure {
    match err.downcast_ref::<StripeApiError>() {
        Some(api) if api.is_card_error() => GatewayFailure::CardDeclined(api.user_message()),
        Some(api) if api.is_client_error() => GatewayFailure::Rejected(api.user_message()),
        _ => GatewayFailure::Unavailable,
    }
}

pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<StripeApiError>()
        .is_some_and(|api| api.status == 404 || api.code.as_deref() == Some("resource_missing"))
}

/// Errors of the payment method and invoice use cases.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("student not found")]
    StudentNotFound,
    #[error("Not registered on the billing provider")]
    MissingCustomer,
    #[error("Invalid payment method ID")]
    InvalidPaymentMethod,
    #[error("Payment method not found for this customer")]
    PaymentMethodNotFound,
    #[error("Cannot remove the only payment method while it is the default")]
    NoAlternativePaymentMethod,
    #[error("Invoice not found")]
    InvoiceNotFound,
    #[error("Invoice is not open (status: {0})")]
    InvoiceNotOpen(String),
    #[error("No payment method available to pay this invoice")]
    NoPaymentMethod,
    #[error("{0}")]
    CardDeclined(String),
    #[error("{0}")]
    GatewayRejected(String),
    #[error("billing provider unavailable")]
    GatewayUnavailable(#[source] anyhow::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BillingError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            BillingError::StudentNotFound
            | BillingError::PaymentMethodNotFound
            | BillingError::InvoiceNotFound => StatusCode::NOT_FOUND,
            BillingError::MissingCustomer
            | BillingError::InvalidPaymentMethod
            | BillingError::NoAlternativePaymentMethod
            | BillingError::InvoiceNotOpen(_)
            | BillingError::NoPaymentMethod
            | BillingError::GatewayRejected(_) => StatusCode::BAD_REQUEST,
            BillingError::CardDeclined(_) => StatusCode::PAYMENT_REQUIRED,
            BillingError::GatewayUnavailable(_) => StatusCode::BAD_GATEWAY,
            BillingError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn from_gateway(err: anyhow::Error) -> Self {
        match classify(&err) {
            GatewayFailure::CardDeclined(message) => BillingError::CardDeclined(message),
            GatewayFailure::Rejected(message) => BillingError::GatewayRejected(message),
            GatewayFailure::Unavailable => BillingError::GatewayUnavailable(err),
        }
    }
}
