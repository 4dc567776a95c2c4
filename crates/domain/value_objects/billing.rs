use serde::{Deserialize, Serialize};

use crate::domain::value_objects::{plans::PlanDetailsDto, subscriptions::SubscriptionStateDto};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddPaymentMethodModel {
    pub payment_method_id: String,
    #[serde(default)]
    pub set_as_default: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentMethodModel {
    pub payment_method_id: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentMethodDto {
    pub payment_method_id: String,
    pub brand: String,
    pub last4: String,
    pub expiry: String,
    pub is_default: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DefaultPaymentMethodDto {
    pub payment_method_id: String,
    pub last4: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceListQuery {
    pub paid: Option<bool>,
    pub length: Option<u32>,
    pub starting_after: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceDto {
    pub invoice_id: String,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub amount_due: i64,
    pub amount_paid: i64,
    pub amount_remaining: i64,
    pub invoice_status: String,
    pub price_id: Option<String>,
    pub plan_details: Option<PlanDetailsDto>,
    pub paid_status: bool,
    pub issue_date: String,
    pub due_date: String,
    pub paid_at: Option<String>,
    pub amount: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InvoicePageDto {
    pub invoices: Vec<InvoiceDto>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayInvoiceModel {
    pub invoice_id: String,
    pub payment_method_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaidInvoiceDto {
    pub invoice_id: String,
    pub status: Option<String>,
    pub amount_paid: i64,
    /// Present when paying the invoice settled the subscription it belongs to.
    pub subscription: Option<SubscriptionStateDto>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InvoiceStatsDto {
    pub total: u64,
    pub paid: u64,
}
