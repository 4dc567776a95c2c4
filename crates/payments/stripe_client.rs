use std::collections::HashMap;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const STRIPE_API_BASE: &str = "https://api.stripe.com/v1";

/// Minimal Stripe client built on reqwest.
pub struct StripeClient {
    http: reqwest::Client,
    secret_key: String,
    webhook_secret: String,
    webhook_tolerance_secs: i64,
}

/// Non-2xx answer from Stripe. Travels inside `anyhow::Error` so callers can
/// downcast and tell a rejected request from an outage.
#[derive(Debug, Error)]
#[error("Stripe API request failed: {context} (status {status}, request_id={request_id:?})")]
pub struct StripeApiError {
    pub context: String,
    pub status: u16,
    pub error_type: Option<String>,
    pub code: Option<String>,
    pub message: Option<String>,
    pub decline_code: Option<String>,
    pub request_id: Option<String>,
}

impl StripeApiError {
    /// Stripe rejected the request itself; nothing was applied remotely.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status) && self.status != 429
    }

    pub fn is_card_error(&self) -> bool {
        self.status == 402 || self.error_type.as_deref() == Some("card_error")
    }

    pub fn user_message(&self) -> String {
        self.message
            .clone()
            .unwrap_or_else(|| format!("billing provider rejected the request ({})", self.status))
    }
}

/// The signature checked out but the body is not an event this client can read.
/// Travels inside `anyhow::Error` like `StripeApiError`.
#[derive(Debug, Error)]
#[error("signed webhook payload is not a readable Stripe event")]
pub struct WebhookPayloadError(#[source] pub serde_json::Error);

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEvent {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub type_: String,
    pub created: Option<i64>,
    pub livemode: Option<bool>,
    pub api_version: Option<String>,
    pub data: StripeEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

impl StripeEvent {
    pub fn subscription(&self) -> Result<StripeSubscription> {
        serde_json::from_value(self.data.object.clone())
            .with_context(|| format!("event {:?} does not carry a subscription", self.id))
    }
}

#[derive(Debug, Deserialize)]
struct StripeErrorEnvelope {
    error: StripeErrorDetails,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetails {
    #[serde(rename = "type")]
    type_: Option<String>,
    code: Option<String>,
    message: Option<String>,
    param: Option<String>,
    decline_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeList<T> {
    pub data: Vec<T>,
    #[serde(default)]
    pub has_more: bool,
}

impl<T> Default for StripeList<T> {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            has_more: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripePrice {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeSubscription {
    pub id: String,
    pub customer: Option<String>,
    pub status: String,
    pub billing_cycle_anchor: Option<i64>,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    pub trial_end: Option<i64>,
    pub ended_at: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub items: StripeList<StripeSubscriptionItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeSubscriptionItem {
    pub id: String,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    pub price: Option<StripePrice>,
}

impl StripeSubscription {
    /// Returns the subscription period start timestamp, falling back to the first item
    /// or the billing cycle anchor when the top-level field is absent.
    pub fn period_start(&self) -> Option<i64> {
        self.current_period_start
            .or_else(|| {
                self.items
                    .data
                    .first()
                    .and_then(|item| item.current_period_start)
            })
            .or(self.billing_cycle_anchor)
    }

    /// Returns the subscription period end timestamp, falling back to the first item when needed.
    pub fn period_end(&self) -> Option<i64> {
        self.current_period_end.or_else(|| {
            self.items
                .data
                .first()
                .and_then(|item| item.current_period_end)
        })
    }

    pub fn first_item_id(&self) -> Option<&str> {
        self.items.data.first().map(|item| item.id.as_str())
    }

    pub fn price_id(&self) -> Option<&str> {
        self.items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeCustomer {
    pub id: String,
    pub email: Option<String>,
    pub invoice_settings: Option<StripeInvoiceSettings>,
    pub deleted: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeInvoiceSettings {
    pub default_payment_method: Option<String>,
}

impl StripeCustomer {
    pub fn default_payment_method(&self) -> Option<&str> {
        self.invoice_settings
            .as_ref()
            .and_then(|settings| settings.default_payment_method.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripePaymentMethod {
    pub id: String,
    pub created: i64,
    pub customer: Option<String>,
    pub card: Option<StripeCard>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeCard {
    pub brand: String,
    pub last4: String,
    pub exp_month: u32,
    pub exp_year: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeInvoice {
    pub id: String,
    pub customer: Option<String>,
    pub subscription: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub amount_due: i64,
    #[serde(default)]
    pub amount_paid: i64,
    #[serde(default)]
    pub amount_remaining: i64,
    pub currency: Option<String>,
    pub paid: Option<bool>,
    pub created: i64,
    pub due_date: Option<i64>,
    pub status_transitions: Option<StripeStatusTransitions>,
    #[serde(default)]
    pub lines: StripeList<StripeInvoiceLine>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeStatusTransitions {
    pub paid_at: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeInvoiceLine {
    pub price: Option<StripePrice>,
}

impl StripeInvoice {
    pub fn price_id(&self) -> Option<&str> {
        self.lines
            .data
            .first()
            .and_then(|line| line.price.as_ref())
            .map(|price| price.id.as_str())
    }
}

/// Filter for invoice listings. `limit` is capped at 100 by Stripe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvoiceFilter {
    pub customer_id: String,
    pub status: Option<String>,
    pub subscription_id: Option<String>,
    pub limit: u32,
    pub starting_after: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCustomer {
    pub email: String,
    pub name: String,
    pub payment_method_id: String,
    pub user_id: Uuid,
}

impl StripeClient {
    pub fn new(secret_key: String, webhook_secret: String, webhook_tolerance_secs: i64) -> Self {
        Self {
            http: reqwest::Client::new(),
            secret_key,
            webhook_secret,
            webhook_tolerance_secs,
        }
    }

    async fn ensure_success(resp: reqwest::Response, context: &str) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status();
        let request_id = resp
            .headers()
            .get("request-id")
            .or_else(|| resp.headers().get("stripe-request-id"))
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());

        let body = match resp.text().await {
            Ok(text) if !text.is_empty() => text,
            Ok(_) => "<empty response body>".to_string(),
            Err(err) => format!("<failed to read response body: {err}>"),
        };

        let details = serde_json::from_str::<StripeErrorEnvelope>(&body)
            .map(|envelope| envelope.error)
            .ok();
        let (error_type, code, param, message, decline_code) = match details {
            Some(details) => (
                details.type_,
                details.code,
                details.param,
                details.message,
                details.decline_code,
            ),
            None => (None, None, None, None, None),
        };

        error!(
            status = %status,
            stripe_request_id = ?request_id,
            stripe_error_type = ?error_type,
            stripe_error_code = ?code,
            stripe_error_param = ?param,
            stripe_error_message = ?message,
            stripe_decline_code = ?decline_code,
            response_body = %body,
            context = %context,
            "stripe api request failed"
        );

        Err(StripeApiError {
            context: context.to_string(),
            status: status.as_u16(),
            error_type,
            code,
            message,
            decline_code,
            request_id,
        }
        .into())
    }

    async fn post_form<T>(&self, path: &str, body: &[(String, String)], context: &str) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let resp = self
            .http
            .post(format!("{STRIPE_API_BASE}{path}"))
            .header(AUTHORIZATION, format!("Bearer {}", self.secret_key))
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .form(body)
            .send()
            .await?;
        let resp = Self::ensure_success(resp, context).await?;

        Ok(resp.json().await?)
    }

    async fn get_json<T>(&self, path: &str, query: &[(String, String)], context: &str) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let resp = self
            .http
            .get(format!("{STRIPE_API_BASE}{path}"))
            .header(AUTHORIZATION, format!("Bearer {}", self.secret_key))
            .query(query)
            .send()
            .await?;
        let resp = Self::ensure_success(resp, context).await?;

        Ok(resp.json().await?)
    }

    /// Creates a customer with `payment_method_id` attached as the invoice default.
    pub async fn create_customer(&self, customer: &NewCustomer) -> Result<String> {
        // https://stripe.com/docs/api/customers/create
        let body = vec![
            ("email".to_string(), customer.email.clone()),
            ("name".to_string(), customer.name.clone()),
            ("payment_method".to_string(), customer.payment_method_id.clone()),
            (
                "invoice_settings[default_payment_method]".to_string(),
                customer.payment_method_id.clone(),
            ),
            ("metadata[user_id]".to_string(), customer.user_id.to_string()),
        ];

        #[derive(Deserialize)]
        struct CustomerResp {
            id: String,
        }

        let parsed: CustomerResp = self.post_form("/customers", &body, "create customer").await?;
        Ok(parsed.id)
    }

    pub async fn retrieve_customer(&self, customer_id: &str) -> Result<StripeCustomer> {
        self.get_json(
            &format!("/customers/{customer_id}"),
            &[],
            "retrieve customer",
        )
        .await
    }

    pub async fn set_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> Result<StripeCustomer> {
        let body = vec![(
            "invoice_settings[default_payment_method]".to_string(),
            payment_method_id.to_string(),
        )];
        self.post_form(
            &format!("/customers/{customer_id}"),
            &body,
            "set default payment method",
        )
        .await
    }

    pub async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<StripeSubscription> {
        // https://stripe.com/docs/api/subscriptions/create
        let mut body = vec![
            ("customer".to_string(), customer_id.to_string()),
            ("items[0][price]".to_string(), price_id.to_string()),
        ];
        push_metadata(&mut body, metadata);

        self.post_form("/subscriptions", &body, "create subscription")
            .await
    }

    pub async fn retrieve_subscription(&self, subscription_id: &str) -> Result<StripeSubscription> {
        // https://stripe.com/docs/api/subscriptions/retrieve
        self.get_json(
            &format!("/subscriptions/{subscription_id}"),
            &[],
            "retrieve subscription",
        )
        .await
    }

    /// Swaps the price on an existing subscription item. No proration; the
    /// billing cycle restarts now.
    pub async fn update_subscription_price(
        &self,
        subscription_id: &str,
        item_id: &str,
        price_id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<StripeSubscription> {
        // https://stripe.com/docs/api/subscriptions/update
        let mut body = vec![
            ("items[0][id]".to_string(), item_id.to_string()),
            ("items[0][price]".to_string(), price_id.to_string()),
            ("proration_behavior".to_string(), "none".to_string()),
            ("billing_cycle_anchor".to_string(), "now".to_string()),
        ];
        push_metadata(&mut body, metadata);

        self.post_form(
            &format!("/subscriptions/{subscription_id}"),
            &body,
            "update subscription price",
        )
        .await
    }

    /// Cancels immediately without proration.
    pub async fn cancel_subscription(&self, subscription_id: &str) -> Result<StripeSubscription> {
        // https://stripe.com/docs/api/subscriptions/cancel
        let body = [("prorate", "false")];
        let resp = self
            .http
            .delete(format!("{STRIPE_API_BASE}/subscriptions/{subscription_id}"))
            .header(AUTHORIZATION, format!("Bearer {}", self.secret_key))
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .form(&body)
            .send()
            .await?;
        let resp = Self::ensure_success(resp, "cancel subscription").await?;

        Ok(resp.json().await?)
    }

    pub async fn list_invoices(&self, filter: &InvoiceFilter) -> Result<StripeList<StripeInvoice>> {
        // https://stripe.com/docs/api/invoices/list
        let mut query = vec![
            ("customer".to_string(), filter.customer_id.clone()),
            ("limit".to_string(), filter.limit.clamp(1, 100).to_string()),
        ];
        if let Some(status) = &filter.status {
            query.push(("status".to_string(), status.clone()));
        }
        if let Some(subscription_id) = &filter.subscription_id {
            query.push(("subscription".to_string(), subscription_id.clone()));
        }
        if let Some(cursor) = &filter.starting_after {
            query.push(("starting_after".to_string(), cursor.clone()));
        }

        self.get_json("/invoices", &query, "list invoices").await
    }

    pub async fn retrieve_invoice(&self, invoice_id: &str) -> Result<StripeInvoice> {
        self.get_json(&format!("/invoices/{invoice_id}"), &[], "retrieve invoice")
            .await
    }

    /// Raw invoice with customer, subscription and payment intent expanded.
    pub async fn retrieve_invoice_expanded(&self, invoice_id: &str) -> Result<serde_json::Value> {
        let query = vec![
            ("expand[]".to_string(), "customer".to_string()),
            ("expand[]".to_string(), "subscription".to_string()),
            ("expand[]".to_string(), "payment_intent".to_string()),
        ];
        self.get_json(
            &format!("/invoices/{invoice_id}"),
            &query,
            "retrieve expanded invoice",
        )
        .await
    }

    pub async fn pay_invoice(
        &self,
        invoice_id: &str,
        payment_method_id: Option<String>,
    ) -> Result<StripeInvoice> {
        // https://stripe.com/docs/api/invoices/pay
        let mut body = Vec::new();
        if let Some(payment_method_id) = payment_method_id {
            body.push(("payment_method".to_string(), payment_method_id));
        }
        self.post_form(&format!("/invoices/{invoice_id}/pay"), &body, "pay invoice")
            .await
    }

    pub async fn list_payment_methods(&self, customer_id: &str) -> Result<Vec<StripePaymentMethod>> {
        // https://stripe.com/docs/api/payment_methods/customer_list
        let query = vec![
            ("type".to_string(), "card".to_string()),
            ("limit".to_string(), "100".to_string()),
        ];
        let list: StripeList<StripePaymentMethod> = self
            .get_json(
                &format!("/customers/{customer_id}/payment_methods"),
                &query,
                "list payment methods",
            )
            .await?;
        Ok(list.data)
    }

    pub async fn retrieve_payment_method(&self, payment_method_id: &str) -> Result<StripePaymentMethod> {
        self.get_json(
            &format!("/payment_methods/{payment_method_id}"),
            &[],
            "retrieve payment method",
        )
        .await
    }

    pub async fn attach_payment_method(
        &self,
        payment_method_id: &str,
        customer_id: &str,
    ) -> Result<StripePaymentMethod> {
        let body = vec![("customer".to_string(), customer_id.to_string())];
        self.post_form(
            &format!("/payment_methods/{payment_method_id}/attach"),
            &body,
            "attach payment method",
        )
        .await
    }

    pub async fn detach_payment_method(&self, payment_method_id: &str) -> Result<StripePaymentMethod> {
        self.post_form(
            &format!("/payment_methods/{payment_method_id}/detach"),
            &[],
            "detach payment method",
        )
        .await
    }

    /// Mirrors the default card on the payment method itself (`metadata[isDefault]`).
    pub async fn flag_payment_method_default(
        &self,
        payment_method_id: &str,
        is_default: bool,
    ) -> Result<StripePaymentMethod> {
        let body = vec![("metadata[isDefault]".to_string(), is_default.to_string())];
        self.post_form(
            &format!("/payment_methods/{payment_method_id}"),
            &body,
            "flag default payment method",
        )
        .await
    }

    /// Verifies the webhook signature. https://stripe.com/docs/webhooks/signatures
    pub fn verify_webhook_signature(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<StripeEvent> {
        self.verify_webhook_signature_at(payload, signature_header, Utc::now().timestamp())
    }

    pub fn verify_webhook_signature_at(
        &self,
        payload: &[u8],
        signature_header: &str,
        now: i64,
    ) -> Result<StripeEvent> {
        let mut timestamp: Option<&str> = None;
        let mut signatures: Vec<&str> = Vec::new();

        for part in signature_header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = Some(value),
                Some(("v1", value)) => signatures.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| anyhow!("missing timestamp in stripe-signature"))?;
        if signatures.is_empty() {
            bail!("missing v1 in stripe-signature");
        }

        let issued_at: i64 = timestamp
            .parse()
            .context("invalid timestamp in stripe-signature")?;
        // `t=` is unauthenticated at this point, so the distance must not overflow.
        let tolerance = u64::try_from(self.webhook_tolerance_secs).unwrap_or(0);
        if now.abs_diff(issued_at) > tolerance {
            bail!("stripe-signature timestamp outside tolerance");
        }

        let mut mac = HmacSha256::new_from_slice(self.webhook_secret.as_bytes())?;
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(payload);

        // `verify_slice` compares in constant time.
        let verified = signatures
            .iter()
            .filter_map(|signature| hex::decode(signature).ok())
            .any(|provided| mac.clone().verify_slice(&provided).is_ok());
        if !verified {
            bail!("invalid webhook signature");
        }

        let event: StripeEvent = serde_json::from_slice(payload).map_err(WebhookPayloadError)?;
        Ok(event)
    }
}

fn push_metadata(body: &mut Vec<(String, String)>, metadata: HashMap<String, String>) {
    for (key, value) in metadata {
        body.push((format!("metadata[{}]", key), value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const NOW: i64 = 1_700_000_000;

    fn client() -> StripeClient {
        StripeClient::new("sk_test".to_string(), SECRET.to_string(), 300)
    }

    fn sign(timestamp: i64, payload: &[u8], secret: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    fn payload() -> Vec<u8> {
        serde_json::json!({
            "id": "evt_1",
            "type": "customer.subscription.updated",
            "created": NOW,
            "data": { "object": {
                "id": "sub_1",
                "customer": "cus_1",
                "status": "active",
                "metadata": { "episode_id": "6f1c8a52-4a36-4f7e-9d8e-1f5a0d1c2b3a" },
                "items": { "data": [
                    { "id": "si_1", "current_period_start": 100, "current_period_end": 200,
                      "price": { "id": "price_gold" } }
                ] }
            } }
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn accepts_a_valid_signature() {
        let body = payload();
        let header = format!("t={NOW},v1={}", sign(NOW, &body, SECRET));

        let event = client()
            .verify_webhook_signature_at(&body, &header, NOW + 10)
            .unwrap();

        assert_eq!(event.type_, "customer.subscription.updated");
        let subscription = event.subscription().unwrap();
        assert_eq!(subscription.id, "sub_1");
        assert_eq!(subscription.period_start(), Some(100));
        assert_eq!(subscription.price_id(), Some("price_gold"));
        assert_eq!(subscription.first_item_id(), Some("si_1"));
    }

    #[test]
    fn accepts_when_any_of_several_signatures_matches() {
        let body = payload();
        let header = format!(
            "t={NOW}, v1={}, v1={}, v0=legacy",
            sign(NOW, &body, "whsec_rotated_out"),
            sign(NOW, &body, SECRET)
        );

        assert!(client().verify_webhook_signature_at(&body, &header, NOW).is_ok());
    }

    #[test]
    fn rejects_tampered_payload() {
        let body = payload();
        let header = format!("t={NOW},v1={}", sign(NOW, &body, SECRET));
        let mut tampered = body.clone();
        tampered.push(b' ');

        assert!(client().verify_webhook_signature_at(&tampered, &header, NOW).is_err());
    }

    #[test]
    fn extreme_timestamps_are_rejected_without_overflow() {
        let body = payload();
        for issued in [i64::MIN, i64::MAX] {
            let header = format!("t={issued},v1=00");

            let err = client()
                .verify_webhook_signature_at(&body, &header, NOW)
                .unwrap_err();

            assert!(err.to_string().contains("outside tolerance"), "{err}");
        }
    }

    #[test]
    fn signed_but_unreadable_payload_is_told_apart_from_a_bad_signature() {
        let body = br#"{"object":"event","unexpected":true}"#.to_vec();
        let header = format!("t={NOW},v1={}", sign(NOW, &body, SECRET));

        let err = client()
            .verify_webhook_signature_at(&body, &header, NOW)
            .unwrap_err();
        assert!(err.downcast_ref::<WebhookPayloadError>().is_some());

        let forged = format!("t={NOW},v1={}", sign(NOW, &body, "whsec_other"));
        let err = client()
            .verify_webhook_signature_at(&body, &forged, NOW)
            .unwrap_err();
        assert!(err.downcast_ref::<WebhookPayloadError>().is_none());
    }

    #[test]
    fn rejects_timestamp_outside_tolerance() {
        let body = payload();
        let issued = NOW - 301;
        let header = format!("t={issued},v1={}", sign(issued, &body, SECRET));

        assert!(client().verify_webhook_signature_at(&body, &header, NOW).is_err());
    }

    #[test]
    fn rejects_header_without_v1() {
        let body = payload();
        let header = format!("t={NOW}");

        assert!(client().verify_webhook_signature_at(&body, &header, NOW).is_err());
    }

    #[test]
    fn classifies_api_errors() {
        let declined = StripeApiError {
            context: "create subscription".to_string(),
            status: 402,
            error_type: Some("card_error".to_string()),
            code: Some("card_declined".to_string()),
            message: Some("Your card was declined.".to_string()),
            decline_code: Some("generic_decline".to_string()),
            request_id: None,
        };
        assert!(declined.is_client_error());
        assert!(declined.is_card_error());
        assert_eq!(declined.user_message(), "Your card was declined.");

        let rate_limited = StripeApiError {
            status: 429,
            error_type: None,
            message: None,
            ..declined
        };
        assert!(!rate_limited.is_client_error());
    }
}
