pub mod billing_gateway;
pub mod enrollments;
pub mod entitlement_reconciler;
pub mod invoices;
pub mod payment_methods;
pub mod plans_overview;
pub mod stripe_webhook;
pub mod subscriptions;
