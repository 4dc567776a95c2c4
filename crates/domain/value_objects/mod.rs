pub mod billing;
pub mod enrollments;
pub mod entitlements;
pub mod enums;
pub mod plans;
pub mod subscriptions;
