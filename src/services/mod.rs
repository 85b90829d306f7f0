pub mod admin_actions;
pub mod catalog;
pub mod checkout;
pub mod coupons;
pub mod notifications;
pub mod orders;
pub mod payments;
pub mod pricing;
pub mod webhooks;
