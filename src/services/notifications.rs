//! Customer email dispatch.
//!
//! Every send is fire-and-forget: a slow or failing email channel must never
//! block or fail the order state transition that triggered it. Failures are
//! logged; successes leave an `email_sent` entry in the order activity log.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::{
        order::Model as OrderModel,
        order_activity::{self, ActionType},
        order_item::Model as OrderItemModel,
    },
    errors::ServiceError,
};

#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: EmailMessage) -> Result<(), ServiceError>;
}

/// Posts messages as JSON to a transactional-email HTTP endpoint.
pub struct HttpMailer {
    client: reqwest::Client,
    endpoint: String,
    from: String,
}

impl HttpMailer {
    pub fn new(endpoint: String, from: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            from,
        }
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, message: EmailMessage) -> Result<(), ServiceError> {
        let payload = json!({
            "from": self.from,
            "to": message.to,
            "subject": message.subject,
            "body": message.body,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ServiceError::ExternalServiceError(format!("email send failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ServiceError::ExternalServiceError(format!(
                "email endpoint returned {}",
                response.status()
            )));
        }

        Ok(())
    }
}

/// Mailer used when no email endpoint is configured; logs and succeeds.
pub struct NullMailer;

#[async_trait]
impl Mailer for NullMailer {
    async fn send(&self, message: EmailMessage) -> Result<(), ServiceError> {
        info!(to = %message.to, subject = %message.subject, "Email sending disabled; dropping message");
        Ok(())
    }
}

#[derive(Clone)]
pub struct NotificationService {
    db: Arc<DatabaseConnection>,
    mailer: Arc<dyn Mailer>,
}

impl NotificationService {
    pub fn new(db: Arc<DatabaseConnection>, mailer: Arc<dyn Mailer>) -> Self {
        Self { db, mailer }
    }

    #[instrument(skip(self, order, items), fields(order_id = %order.id))]
    pub fn send_order_confirmation(&self, order: &OrderModel, items: &[OrderItemModel]) {
        let lines = items
            .iter()
            .map(|item| {
                format!(
                    "  {} x {} ({}) — {}",
                    item.quantity, item.product_name, item.variant_sku, item.total_price
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let body = format!(
            "Thank you for your order {}!\n\nItems:\n{}\n\nSubtotal: {}\nShipping: {}\nDiscount: {}\nTotal: {}\n",
            order.order_number,
            lines,
            order.subtotal,
            order.shipping_cost,
            order.discount_amount,
            order.total
        );
        self.dispatch(
            order,
            "order_confirmation",
            format!("Order {} confirmed", order.order_number),
            body,
        );
    }

    #[instrument(skip(self, order), fields(order_id = %order.id))]
    pub fn send_order_shipped(&self, order: &OrderModel) {
        let tracking = match (&order.carrier, &order.tracking_number) {
            (Some(carrier), Some(number)) => format!("{carrier} tracking number {number}"),
            _ => "tracking details to follow".to_string(),
        };
        let tracking_link = order
            .tracking_url
            .as_deref()
            .map(|url| format!("\nTrack your parcel: {url}"))
            .unwrap_or_default();
        let body = format!(
            "Your order {} has shipped ({}).{}\n",
            order.order_number, tracking, tracking_link
        );
        self.dispatch(
            order,
            "order_shipped",
            format!("Order {} shipped", order.order_number),
            body,
        );
    }

    #[instrument(skip(self, order), fields(order_id = %order.id))]
    pub fn send_order_refunded(
        &self,
        order: &OrderModel,
        amount: Decimal,
        reason: Option<&str>,
        is_partial: bool,
    ) {
        let kind = if is_partial { "partially refunded" } else { "refunded" };
        let reason_line = reason
            .map(|r| format!("\nReason: {r}"))
            .unwrap_or_default();
        let body = format!(
            "Your order {} has been {}. Amount: {}.{}\n",
            order.order_number, kind, amount, reason_line
        );
        self.dispatch(
            order,
            "order_refunded",
            format!("Order {} {}", order.order_number, kind),
            body,
        );
    }

    #[instrument(skip(self, order), fields(order_id = %order.id))]
    pub fn send_order_cancelled(&self, order: &OrderModel, reason: &str, refund_note: Option<&str>) {
        let refund_line = refund_note
            .map(|note| format!("\n{note}"))
            .unwrap_or_default();
        let body = format!(
            "Your order {} has been cancelled.\nReason: {}{}\n",
            order.order_number, reason, refund_line
        );
        self.dispatch(
            order,
            "order_cancelled",
            format!("Order {} cancelled", order.order_number),
            body,
        );
    }

    #[instrument(skip(self, order, content), fields(order_id = %order.id))]
    pub fn send_customer_note(&self, order: &OrderModel, content: &str) {
        let body = format!(
            "An update on your order {}:\n\n{}\n",
            order.order_number, content
        );
        self.dispatch(
            order,
            "customer_note",
            format!("Update on order {}", order.order_number),
            body,
        );
    }

    /// Spawns the actual send so the caller's transaction never waits on the
    /// email channel. Outcome is recorded after the fact.
    fn dispatch(&self, order: &OrderModel, email_type: &'static str, subject: String, body: String) {
        let mailer = self.mailer.clone();
        let db = self.db.clone();
        let order_id = order.id;
        let to = order.email.clone();

        tokio::spawn(async move {
            let message = EmailMessage { to, subject, body };
            match mailer.send(message).await {
                Ok(()) => {
                    let entry = order_activity::ActiveModel {
                        id: Set(Uuid::new_v4()),
                        order_id: Set(order_id),
                        action_type: Set(ActionType::EmailSent),
                        performed_by: Set(None),
                        previous_value: Set(None),
                        new_value: Set(Some(json!({ "email_type": email_type }))),
                        metadata: Set(None),
                        created_at: Set(Utc::now()),
                    };
                    if let Err(e) = entry.insert(&*db).await {
                        warn!(order_id = %order_id, "Failed to record email activity: {}", e);
                    }
                }
                Err(e) => {
                    warn!(order_id = %order_id, email_type, "Email dispatch failed: {}", e);
                }
            }
        });
    }
}
