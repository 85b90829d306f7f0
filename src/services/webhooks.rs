//! Payment-processor event reconciliation.
//!
//! Every event is recorded in the `webhook_events` idempotency ledger before
//! any side effect runs; a redelivered event short-circuits. Status writes
//! go through the order ledger's compare-and-set transition, so even two
//! concurrent deliveries of distinct events for the same order cannot apply
//! a transition twice. Secondary side effects (stock, email) are best
//! effort once the status write lands: those are logged, never rolled back,
//! and the handler still reports success. A delivery that errors before
//! that point releases its ledger row so the processor's redelivery gets a
//! clean retry.

use std::sync::Arc;

use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set, SqlErr};
use serde_json::{json, Value};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::{
        order::{Model as OrderModel, OrderStatus},
        order_activity::ActionType,
        webhook_event,
    },
    errors::ServiceError,
    services::{
        catalog::CatalogService,
        coupons::CouponService,
        notifications::NotificationService,
        orders::{CreateOrder, NewOrderItem, OrderService, ShippingAddress},
        pricing,
    },
    events::{Event, EventSender},
};

#[derive(Clone)]
pub struct WebhookService {
    db: Arc<DatabaseConnection>,
    orders: Arc<OrderService>,
    catalog: Arc<CatalogService>,
    coupons: Arc<CouponService>,
    notifications: Arc<NotificationService>,
    event_sender: EventSender,
    currency: String,
}

impl WebhookService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        orders: Arc<OrderService>,
        catalog: Arc<CatalogService>,
        coupons: Arc<CouponService>,
        notifications: Arc<NotificationService>,
        event_sender: EventSender,
        currency: String,
    ) -> Self {
        Self {
            db,
            orders,
            catalog,
            coupons,
            notifications,
            event_sender,
            currency,
        }
    }

    /// Applies one verified processor event. Returns `Ok` for duplicates and
    /// unhandled types; only malformed payloads and storage failures error.
    #[instrument(skip(self, event))]
    pub async fn process_event(&self, event: &Value) -> Result<(), ServiceError> {
        let event_id = event
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::BadRequest("event is missing an id".to_string()))?;
        let event_type = event
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::BadRequest("event is missing a type".to_string()))?;
        let object = event
            .pointer("/data/object")
            .cloned()
            .unwrap_or(Value::Null);

        if !self.record_event(event_id, event_type, event).await? {
            info!(event_id, "Webhook event already processed; skipping");
            return Ok(());
        }

        let result = match event_type {
            "checkout.session.completed" => self.handle_session_completed(&object).await,
            "checkout.session.expired" => self.handle_session_expired(&object).await,
            "payment_intent.payment_failed" => {
                // A failed attempt does not cancel the pending order; the
                // customer may retry from the same session.
                let payment_intent = object.get("id").and_then(Value::as_str).unwrap_or("");
                info!(payment_intent, "Payment attempt failed; order left pending");
                Ok(())
            }
            "charge.refunded" => self.handle_charge_refunded(&object).await,
            "refund.succeeded" => self.handle_refund_succeeded(&object).await,
            "refund.failed" => self.handle_refund_failed(&object).await,
            other => {
                info!(event_type = other, "Unhandled webhook event type");
                Ok(())
            }
        };

        if result.is_err() {
            // A delivery that failed mid-processing must stay retryable:
            // release the ledger row so the processor's redelivery is not
            // mistaken for a duplicate.
            self.release_event(event_id).await;
        }

        result
    }

    /// Records the processor event id. Returns false when the id was already
    /// recorded (a redelivery).
    async fn record_event(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &Value,
    ) -> Result<bool, ServiceError> {
        let row = webhook_event::ActiveModel {
            event_id: Set(event_id.to_string()),
            event_type: Set(event_type.to_string()),
            payload: Set(payload.clone()),
            processed_at: Set(Utc::now()),
        };

        match row.insert(&*self.db).await {
            Ok(_) => Ok(true),
            Err(e) => match e.sql_err() {
                Some(SqlErr::UniqueConstraintViolation(_)) => Ok(false),
                _ => Err(ServiceError::DatabaseError(e)),
            },
        }
    }

    /// Drops a ledger row after a failed delivery. Best effort: if the
    /// delete itself fails the event stays claimed and the warning is the
    /// only trace.
    async fn release_event(&self, event_id: &str) {
        if let Err(e) = webhook_event::Entity::delete_by_id(event_id.to_string())
            .exec(&*self.db)
            .await
        {
            warn!(event_id, "Could not release failed webhook event: {}", e);
        }
    }

    async fn handle_session_completed(&self, session: &Value) -> Result<(), ServiceError> {
        let session_id = session
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::BadRequest("session has no id".to_string()))?;
        let payment_intent = session
            .get("payment_intent")
            .and_then(Value::as_str)
            .map(str::to_string);

        let order = match self.orders.find_by_session_id(session_id).await? {
            Some(order) => order,
            None => {
                // The checkout write may have failed or still be in flight;
                // rebuild the order from the session metadata snapshot.
                warn!(session_id, "No order for completed session; reconstructing from metadata");
                match self.reconstruct_order(session_id, session).await? {
                    Some(order) => order,
                    None => return Ok(()),
                }
            }
        };

        let transition = self
            .orders
            .transition(
                order.id,
                &[OrderStatus::Pending],
                OrderStatus::Paid,
                None,
                Some(json!({ "source": "checkout.session.completed" })),
            )
            .await;

        let order = match transition {
            Ok(t) if t.applied() => t.order().clone(),
            Ok(t) => {
                info!(order_id = %t.order().id, "Order already paid; completed event is a no-op");
                return Ok(());
            }
            Err(ServiceError::Conflict(msg)) => {
                warn!(order_id = %order.id, "Completed session ignored: {}", msg);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if let Some(intent) = &payment_intent {
            self.orders.set_payment_intent(order.id, intent).await?;
        }

        self.orders
            .log_activity(
                order.id,
                ActionType::PaymentCaptured,
                None,
                None,
                Some(json!({
                    "session_id": session_id,
                    "payment_intent": payment_intent,
                })),
                None,
            )
            .await;

        if let Some(coupon_id) = order.coupon_id {
            match self.coupons.redeem(coupon_id).await {
                Ok(()) => {
                    self.event_sender
                        .send(Event::CouponRedeemed {
                            coupon_id,
                            order_id: order.id,
                        })
                        .await
                }
                Err(e) => {
                    warn!(order_id = %order.id, "Coupon redemption on payment failed: {}", e)
                }
            }
        }

        // Best-effort from here on: the paid status is already authoritative.
        let items = match self.orders.get_order_items(order.id).await {
            Ok(items) => items,
            Err(e) => {
                warn!(order_id = %order.id, "Skipping post-payment stock/email effects: {}", e);
                self.event_sender.send(Event::OrderPaid(order.id)).await;
                return Ok(());
            }
        };
        for item in &items {
            if let Err(e) = self
                .catalog
                .decrement_stock(item.variant_id, item.quantity)
                .await
            {
                warn!(order_id = %order.id, variant_id = %item.variant_id, "Stock decrement failed: {}", e);
            }
        }
        self.notifications.send_order_confirmation(&order, &items);
        self.event_sender.send(Event::OrderPaid(order.id)).await;

        Ok(())
    }

    async fn handle_session_expired(&self, session: &Value) -> Result<(), ServiceError> {
        let session_id = session
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::BadRequest("session has no id".to_string()))?;

        let Some(order) = self.orders.find_by_session_id(session_id).await? else {
            warn!(session_id, "Expired session matches no order");
            return Ok(());
        };

        match self
            .orders
            .transition(
                order.id,
                &[OrderStatus::Pending],
                OrderStatus::Cancelled,
                None,
                Some(json!({ "source": "checkout.session.expired" })),
            )
            .await
        {
            Ok(t) if t.applied() => {
                self.event_sender.send(Event::OrderCancelled(order.id)).await;
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(ServiceError::Conflict(msg)) => {
                // Paid before the expiry signal arrived; nothing to do.
                info!(order_id = %order.id, "Expiry ignored: {}", msg);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_charge_refunded(&self, charge: &Value) -> Result<(), ServiceError> {
        let Some(payment_intent) = charge.get("payment_intent").and_then(Value::as_str) else {
            warn!("charge.refunded without payment_intent");
            return Ok(());
        };
        let refunded_cents = charge
            .get("amount_refunded")
            .and_then(Value::as_i64)
            .unwrap_or(0);

        self.apply_refund_event(payment_intent, refunded_cents, "charge.refunded", false)
            .await
    }

    async fn handle_refund_succeeded(&self, refund: &Value) -> Result<(), ServiceError> {
        let Some(payment_intent) = refund.get("payment_intent").and_then(Value::as_str) else {
            warn!("refund.succeeded without payment_intent");
            return Ok(());
        };
        let refunded_cents = refund.get("amount").and_then(Value::as_i64).unwrap_or(0);

        self.apply_refund_event(payment_intent, refunded_cents, "refund.succeeded", true)
            .await
    }

    /// Shared full/partial refund reconciliation. `notify` controls the
    /// customer email (refund.succeeded sends one, charge.refunded does not).
    async fn apply_refund_event(
        &self,
        payment_intent: &str,
        refunded_cents: i64,
        source: &str,
        notify: bool,
    ) -> Result<(), ServiceError> {
        let Some(order) = self.orders.find_by_payment_intent(payment_intent).await? else {
            warn!(payment_intent, "Refund event matches no order");
            return Ok(());
        };

        let total_cents = pricing::decimal_to_cents(order.total);
        let full_refund = refunded_cents >= total_cents;
        let refunded = pricing::cents_to_decimal(refunded_cents);

        if full_refund {
            match self
                .orders
                .transition(
                    order.id,
                    OrderStatus::REFUNDABLE,
                    OrderStatus::Refunded,
                    None,
                    Some(json!({ "source": source })),
                )
                .await
            {
                Ok(_) => {}
                Err(ServiceError::Conflict(msg)) => {
                    // Already refunded or cancelled; the activity entry below
                    // still documents the processor's view.
                    info!(order_id = %order.id, "Refund status write skipped: {}", msg);
                }
                Err(e) => return Err(e),
            }
        }

        self.orders
            .log_activity(
                order.id,
                ActionType::Refund,
                None,
                None,
                Some(json!({
                    "amount": refunded.to_string(),
                    "currency": self.currency,
                    "partial": !full_refund,
                })),
                Some(json!({ "source": source })),
            )
            .await;

        if notify {
            self.notifications
                .send_order_refunded(&order, refunded, None, !full_refund);
        }
        self.event_sender
            .send(Event::OrderRefunded {
                order_id: order.id,
                amount: refunded,
                partial: !full_refund,
            })
            .await;

        Ok(())
    }

    /// A refund the processor could not complete: operational alert for
    /// staff, never a customer email.
    async fn handle_refund_failed(&self, refund: &Value) -> Result<(), ServiceError> {
        let Some(payment_intent) = refund.get("payment_intent").and_then(Value::as_str) else {
            warn!("refund.failed without payment_intent");
            return Ok(());
        };
        let Some(order) = self.orders.find_by_payment_intent(payment_intent).await? else {
            warn!(payment_intent, "refund.failed matches no order");
            return Ok(());
        };

        warn!(order_id = %order.id, "Processor reported a failed refund; manual follow-up required");
        self.orders
            .log_activity(
                order.id,
                ActionType::Refund,
                None,
                None,
                Some(json!({
                    "failed": true,
                    "refund_id": refund.get("id").and_then(Value::as_str),
                })),
                Some(json!({ "needs_attention": true, "source": "refund.failed" })),
            )
            .await;

        Ok(())
    }

    /// Fallback-recovery path: rebuilds a pending order (and its items) from
    /// the snapshot the checkout embedded in the session metadata.
    async fn reconstruct_order(
        &self,
        session_id: &str,
        session: &Value,
    ) -> Result<Option<OrderModel>, ServiceError> {
        let metadata = session.get("metadata").cloned().unwrap_or(Value::Null);

        let Some(order_number) = metadata.get("order_number").and_then(Value::as_str) else {
            warn!(session_id, "Session metadata missing order_number; cannot reconstruct");
            return Ok(None);
        };

        // The insert may simply have raced this delivery.
        if let Some(existing) = self.orders.find_by_order_number(order_number).await? {
            return Ok(Some(existing));
        }

        let address: ShippingAddress = match metadata
            .get("shipping_address")
            .and_then(Value::as_str)
            .map(serde_json::from_str)
        {
            Some(Ok(address)) => address,
            _ => {
                warn!(session_id, "Session metadata has no usable shipping address");
                return Ok(None);
            }
        };
        let items: Vec<NewOrderItem> = match metadata
            .get("items")
            .and_then(Value::as_str)
            .map(serde_json::from_str)
        {
            Some(Ok(items)) => items,
            _ => {
                warn!(session_id, "Session metadata has no usable item list");
                return Ok(None);
            }
        };

        let cents = |key: &str| {
            metadata
                .get(key)
                .and_then(|v| {
                    v.as_i64()
                        .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
                })
                .unwrap_or(0)
        };
        let coupon_id = metadata
            .get("coupon_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok());
        let coupon_code = metadata
            .get("coupon_code")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let user_id = metadata
            .get("user_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok());

        let email = address.email.clone();
        let order = self
            .orders
            .create_order(CreateOrder {
                order_number: order_number.to_string(),
                user_id,
                email,
                status: OrderStatus::Pending,
                subtotal: pricing::cents_to_decimal(cents("subtotal_cents")),
                shipping_cost: pricing::cents_to_decimal(cents("shipping_cents")),
                tax_amount: rust_decimal::Decimal::ZERO,
                discount_amount: pricing::cents_to_decimal(cents("discount_cents")),
                total: pricing::cents_to_decimal(cents("total_cents")),
                currency: self.currency.clone(),
                coupon_id,
                coupon_code,
                stripe_session_id: Some(session_id.to_string()),
                shipping_address: address,
                items,
            })
            .await?;

        self.orders
            .log_activity(
                order.id,
                ActionType::OrderEdited,
                None,
                None,
                Some(json!({ "reconstructed_from": "session_metadata" })),
                Some(json!({ "session_id": session_id })),
            )
            .await;

        info!(order_id = %order.id, order_number, "Order reconstructed from session metadata");
        Ok(Some(order))
    }
}
