//! Staff-invoked order operations: cancel, ship, deliver, refund.
//!
//! Each action composes ledger transitions, activity entries, optional
//! processor calls and optional notifications. Partial success (order
//! cancelled locally but the refund failed upstream) is reported distinctly
//! so staff can follow up instead of assuming full success.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::{
        order::{Model as OrderModel, OrderStatus},
        order_activity::ActionType,
        order_note::NoteType,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        notifications::NotificationService,
        orders::OrderService,
        payments::{PaymentGateway, RefundRequest},
        pricing,
    },
};

#[derive(Debug, Clone)]
pub struct CancelOrder {
    pub reason: String,
    /// When set, the cancellation note is customer-visible and the customer
    /// is emailed.
    pub notify_customer: bool,
    /// Attempt a full refund of a captured payment as part of cancelling.
    pub refund: bool,
}

#[derive(Debug)]
pub enum CancelOutcome {
    Cancelled { order: OrderModel },
    /// The order is cancelled locally but the processor refund failed;
    /// manual follow-up is required.
    CancelledRefundFailed {
        order: OrderModel,
        refund_error: String,
    },
}

#[derive(Debug, Clone)]
pub struct ShipOrder {
    pub carrier: String,
    pub tracking_number: String,
    pub tracking_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RefundOrder {
    /// None refunds the full order total.
    pub amount: Option<Decimal>,
    pub reason: Option<String>,
}

#[derive(Debug)]
pub struct RefundResult {
    pub order: OrderModel,
    pub refund_id: String,
    pub amount: Decimal,
    pub partial: bool,
}

#[derive(Clone)]
pub struct AdminOrderService {
    orders: Arc<OrderService>,
    gateway: Arc<dyn PaymentGateway>,
    notifications: Arc<NotificationService>,
    event_sender: EventSender,
}

impl AdminOrderService {
    pub fn new(
        orders: Arc<OrderService>,
        gateway: Arc<dyn PaymentGateway>,
        notifications: Arc<NotificationService>,
        event_sender: EventSender,
    ) -> Self {
        Self {
            orders,
            gateway,
            notifications,
            event_sender,
        }
    }

    #[instrument(skip(self, request), fields(order_id = %order_id, admin = %admin_id))]
    pub async fn cancel(
        &self,
        order_id: Uuid,
        admin_id: Uuid,
        request: CancelOrder,
    ) -> Result<CancelOutcome, ServiceError> {
        let reason = request.reason.trim();
        if reason.is_empty() {
            return Err(ServiceError::ValidationError(
                "A cancellation reason is required".to_string(),
            ));
        }

        let before = self.orders.get_order(order_id).await?;
        let had_captured_payment =
            before.stripe_payment_intent.is_some() && before.status.is_refundable();

        let transition = self
            .orders
            .transition(
                order_id,
                OrderStatus::CANCELLABLE,
                OrderStatus::Cancelled,
                Some(admin_id),
                Some(json!({ "reason": reason })),
            )
            .await?;
        if !transition.applied() {
            return Err(ServiceError::Conflict(format!(
                "Order {} is already cancelled",
                before.order_number
            )));
        }
        let order = transition.order().clone();

        self.orders
            .log_activity(
                order_id,
                ActionType::Cancellation,
                Some(admin_id),
                Some(json!({ "status": before.status.to_string() })),
                Some(json!({ "reason": reason })),
                None,
            )
            .await;

        let note_type = if request.notify_customer {
            NoteType::Customer
        } else {
            NoteType::Internal
        };
        if let Err(e) = self
            .orders
            .add_note(order_id, admin_id, note_type, format!("Cancelled: {reason}"))
            .await
        {
            warn!(order_id = %order_id, "Failed to record cancellation note: {}", e);
        }

        self.event_sender.send(Event::OrderCancelled(order_id)).await;

        let mut refund_error = None;
        if request.refund {
            if !had_captured_payment {
                refund_error = Some("order has no captured payment to refund".to_string());
            } else {
                match self
                    .refund_captured_payment(&before, None, Some(reason), admin_id)
                    .await
                {
                    Ok(_) => {}
                    Err(e) => refund_error = Some(e.response_message()),
                }
            }
        }

        if request.notify_customer {
            let refund_note = match &refund_error {
                Some(_) => None,
                None if request.refund && had_captured_payment => {
                    Some("Your payment has been refunded.")
                }
                _ => None,
            };
            self.notifications
                .send_order_cancelled(&order, reason, refund_note);
        }

        match refund_error {
            Some(refund_error) => {
                warn!(order_id = %order_id, "Order cancelled but refund failed: {}", refund_error);
                Ok(CancelOutcome::CancelledRefundFailed {
                    order,
                    refund_error,
                })
            }
            None => Ok(CancelOutcome::Cancelled { order }),
        }
    }

    #[instrument(skip(self, request), fields(order_id = %order_id, admin = %admin_id))]
    pub async fn ship(
        &self,
        order_id: Uuid,
        admin_id: Uuid,
        request: ShipOrder,
    ) -> Result<OrderModel, ServiceError> {
        if request.carrier.trim().is_empty() || request.tracking_number.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "Carrier and tracking number are required".to_string(),
            ));
        }

        let transition = self
            .orders
            .transition(
                order_id,
                &[OrderStatus::Paid, OrderStatus::Processing],
                OrderStatus::Shipped,
                Some(admin_id),
                Some(json!({ "tracking_number": request.tracking_number })),
            )
            .await?;
        if !transition.applied() {
            return Err(ServiceError::Conflict(format!(
                "Order {} is already shipped",
                transition.order().order_number
            )));
        }

        self.orders
            .set_tracking(
                order_id,
                request.carrier.trim(),
                request.tracking_number.trim(),
                request.tracking_url.as_deref(),
            )
            .await?;
        let order = self.orders.get_order(order_id).await?;

        self.orders
            .log_activity(
                order_id,
                ActionType::Shipment,
                Some(admin_id),
                None,
                Some(json!({
                    "carrier": order.carrier,
                    "tracking_number": order.tracking_number,
                })),
                None,
            )
            .await;

        self.notifications.send_order_shipped(&order);
        self.event_sender
            .send(Event::OrderShipped {
                order_id,
                tracking_number: request.tracking_number,
            })
            .await;

        info!(order_id = %order_id, "Order shipped");
        Ok(order)
    }

    #[instrument(skip(self), fields(order_id = %order_id, admin = %admin_id))]
    pub async fn mark_delivered(
        &self,
        order_id: Uuid,
        admin_id: Uuid,
    ) -> Result<OrderModel, ServiceError> {
        let transition = self
            .orders
            .transition(
                order_id,
                &[OrderStatus::Shipped],
                OrderStatus::Delivered,
                Some(admin_id),
                None,
            )
            .await?;
        if !transition.applied() {
            return Err(ServiceError::Conflict(format!(
                "Order {} is already delivered",
                transition.order().order_number
            )));
        }
        Ok(transition.order().clone())
    }

    /// Refunds a captured payment, fully or partially.
    ///
    /// The amount bound is validated before any processor call; a processor
    /// failure is surfaced to the admin and leaves the local order state
    /// untouched. Only a full refund moves the order to `refunded`.
    #[instrument(skip(self, request), fields(order_id = %order_id, admin = %admin_id))]
    pub async fn refund(
        &self,
        order_id: Uuid,
        admin_id: Uuid,
        request: RefundOrder,
    ) -> Result<RefundResult, ServiceError> {
        let order = self.orders.get_order(order_id).await?;
        self.refund_captured_payment(&order, request.amount, request.reason.as_deref(), admin_id)
            .await
    }

    async fn refund_captured_payment(
        &self,
        order: &OrderModel,
        amount: Option<Decimal>,
        reason: Option<&str>,
        admin_id: Uuid,
    ) -> Result<RefundResult, ServiceError> {
        let payment_intent = order.stripe_payment_intent.clone().ok_or_else(|| {
            ServiceError::Conflict(format!(
                "Order {} has no captured payment to refund",
                order.order_number
            ))
        })?;
        if !order.status.is_refundable() {
            return Err(ServiceError::Conflict(format!(
                "Order {} is not in a refundable status ({})",
                order.order_number, order.status
            )));
        }

        let total_cents = pricing::decimal_to_cents(order.total);
        let amount_cents = match amount {
            Some(amount) => {
                let cents = pricing::decimal_to_cents(amount);
                if cents <= 0 {
                    return Err(ServiceError::ValidationError(
                        "Refund amount must be positive".to_string(),
                    ));
                }
                if cents > total_cents {
                    return Err(ServiceError::ValidationError(format!(
                        "Refund amount {} exceeds order total {}",
                        amount, order.total
                    )));
                }
                cents
            }
            None => total_cents,
        };
        let partial = amount_cents < total_cents;

        let outcome = self
            .gateway
            .create_refund(RefundRequest {
                payment_intent,
                amount_cents: partial.then_some(amount_cents),
                reason: reason.map(str::to_string),
            })
            .await?;

        if !partial {
            match self
                .orders
                .transition(
                    order.id,
                    OrderStatus::REFUNDABLE,
                    OrderStatus::Refunded,
                    Some(admin_id),
                    Some(json!({ "refund_id": outcome.refund_id })),
                )
                .await
            {
                Ok(_) => {}
                // The webhook may have beaten us to the status write.
                Err(ServiceError::Conflict(msg)) => {
                    info!(order_id = %order.id, "Refund status write skipped: {}", msg)
                }
                Err(e) => return Err(e),
            }
        }

        let refunded = pricing::cents_to_decimal(amount_cents);
        self.orders
            .log_activity(
                order.id,
                ActionType::Refund,
                Some(admin_id),
                None,
                Some(json!({
                    "amount": refunded.to_string(),
                    "partial": partial,
                    "refund_id": outcome.refund_id,
                })),
                reason.map(|r| json!({ "reason": r })),
            )
            .await;

        let current = self.orders.get_order(order.id).await?;
        self.notifications
            .send_order_refunded(&current, refunded, reason, partial);
        self.event_sender
            .send(Event::OrderRefunded {
                order_id: order.id,
                amount: refunded,
                partial,
            })
            .await;

        info!(order_id = %order.id, partial, "Refund created: {}", outcome.refund_id);
        Ok(RefundResult {
            order: current,
            refund_id: outcome.refund_id,
            amount: refunded,
            partial,
        })
    }
}
