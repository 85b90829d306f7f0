use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::{
        order::{self, Entity as OrderEntity, Model as OrderModel, OrderStatus},
        order_activity::{self, ActionType, Entity as ActivityEntity, Model as ActivityModel},
        order_item::{self, Entity as OrderItemEntity, Model as OrderItemModel},
        order_note::{self, Entity as NoteEntity, Model as NoteModel, NoteType},
    },
    errors::ServiceError,
    events::{Event, EventSender},
};

/// Structured shipping destination, stored on the order as a denormalized
/// JSON snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, utoipa::ToSchema)]
pub struct ShippingAddress {
    #[validate(length(min = 1, message = "Full name is required"))]
    pub full_name: String,
    #[validate(length(min = 1, message = "Street is required"))]
    pub street: String,
    #[validate(length(min = 1, message = "City is required"))]
    pub city: String,
    pub province: String,
    #[validate(length(min = 1, message = "Postal code is required"))]
    pub postal_code: String,
    #[validate(length(min = 2, message = "Country is required"))]
    pub country: String,
    #[validate(email(message = "A valid email is required"))]
    pub email: String,
    pub phone: Option<String>,
}

/// A line item snapshot captured at purchase time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrderItem {
    pub variant_id: Uuid,
    pub product_name: String,
    pub variant_sku: String,
    pub variant_attributes: serde_json::Value,
    pub unit_price: Decimal,
    pub quantity: i32,
}

#[derive(Debug, Clone)]
pub struct CreateOrder {
    pub order_number: String,
    pub user_id: Option<Uuid>,
    pub email: String,
    pub status: OrderStatus,
    pub subtotal: Decimal,
    pub shipping_cost: Decimal,
    pub tax_amount: Decimal,
    pub discount_amount: Decimal,
    pub total: Decimal,
    pub currency: String,
    pub coupon_id: Option<Uuid>,
    pub coupon_code: Option<String>,
    pub stripe_session_id: Option<String>,
    pub shipping_address: ShippingAddress,
    pub items: Vec<NewOrderItem>,
}

/// Outcome of a compare-and-set status transition.
#[derive(Debug)]
pub enum Transition {
    /// The status write was applied by this call.
    Applied(OrderModel),
    /// The order was already in the target status; nothing changed.
    NoOp(OrderModel),
}

impl Transition {
    pub fn order(&self) -> &OrderModel {
        match self {
            Transition::Applied(order) | Transition::NoOp(order) => order,
        }
    }

    pub fn applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }
}

/// Owns the `orders`/`order_items` records and every status write.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
}

impl OrderService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    /// Persists an order header and its items in one transaction.
    #[instrument(skip(self, input), fields(order_number = %input.order_number, items = input.items.len()))]
    pub async fn create_order(&self, input: CreateOrder) -> Result<OrderModel, ServiceError> {
        if input.items.is_empty() {
            return Err(ServiceError::ValidationError(
                "An order requires at least one item".to_string(),
            ));
        }

        let now = Utc::now();
        let order_id = Uuid::new_v4();

        let txn = self.db.begin().await.map_err(|e| {
            error!("Failed to start transaction for order creation: {}", e);
            ServiceError::DatabaseError(e)
        })?;

        let order = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(input.order_number.clone()),
            user_id: Set(input.user_id),
            email: Set(input.email.clone()),
            status: Set(input.status),
            subtotal: Set(input.subtotal),
            shipping_cost: Set(input.shipping_cost),
            tax_amount: Set(input.tax_amount),
            discount_amount: Set(input.discount_amount),
            total: Set(input.total),
            currency: Set(input.currency.clone()),
            coupon_id: Set(input.coupon_id),
            coupon_code: Set(input.coupon_code.clone()),
            stripe_session_id: Set(input.stripe_session_id.clone()),
            stripe_payment_intent: Set(None),
            tracking_number: Set(None),
            carrier: Set(None),
            tracking_url: Set(None),
            shipping_address: Set(serde_json::to_value(&input.shipping_address)?),
            created_at: Set(now),
            updated_at: Set(Some(now)),
        };

        let order = order.insert(&txn).await.map_err(|e| {
            error!(order_id = %order_id, "Failed to insert order: {}", e);
            ServiceError::DatabaseError(e)
        })?;

        for item in &input.items {
            let model = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                variant_id: Set(item.variant_id),
                product_name: Set(item.product_name.clone()),
                variant_sku: Set(item.variant_sku.clone()),
                variant_attributes: Set(item.variant_attributes.clone()),
                unit_price: Set(item.unit_price),
                quantity: Set(item.quantity),
                total_price: Set(item.unit_price * Decimal::from(item.quantity)),
                created_at: Set(now),
            };
            model.insert(&txn).await?;
        }

        txn.commit().await.map_err(|e| {
            error!(order_id = %order_id, "Failed to commit order creation: {}", e);
            ServiceError::DatabaseError(e)
        })?;

        info!(order_id = %order_id, order_number = %input.order_number, "Order created");
        self.event_sender.send(Event::OrderCreated(order_id)).await;

        Ok(order)
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderModel, ServiceError> {
        OrderEntity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    pub async fn get_order_items(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<OrderItemModel>, ServiceError> {
        Ok(OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await?)
    }

    pub async fn find_by_order_number(
        &self,
        order_number: &str,
    ) -> Result<Option<OrderModel>, ServiceError> {
        Ok(OrderEntity::find()
            .filter(order::Column::OrderNumber.eq(order_number))
            .one(&*self.db)
            .await?)
    }

    pub async fn find_by_session_id(
        &self,
        session_id: &str,
    ) -> Result<Option<OrderModel>, ServiceError> {
        Ok(OrderEntity::find()
            .filter(order::Column::StripeSessionId.eq(session_id))
            .one(&*self.db)
            .await?)
    }

    pub async fn find_by_payment_intent(
        &self,
        payment_intent: &str,
    ) -> Result<Option<OrderModel>, ServiceError> {
        Ok(OrderEntity::find()
            .filter(order::Column::StripePaymentIntent.eq(payment_intent))
            .one(&*self.db)
            .await?)
    }

    /// Customer-facing lookup: order number plus matching email, limited to
    /// what the order-status page needs.
    #[instrument(skip(self, email))]
    pub async fn customer_lookup(
        &self,
        order_number: &str,
        email: &str,
    ) -> Result<(OrderModel, Vec<OrderItemModel>), ServiceError> {
        let order = self
            .find_by_order_number(order_number)
            .await?
            .filter(|order| order.email.eq_ignore_ascii_case(email.trim()))
            .ok_or_else(|| ServiceError::NotFound("Order not found".to_string()))?;
        let items = self.get_order_items(order.id).await?;
        Ok((order, items))
    }

    /// Lists orders newest-first, optionally filtered by status.
    #[instrument(skip(self))]
    pub async fn list_orders(
        &self,
        page: u64,
        per_page: u64,
        status: Option<OrderStatus>,
    ) -> Result<(Vec<OrderModel>, u64), ServiceError> {
        let mut query = OrderEntity::find().order_by_desc(order::Column::CreatedAt);
        if let Some(status) = status {
            query = query.filter(order::Column::Status.eq(status));
        }

        let paginator = query.paginate(&*self.db, per_page.max(1));
        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page.saturating_sub(1)).await?;

        Ok((orders, total))
    }

    /// Moves an order to `to` if its current status is in `allowed_from`.
    ///
    /// The write is a conditional UPDATE (`... WHERE id = ? AND status IN
    /// (...)`), so concurrent webhook redeliveries and admin actions cannot
    /// apply the same transition twice: exactly one caller observes
    /// [`Transition::Applied`]. An order already in the target status is a
    /// [`Transition::NoOp`]; any other status outside `allowed_from` is a
    /// conflict.
    #[instrument(skip(self), fields(order_id = %order_id, to = %to))]
    pub async fn transition(
        &self,
        order_id: Uuid,
        allowed_from: &[OrderStatus],
        to: OrderStatus,
        performed_by: Option<Uuid>,
        metadata: Option<serde_json::Value>,
    ) -> Result<Transition, ServiceError> {
        let order = self.get_order(order_id).await?;

        if order.status == to {
            return Ok(Transition::NoOp(order));
        }

        if !allowed_from.contains(&order.status) {
            return Err(ServiceError::Conflict(format!(
                "Order {} cannot move from {} to {}",
                order.order_number, order.status, to
            )));
        }

        let old_status = order.status;
        let result = OrderEntity::update_many()
            .col_expr(order::Column::Status, Expr::value(to))
            .col_expr(order::Column::UpdatedAt, Expr::value(Some(Utc::now())))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.is_in(allowed_from.iter().copied()))
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            // Lost the race; report what actually happened.
            let current = self.get_order(order_id).await?;
            if current.status == to {
                return Ok(Transition::NoOp(current));
            }
            return Err(ServiceError::Conflict(format!(
                "Order {} was concurrently moved to {}",
                current.order_number, current.status
            )));
        }

        let updated = self.get_order(order_id).await?;

        self.log_activity(
            order_id,
            ActionType::StatusChange,
            performed_by,
            Some(json!({ "status": old_status.to_string() })),
            Some(json!({ "status": to.to_string() })),
            metadata,
        )
        .await;

        info!(order_id = %order_id, from = %old_status, to = %to, "Order status changed");
        self.event_sender
            .send(Event::OrderStatusChanged {
                order_id,
                old_status: old_status.to_string(),
                new_status: to.to_string(),
            })
            .await;

        Ok(Transition::Applied(updated))
    }

    /// Records the processor's payment intent once payment completes.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn set_payment_intent(
        &self,
        order_id: Uuid,
        payment_intent: &str,
    ) -> Result<(), ServiceError> {
        OrderEntity::update_many()
            .col_expr(
                order::Column::StripePaymentIntent,
                Expr::value(Some(payment_intent.to_string())),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Some(Utc::now())))
            .filter(order::Column::Id.eq(order_id))
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    /// Sets shipment tracking fields. Status is transitioned separately.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn set_tracking(
        &self,
        order_id: Uuid,
        carrier: &str,
        tracking_number: &str,
        tracking_url: Option<&str>,
    ) -> Result<(), ServiceError> {
        OrderEntity::update_many()
            .col_expr(order::Column::Carrier, Expr::value(Some(carrier.to_string())))
            .col_expr(
                order::Column::TrackingNumber,
                Expr::value(Some(tracking_number.to_string())),
            )
            .col_expr(
                order::Column::TrackingUrl,
                Expr::value(tracking_url.map(str::to_string)),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Some(Utc::now())))
            .filter(order::Column::Id.eq(order_id))
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    /// Appends an activity entry; failures are logged, never propagated.
    /// The audit trail is best-effort relative to the primary mutation.
    pub async fn log_activity(
        &self,
        order_id: Uuid,
        action_type: ActionType,
        performed_by: Option<Uuid>,
        previous_value: Option<serde_json::Value>,
        new_value: Option<serde_json::Value>,
        metadata: Option<serde_json::Value>,
    ) {
        let entry = order_activity::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            action_type: Set(action_type),
            performed_by: Set(performed_by),
            previous_value: Set(previous_value),
            new_value: Set(new_value),
            metadata: Set(metadata),
            created_at: Set(Utc::now()),
        };

        if let Err(e) = entry.insert(&*self.db).await {
            warn!(order_id = %order_id, "Failed to append activity entry: {}", e);
        }
    }

    /// Activity trail for an order, newest first.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn list_activity(&self, order_id: Uuid) -> Result<Vec<ActivityModel>, ServiceError> {
        Ok(ActivityEntity::find()
            .filter(order_activity::Column::OrderId.eq(order_id))
            .order_by_desc(order_activity::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    #[instrument(skip(self, content), fields(order_id = %order_id))]
    pub async fn add_note(
        &self,
        order_id: Uuid,
        created_by: Uuid,
        note_type: NoteType,
        content: String,
    ) -> Result<NoteModel, ServiceError> {
        if content.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "Note content must not be empty".to_string(),
            ));
        }

        // Ensure the order exists before attaching anything to it.
        let _ = self.get_order(order_id).await?;

        let note = order_note::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            created_by: Set(created_by),
            note_type: Set(note_type),
            content: Set(content.trim().to_string()),
            created_at: Set(Utc::now()),
        };
        let note = note.insert(&*self.db).await?;

        self.log_activity(
            order_id,
            ActionType::NoteAdded,
            Some(created_by),
            None,
            Some(json!({ "note_id": note.id, "note_type": note.note_type })),
            None,
        )
        .await;

        Ok(note)
    }

    pub async fn list_notes(&self, order_id: Uuid) -> Result<Vec<NoteModel>, ServiceError> {
        Ok(NoteEntity::find()
            .filter(order_note::Column::OrderId.eq(order_id))
            .order_by_desc(order_note::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    pub fn shipping_address(&self, order: &OrderModel) -> Result<ShippingAddress, ServiceError> {
        Ok(serde_json::from_value(order.shipping_address.clone())?)
    }
}
