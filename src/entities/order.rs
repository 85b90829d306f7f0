use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An order header. The single source of truth for order status.
///
/// Orders are created by checkout (status `pending` or `paid`), mutated only
/// by the payment webhook handler and admin actions, and never deleted:
/// they are financial records.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    /// Human-facing order number, unique and immutable once assigned.
    #[sea_orm(unique)]
    pub order_number: String,
    /// Nullable: guest checkout is permitted.
    #[sea_orm(nullable)]
    pub user_id: Option<Uuid>,
    pub email: String,
    pub status: OrderStatus,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub subtotal: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub shipping_cost: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub tax_amount: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub discount_amount: Decimal,
    /// total = max(0, subtotal + shipping_cost + tax_amount - discount_amount)
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub total: Decimal,
    pub currency: String,
    #[sea_orm(nullable)]
    pub coupon_id: Option<Uuid>,
    #[sea_orm(nullable)]
    pub coupon_code: Option<String>,
    /// Set at creation for paid flows, null for free orders.
    #[sea_orm(nullable)]
    pub stripe_session_id: Option<String>,
    /// Set once payment completes; correlates refunds back to the order.
    #[sea_orm(nullable)]
    pub stripe_payment_intent: Option<String>,
    #[sea_orm(nullable)]
    pub tracking_number: Option<String>,
    #[sea_orm(nullable)]
    pub carrier: Option<String>,
    #[sea_orm(nullable)]
    pub tracking_url: Option<String>,
    /// Denormalized address snapshot. Never joined to a live address table:
    /// the shipping destination must not change retroactively.
    #[sea_orm(column_type = "Json")]
    pub shipping_address: Json,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItems,
    #[sea_orm(has_many = "super::order_activity::Entity")]
    Activity,
    #[sea_orm(has_many = "super::order_note::Entity")]
    Notes,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItems.def()
    }
}

impl Related<super::order_activity::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Activity.def()
    }
}

impl Related<super::order_note::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Notes.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Order lifecycle status.
///
/// Transitions are monotonic forward (`pending → paid → processing → shipped
/// → delivered`) except the cancel/refund side paths; see
/// [`OrderStatus::can_transition_to`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    strum::Display,
    strum::EnumString,
    utoipa::ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OrderStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "paid")]
    Paid,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "shipped")]
    Shipped,
    #[sea_orm(string_value = "delivered")]
    Delivered,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
    #[sea_orm(string_value = "refunded")]
    Refunded,
}

impl OrderStatus {
    /// Statuses from which a captured payment can still be refunded.
    pub const REFUNDABLE: &'static [OrderStatus] = &[
        OrderStatus::Paid,
        OrderStatus::Processing,
        OrderStatus::Shipped,
        OrderStatus::Delivered,
    ];

    /// Statuses an admin may cancel from.
    pub const CANCELLABLE: &'static [OrderStatus] = &[
        OrderStatus::Pending,
        OrderStatus::Paid,
        OrderStatus::Processing,
        OrderStatus::Shipped,
        OrderStatus::Delivered,
    ];

    pub fn is_refundable(self) -> bool {
        Self::REFUNDABLE.contains(&self)
    }

    /// Whether a transition from `self` to `to` is legal.
    pub fn can_transition_to(self, to: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, to) {
            // Forward path
            (Pending, Paid) => true,
            (Paid, Processing) => true,
            (Paid, Shipped) | (Processing, Shipped) => true,
            (Shipped, Delivered) => true,
            // Cancellation side path
            (Pending | Paid | Processing | Shipped | Delivered, Cancelled) => true,
            // Refund side path
            (Paid | Processing | Shipped | Delivered, Refunded) => true,
            // Same-status writes are a no-op, not an error
            _ if self == to => true,
            _ => false,
        }
    }
}
