use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Append-only audit trail of everything that happened to an order.
///
/// Rows are never updated or deleted. Display ordering is `created_at`
/// descending.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "order_activity_log")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub order_id: Uuid,
    pub action_type: ActionType,
    /// Null means the entry was system/webhook-triggered.
    #[sea_orm(nullable)]
    pub performed_by: Option<Uuid>,
    #[sea_orm(column_type = "Json", nullable)]
    pub previous_value: Option<Json>,
    #[sea_orm(column_type = "Json", nullable)]
    pub new_value: Option<Json>,
    #[sea_orm(column_type = "Json", nullable)]
    pub metadata: Option<Json>,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id"
    )]
    Order,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

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
    utoipa::ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActionType {
    #[sea_orm(string_value = "status_change")]
    StatusChange,
    #[sea_orm(string_value = "refund")]
    Refund,
    #[sea_orm(string_value = "cancellation")]
    Cancellation,
    #[sea_orm(string_value = "shipment")]
    Shipment,
    #[sea_orm(string_value = "email_sent")]
    EmailSent,
    #[sea_orm(string_value = "note_added")]
    NoteAdded,
    #[sea_orm(string_value = "order_edited")]
    OrderEdited,
    #[sea_orm(string_value = "payment_captured")]
    PaymentCaptured,
}
