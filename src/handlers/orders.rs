use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    auth::AdminUser,
    entities::{
        order::{Model as OrderModel, OrderStatus},
        order_activity::Model as ActivityModel,
        order_item::Model as OrderItemModel,
        order_note::{Model as NoteModel, NoteType},
    },
    errors::ServiceError,
    services::admin_actions::{CancelOrder, CancelOutcome, RefundOrder, ShipOrder},
    AppState, ListQuery, PaginatedResponse,
};

/// Resolves an order identifier that may be a UUID or an order number.
async fn resolve_order_id(state: &AppState, id: &str) -> Result<Uuid, ServiceError> {
    if let Ok(uuid) = Uuid::parse_str(id) {
        return Ok(uuid);
    }
    if let Some(order) = state.services.orders.find_by_order_number(id).await? {
        return Ok(order.id);
    }
    Err(ServiceError::NotFound(format!("Order {} not found", id)))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderItemResponse {
    pub id: Uuid,
    pub variant_id: Uuid,
    pub product_name: String,
    pub variant_sku: String,
    pub variant_attributes: Value,
    pub unit_price: Decimal,
    pub quantity: i32,
    pub total_price: Decimal,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderResponse {
    pub id: Uuid,
    pub order_number: String,
    pub status: OrderStatus,
    pub email: String,
    pub subtotal: Decimal,
    pub shipping_cost: Decimal,
    pub tax_amount: Decimal,
    pub discount_amount: Decimal,
    pub total: Decimal,
    pub currency: String,
    pub coupon_code: Option<String>,
    pub stripe_session_id: Option<String>,
    pub stripe_payment_intent: Option<String>,
    pub tracking_number: Option<String>,
    pub carrier: Option<String>,
    pub tracking_url: Option<String>,
    pub shipping_address: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<OrderItemResponse>,
}

fn map_item(model: &OrderItemModel) -> OrderItemResponse {
    OrderItemResponse {
        id: model.id,
        variant_id: model.variant_id,
        product_name: model.product_name.clone(),
        variant_sku: model.variant_sku.clone(),
        variant_attributes: model.variant_attributes.clone(),
        unit_price: model.unit_price,
        quantity: model.quantity,
        total_price: model.total_price,
    }
}

fn map_order(order: &OrderModel, items: &[OrderItemModel]) -> OrderResponse {
    OrderResponse {
        id: order.id,
        order_number: order.order_number.clone(),
        status: order.status,
        email: order.email.clone(),
        subtotal: order.subtotal,
        shipping_cost: order.shipping_cost,
        tax_amount: order.tax_amount,
        discount_amount: order.discount_amount,
        total: order.total,
        currency: order.currency.clone(),
        coupon_code: order.coupon_code.clone(),
        stripe_session_id: order.stripe_session_id.clone(),
        stripe_payment_intent: order.stripe_payment_intent.clone(),
        tracking_number: order.tracking_number.clone(),
        carrier: order.carrier.clone(),
        tracking_url: order.tracking_url.clone(),
        shipping_address: order.shipping_address.clone(),
        created_at: order.created_at,
        updated_at: order.updated_at,
        items: items.iter().map(map_item).collect(),
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct OrderListQuery {
    #[serde(default = "ListQuery::default_page")]
    pub page: u64,
    #[serde(default = "ListQuery::default_limit")]
    pub limit: u64,
    pub status: Option<String>,
}

// GET /api/v1/orders
#[utoipa::path(
    get,
    path = "/api/v1/orders",
    params(
        ("page" = Option<u64>, Query, description = "Page number (1-based)"),
        ("limit" = Option<u64>, Query, description = "Page size"),
        ("status" = Option<String>, Query, description = "Filter by order status")
    ),
    responses(
        (status = 200, description = "Orders listed", body = PaginatedResponse<OrderResponse>),
        (status = 401, description = "Missing or invalid token", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn list_orders(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(query): Query<OrderListQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let status = query
        .status
        .as_deref()
        .map(|s| {
            OrderStatus::from_str(&s.to_ascii_lowercase())
                .map_err(|_| ServiceError::ValidationError(format!("Unknown order status: {s}")))
        })
        .transpose()?;

    let (orders, total) = state
        .services
        .orders
        .list_orders(query.page, query.limit, status)
        .await?;

    let data: Vec<OrderResponse> = orders.iter().map(|o| map_order(o, &[])).collect();
    Ok(Json(PaginatedResponse {
        data,
        total,
        page: query.page,
        per_page: query.limit,
    }))
}

// GET /api/v1/orders/{id}
#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    params(("id" = String, Path, description = "Order id or order number")),
    responses(
        (status = 200, description = "Order detail", body = OrderResponse),
        (status = 404, description = "No such order", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let order_id = resolve_order_id(&state, &id).await?;
    let order = state.services.orders.get_order(order_id).await?;
    let items = state.services.orders.get_order_items(order_id).await?;
    Ok(Json(map_order(&order, &items)))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateStatusRequest {
    pub status: String,
}

// PATCH /api/v1/orders/{id}/status
#[utoipa::path(
    patch,
    path = "/api/v1/orders/{id}/status",
    params(("id" = String, Path, description = "Order id or order number")),
    request_body = UpdateStatusRequest,
    responses(
        (status = 200, description = "Status updated", body = OrderResponse),
        (status = 400, description = "Unknown status", body = crate::errors::ErrorResponse),
        (status = 409, description = "Illegal transition", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn update_status(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(id): Path<String>,
    Json(request): Json<UpdateStatusRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let order_id = resolve_order_id(&state, &id).await?;
    let target = OrderStatus::from_str(&request.status.to_ascii_lowercase()).map_err(|_| {
        ServiceError::ValidationError(format!("Unknown order status: {}", request.status))
    })?;

    // Any status with a legal edge to the target is an acceptable source;
    // the ledger still applies the write conditionally.
    let allowed_from: Vec<OrderStatus> = [
        OrderStatus::Pending,
        OrderStatus::Paid,
        OrderStatus::Processing,
        OrderStatus::Shipped,
        OrderStatus::Delivered,
        OrderStatus::Cancelled,
        OrderStatus::Refunded,
    ]
    .into_iter()
    .filter(|from| *from != target && from.can_transition_to(target))
    .collect();

    let transition = state
        .services
        .orders
        .transition(order_id, &allowed_from, target, Some(admin.user_id), None)
        .await?;
    let order = transition.order().clone();
    Ok(Json(map_order(&order, &[])))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CancelRequest {
    pub reason: String,
    #[serde(default)]
    pub notify_customer: bool,
    #[serde(default)]
    pub refund: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CancelResponse {
    pub order: OrderResponse,
    /// False when the order was cancelled but the refund failed upstream.
    pub refund_succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_error: Option<String>,
    pub message: String,
}

// POST /api/v1/orders/{id}/cancel
#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/cancel",
    params(("id" = String, Path, description = "Order id or order number")),
    request_body = CancelRequest,
    responses(
        (status = 200, description = "Order cancelled (refund outcome reported separately)", body = CancelResponse),
        (status = 400, description = "Missing reason", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order cannot be cancelled", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn cancel_order(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(id): Path<String>,
    Json(request): Json<CancelRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let order_id = resolve_order_id(&state, &id).await?;
    let outcome = state
        .services
        .admin
        .cancel(
            order_id,
            admin.user_id,
            CancelOrder {
                reason: request.reason,
                notify_customer: request.notify_customer,
                refund: request.refund,
            },
        )
        .await?;

    let response = match outcome {
        CancelOutcome::Cancelled { order } => CancelResponse {
            order: map_order(&order, &[]),
            refund_succeeded: true,
            refund_error: None,
            message: "Order cancelled".to_string(),
        },
        CancelOutcome::CancelledRefundFailed {
            order,
            refund_error,
        } => CancelResponse {
            order: map_order(&order, &[]),
            refund_succeeded: false,
            message: format!(
                "Order cancelled but refund failed: {refund_error}. Manual follow-up required."
            ),
            refund_error: Some(refund_error),
        },
    };

    Ok(Json(response))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ShipRequest {
    pub carrier: String,
    pub tracking_number: String,
    pub tracking_url: Option<String>,
}

// POST /api/v1/orders/{id}/ship
#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/ship",
    params(("id" = String, Path, description = "Order id or order number")),
    request_body = ShipRequest,
    responses(
        (status = 200, description = "Order shipped", body = OrderResponse),
        (status = 400, description = "Missing carrier or tracking number", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order is not in a shippable status", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn ship_order(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(id): Path<String>,
    Json(request): Json<ShipRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let order_id = resolve_order_id(&state, &id).await?;
    let order = state
        .services
        .admin
        .ship(
            order_id,
            admin.user_id,
            ShipOrder {
                carrier: request.carrier,
                tracking_number: request.tracking_number,
                tracking_url: request.tracking_url,
            },
        )
        .await?;
    Ok(Json(map_order(&order, &[])))
}

// POST /api/v1/orders/{id}/deliver
#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/deliver",
    params(("id" = String, Path, description = "Order id or order number")),
    responses(
        (status = 200, description = "Order marked delivered", body = OrderResponse),
        (status = 409, description = "Order is not shipped", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn deliver_order(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let order_id = resolve_order_id(&state, &id).await?;
    let order = state
        .services
        .admin
        .mark_delivered(order_id, admin.user_id)
        .await?;
    Ok(Json(map_order(&order, &[])))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RefundApiRequest {
    /// Omitted for a full refund.
    pub amount: Option<Decimal>,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RefundResponse {
    pub order: OrderResponse,
    pub refund_id: String,
    pub amount: Decimal,
    pub partial: bool,
}

// POST /api/v1/orders/{id}/refund
#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/refund",
    params(("id" = String, Path, description = "Order id or order number")),
    request_body = RefundApiRequest,
    responses(
        (status = 200, description = "Refund created", body = RefundResponse),
        (status = 400, description = "Refund amount exceeds order total", body = crate::errors::ErrorResponse),
        (status = 402, description = "Processor rejected the refund", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order has no refundable payment", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn refund_order(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(id): Path<String>,
    Json(request): Json<RefundApiRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let order_id = resolve_order_id(&state, &id).await?;
    let result = state
        .services
        .admin
        .refund(
            order_id,
            admin.user_id,
            RefundOrder {
                amount: request.amount,
                reason: request.reason,
            },
        )
        .await?;

    Ok(Json(RefundResponse {
        order: map_order(&result.order, &[]),
        refund_id: result.refund_id,
        amount: result.amount,
        partial: result.partial,
    }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateNoteRequest {
    pub note_type: NoteType,
    pub content: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct NoteResponse {
    pub id: Uuid,
    pub order_id: Uuid,
    pub created_by: Uuid,
    pub note_type: NoteType,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

fn map_note(model: &NoteModel) -> NoteResponse {
    NoteResponse {
        id: model.id,
        order_id: model.order_id,
        created_by: model.created_by,
        note_type: model.note_type,
        content: model.content.clone(),
        created_at: model.created_at,
    }
}

// POST /api/v1/orders/{id}/notes
#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/notes",
    params(("id" = String, Path, description = "Order id or order number")),
    request_body = CreateNoteRequest,
    responses(
        (status = 201, description = "Note added", body = NoteResponse),
        (status = 400, description = "Empty note", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn add_note(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(id): Path<String>,
    Json(request): Json<CreateNoteRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let order_id = resolve_order_id(&state, &id).await?;
    let note = state
        .services
        .orders
        .add_note(order_id, admin.user_id, request.note_type, request.content)
        .await?;

    if note.note_type == NoteType::Customer {
        let order = state.services.orders.get_order(order_id).await?;
        state
            .services
            .notifications
            .send_customer_note(&order, &note.content);
    }

    Ok((StatusCode::CREATED, Json(map_note(&note))))
}

// GET /api/v1/orders/{id}/notes
#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}/notes",
    params(("id" = String, Path, description = "Order id or order number")),
    responses((status = 200, description = "Notes, newest first", body = [NoteResponse])),
    tag = "Orders"
)]
pub async fn list_notes(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let order_id = resolve_order_id(&state, &id).await?;
    let notes = state.services.orders.list_notes(order_id).await?;
    Ok(Json(notes.iter().map(map_note).collect::<Vec<_>>()))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ActivityResponse {
    pub id: Uuid,
    pub action_type: String,
    pub performed_by: Option<Uuid>,
    pub previous_value: Option<Value>,
    pub new_value: Option<Value>,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

fn map_activity(model: &ActivityModel) -> ActivityResponse {
    ActivityResponse {
        id: model.id,
        action_type: model.action_type.to_string(),
        performed_by: model.performed_by,
        previous_value: model.previous_value.clone(),
        new_value: model.new_value.clone(),
        metadata: model.metadata.clone(),
        created_at: model.created_at,
    }
}

// GET /api/v1/orders/{id}/activity
#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}/activity",
    params(("id" = String, Path, description = "Order id or order number")),
    responses((status = 200, description = "Activity trail, newest first", body = [ActivityResponse])),
    tag = "Orders"
)]
pub async fn list_activity(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let order_id = resolve_order_id(&state, &id).await?;
    let activity = state.services.orders.list_activity(order_id).await?;
    Ok(Json(activity.iter().map(map_activity).collect::<Vec<_>>()))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LookupQuery {
    pub order_number: String,
    pub email: String,
}

/// Customer-facing order status: only what the status page shows.
#[derive(Debug, Serialize, ToSchema)]
pub struct OrderStatusResponse {
    pub order_number: String,
    pub status: OrderStatus,
    pub total: Decimal,
    pub currency: String,
    pub tracking_number: Option<String>,
    pub carrier: Option<String>,
    pub tracking_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub items: Vec<OrderItemResponse>,
}

// GET /api/v1/orders/lookup
#[utoipa::path(
    get,
    path = "/api/v1/orders/lookup",
    params(
        ("order_number" = String, Query, description = "Order number from the confirmation email"),
        ("email" = String, Query, description = "Email the order was placed with")
    ),
    responses(
        (status = 200, description = "Order status", body = OrderStatusResponse),
        (status = 404, description = "No matching order", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn lookup_order(
    State(state): State<AppState>,
    Query(query): Query<LookupQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let (order, items) = state
        .services
        .orders
        .customer_lookup(&query.order_number, &query.email)
        .await?;

    Ok(Json(OrderStatusResponse {
        order_number: order.order_number,
        status: order.status,
        total: order.total,
        currency: order.currency,
        tracking_number: order.tracking_number,
        carrier: order.carrier,
        tracking_url: order.tracking_url,
        created_at: order.created_at,
        items: items.iter().map(map_item).collect(),
    }))
}
