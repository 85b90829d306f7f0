use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    errors::ServiceError,
    services::checkout::{CheckoutInput, CheckoutItem, CheckoutOutcome},
    services::orders::ShippingAddress,
    AppState,
};

#[derive(Debug, Deserialize, ToSchema)]
pub struct CheckoutRequest {
    pub items: Vec<CheckoutItem>,
    pub shipping_address: ShippingAddress,
    pub coupon_code: Option<String>,
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CheckoutResponse {
    /// Zero-total order; go straight to the confirmation page.
    FreeOrder {
        order_number: String,
        redirect_url: String,
    },
    /// Redirect the customer to the processor's hosted payment page.
    PaymentRedirect {
        order_number: String,
        session_id: String,
        redirect_url: String,
    },
}

// POST /api/v1/checkout
#[utoipa::path(
    post,
    path = "/api/v1/checkout",
    request_body = CheckoutRequest,
    responses(
        (status = 201, description = "Checkout started", body = CheckoutResponse),
        (status = 400, description = "Empty cart, invalid address or invalid coupon", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment processor unavailable", body = crate::errors::ErrorResponse)
    ),
    tag = "Checkout"
)]
pub async fn checkout(
    State(state): State<AppState>,
    Json(request): Json<CheckoutRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let outcome = state
        .services
        .checkout
        .checkout(CheckoutInput {
            items: request.items,
            shipping_address: request.shipping_address,
            coupon_code: request.coupon_code,
            user_id: request.user_id,
        })
        .await?;

    let response = match outcome {
        CheckoutOutcome::FreeOrder { order } => CheckoutResponse::FreeOrder {
            redirect_url: format!(
                "{}/order-confirmation?order={}",
                state.config.storefront_base_url, order.order_number
            ),
            order_number: order.order_number,
        },
        CheckoutOutcome::PaymentRedirect {
            order,
            session_id,
            url,
        } => CheckoutResponse::PaymentRedirect {
            order_number: order.order_number,
            session_id,
            redirect_url: url,
        },
    };

    Ok((StatusCode::CREATED, Json(response)))
}
