pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod services;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, patch, post},
    Router,
};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::CorsLayer,
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use crate::config::AppConfig;
use crate::events::EventSender;
use crate::services::{
    admin_actions::AdminOrderService,
    catalog::CatalogService,
    checkout::CheckoutService,
    coupons::CouponService,
    notifications::{HttpMailer, Mailer, NotificationService, NullMailer},
    orders::OrderService,
    payments::{PaymentGateway, StripeGateway},
    webhooks::WebhookService,
};

/// Everything the handlers need, cheap to clone per request.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<AppConfig>,
    pub services: Arc<AppServices>,
}

pub struct AppServices {
    pub orders: Arc<OrderService>,
    pub catalog: Arc<CatalogService>,
    pub coupons: Arc<CouponService>,
    pub checkout: Arc<CheckoutService>,
    pub webhooks: Arc<WebhookService>,
    pub admin: Arc<AdminOrderService>,
    pub notifications: Arc<NotificationService>,
}

impl AppServices {
    /// Wires the full service graph against a live processor gateway and
    /// the configured mailer.
    pub fn build(db: Arc<DatabaseConnection>, config: &AppConfig, events: EventSender) -> Self {
        let gateway: Arc<dyn PaymentGateway> =
            Arc::new(StripeGateway::new(config.stripe_secret_key.clone()));
        let mailer: Arc<dyn Mailer> = if config.email_endpoint.is_empty() {
            Arc::new(NullMailer)
        } else {
            Arc::new(HttpMailer::new(
                config.email_endpoint.clone(),
                config.email_from.clone(),
            ))
        };
        Self::with_adapters(db, config, events, gateway, mailer)
    }

    /// Same graph with caller-supplied gateway and mailer. Tests use this to
    /// swap in fakes.
    pub fn with_adapters(
        db: Arc<DatabaseConnection>,
        config: &AppConfig,
        events: EventSender,
        gateway: Arc<dyn PaymentGateway>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        let orders = Arc::new(OrderService::new(db.clone(), events.clone()));
        let catalog = Arc::new(CatalogService::new(db.clone(), events.clone()));
        let coupons = Arc::new(CouponService::new(db.clone()));
        let notifications = Arc::new(NotificationService::new(db.clone(), mailer));

        let checkout = Arc::new(CheckoutService::new(
            orders.clone(),
            catalog.clone(),
            coupons.clone(),
            gateway.clone(),
            notifications.clone(),
            events.clone(),
            config.currency.clone(),
            config.storefront_base_url.clone(),
        ));
        let webhooks = Arc::new(WebhookService::new(
            db,
            orders.clone(),
            catalog.clone(),
            coupons.clone(),
            notifications.clone(),
            events.clone(),
            config.currency.clone(),
        ));
        let admin = Arc::new(AdminOrderService::new(
            orders.clone(),
            gateway,
            notifications.clone(),
            events,
        ));

        Self {
            orders,
            catalog,
            coupons,
            checkout,
            webhooks,
            admin,
            notifications,
        }
    }
}

/// Pagination defaults shared by list endpoints.
#[derive(Debug, Clone, Copy, Deserialize, ToSchema)]
pub struct ListQuery {
    #[serde(default = "ListQuery::default_page")]
    pub page: u64,
    #[serde(default = "ListQuery::default_limit")]
    pub limit: u64,
}

impl ListQuery {
    pub fn default_page() -> u64 {
        1
    }

    pub fn default_limit() -> u64 {
        20
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health::health_check,
        handlers::checkout::checkout,
        handlers::orders::lookup_order,
        handlers::orders::list_orders,
        handlers::orders::get_order,
        handlers::orders::update_status,
        handlers::orders::cancel_order,
        handlers::orders::ship_order,
        handlers::orders::deliver_order,
        handlers::orders::refund_order,
        handlers::orders::add_note,
        handlers::orders::list_notes,
        handlers::orders::list_activity,
    ),
    components(schemas(
        errors::ErrorResponse,
        entities::order::OrderStatus,
        entities::order_note::NoteType,
        services::checkout::CheckoutItem,
        services::orders::ShippingAddress,
        handlers::health::HealthResponse,
        handlers::checkout::CheckoutRequest,
        handlers::checkout::CheckoutResponse,
        handlers::orders::OrderResponse,
        handlers::orders::OrderItemResponse,
        handlers::orders::OrderStatusResponse,
        handlers::orders::UpdateStatusRequest,
        handlers::orders::CancelRequest,
        handlers::orders::CancelResponse,
        handlers::orders::ShipRequest,
        handlers::orders::RefundApiRequest,
        handlers::orders::RefundResponse,
        handlers::orders::CreateNoteRequest,
        handlers::orders::NoteResponse,
        handlers::orders::ActivityResponse,
    )),
    tags(
        (name = "Checkout", description = "Cart checkout and payment sessions"),
        (name = "Orders", description = "Order management and customer lookup"),
        (name = "Health", description = "Service health")
    )
)]
pub struct ApiDoc;

pub fn app_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/checkout", post(handlers::checkout::checkout))
        .route(
            "/payments/webhook",
            post(handlers::payment_webhooks::payment_webhook),
        )
        .route("/orders/lookup", get(handlers::orders::lookup_order))
        .route("/orders", get(handlers::orders::list_orders))
        .route("/orders/:id", get(handlers::orders::get_order))
        .route(
            "/orders/:id/status",
            patch(handlers::orders::update_status),
        )
        .route("/orders/:id/cancel", post(handlers::orders::cancel_order))
        .route("/orders/:id/ship", post(handlers::orders::ship_order))
        .route(
            "/orders/:id/deliver",
            post(handlers::orders::deliver_order),
        )
        .route("/orders/:id/refund", post(handlers::orders::refund_order))
        .route(
            "/orders/:id/notes",
            post(handlers::orders::add_note).get(handlers::orders::list_notes),
        )
        .route(
            "/orders/:id/activity",
            get(handlers::orders::list_activity),
        );

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .nest("/api/v1", api)
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .with_state(state)
}
