//! Shared harness for the integration tests: an in-memory SQLite database
//! behind the full service graph, with fake payment and email adapters that
//! record every call.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ConnectOptions, Database, Set};
use serde_json::json;
use uuid::Uuid;

use storefront_api::{
    app_router,
    auth::Claims,
    config::AppConfig,
    db,
    entities::coupon::{self, DiscountType, Model as CouponModel},
    entities::product_variant::{self, Model as VariantModel},
    errors::ServiceError,
    events,
    services::notifications::{EmailMessage, Mailer},
    services::orders::ShippingAddress,
    services::payments::{
        CreateSessionRequest, GatewaySession, PaymentGateway, RefundOutcome, RefundRequest,
    },
    AppServices, AppState,
};

pub const TEST_JWT_SECRET: &str = "integration-test-secret-0123456789abcdef";

/// Records checkout sessions and refunds instead of calling a processor.
pub struct FakeGateway {
    session_counter: AtomicU64,
    refund_counter: AtomicU64,
    pub sessions: Mutex<Vec<CreateSessionRequest>>,
    pub refunds: Mutex<Vec<RefundRequest>>,
    fail_refunds: AtomicBool,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self {
            session_counter: AtomicU64::new(0),
            refund_counter: AtomicU64::new(0),
            sessions: Mutex::new(Vec::new()),
            refunds: Mutex::new(Vec::new()),
            fail_refunds: AtomicBool::new(false),
        }
    }

    pub fn fail_refunds(&self) {
        self.fail_refunds.store(true, Ordering::SeqCst);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn refund_count(&self) -> usize {
        self.refunds.lock().unwrap().len()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_checkout_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<GatewaySession, ServiceError> {
        let n = self.session_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.sessions.lock().unwrap().push(request);
        Ok(GatewaySession {
            session_id: format!("cs_test_{n}"),
            url: format!("https://pay.example.test/session/cs_test_{n}"),
        })
    }

    async fn create_refund(&self, request: RefundRequest) -> Result<RefundOutcome, ServiceError> {
        if self.fail_refunds.load(Ordering::SeqCst) {
            return Err(ServiceError::PaymentFailed(
                "simulated processor rejection".to_string(),
            ));
        }
        let n = self.refund_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.refunds.lock().unwrap().push(request);
        Ok(RefundOutcome {
            refund_id: format!("re_test_{n}"),
            status: "succeeded".to_string(),
        })
    }
}

/// Captures outbound email instead of sending it.
pub struct FakeMailer {
    pub sent: Mutex<Vec<EmailMessage>>,
}

impl FakeMailer {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.subject.clone())
            .collect()
    }
}

#[async_trait]
impl Mailer for FakeMailer {
    async fn send(&self, message: EmailMessage) -> Result<(), ServiceError> {
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}

pub struct TestApp {
    pub state: AppState,
    pub gateway: Arc<FakeGateway>,
    pub mailer: Arc<FakeMailer>,
}

fn test_config() -> AppConfig {
    AppConfig {
        database_url: "sqlite::memory:".to_string(),
        host: "127.0.0.1".to_string(),
        port: 0,
        environment: "test".to_string(),
        log_level: "warn".to_string(),
        log_json: false,
        auto_schema: true,
        jwt_secret: TEST_JWT_SECRET.to_string(),
        stripe_secret_key: "sk_test_unused".to_string(),
        stripe_webhook_secret: "whsec_test_unused".to_string(),
        webhook_tolerance_secs: 300,
        storefront_base_url: "http://storefront.test".to_string(),
        email_endpoint: String::new(),
        email_from: "orders@storefront.test".to_string(),
        currency: "EUR".to_string(),
        db_max_connections: 1,
    }
}

impl TestApp {
    pub async fn new() -> Self {
        // A single connection keeps the in-memory database alive and shared.
        let mut options = ConnectOptions::new("sqlite::memory:".to_string());
        options
            .max_connections(1)
            .min_connections(1)
            .sqlx_logging(false);
        let pool = Database::connect(options)
            .await
            .expect("in-memory sqlite");
        db::ensure_schema(&pool).await.expect("schema");
        let pool = Arc::new(pool);

        let config = Arc::new(test_config());
        let (event_sender, event_rx) = events::channel(256);
        tokio::spawn(events::process_events(event_rx));

        let gateway = Arc::new(FakeGateway::new());
        let mailer = Arc::new(FakeMailer::new());
        let services = Arc::new(AppServices::with_adapters(
            pool.clone(),
            &config,
            event_sender,
            gateway.clone(),
            mailer.clone(),
        ));

        let state = AppState {
            db: pool,
            config,
            services,
        };

        Self {
            state,
            gateway,
            mailer,
        }
    }

    pub fn router(&self) -> Router {
        app_router(self.state.clone())
    }

    pub async fn seed_variant(&self, sku: &str, price: Decimal, stock: i32) -> VariantModel {
        let now = Utc::now();
        product_variant::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(Uuid::new_v4()),
            sku: Set(sku.to_string()),
            name: Set(format!("Test product {sku}")),
            price: Set(price),
            attributes: Set(json!({ "size": "M" })),
            stock_quantity: Set(stock),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed variant")
    }

    pub async fn seed_coupon(
        &self,
        code: &str,
        discount_type: DiscountType,
        discount_value: Decimal,
        min_order_amount: Decimal,
        max_uses: Option<i32>,
    ) -> CouponModel {
        coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code.to_uppercase()),
            discount_type: Set(discount_type),
            discount_value: Set(discount_value),
            min_order_amount: Set(min_order_amount),
            max_uses: Set(max_uses),
            current_uses: Set(0),
            is_active: Set(true),
            banner_enabled: Set(false),
            created_at: Set(Utc::now()),
            updated_at: Set(None),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed coupon")
    }

    /// Signs an admin bearer token for the authenticated endpoints.
    pub fn admin_token(&self, user_id: Uuid) -> String {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            roles: vec!["admin".to_string()],
            exp: now + 3600,
            iat: now,
        };
        jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(TEST_JWT_SECRET.as_bytes()),
        )
        .expect("sign token")
    }

    pub fn token_with_roles(&self, roles: Vec<String>) -> String {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: Uuid::new_v4().to_string(),
            roles,
            exp: now + 3600,
            iat: now,
        };
        jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(TEST_JWT_SECRET.as_bytes()),
        )
        .expect("sign token")
    }

    /// Lets fire-and-forget tasks (email dispatch) finish before asserting.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

pub fn test_address(email: &str) -> ShippingAddress {
    ShippingAddress {
        full_name: "Ada Example".to_string(),
        street: "1 Test Lane".to_string(),
        city: "Lisbon".to_string(),
        province: "Lisboa".to_string(),
        postal_code: "1000-001".to_string(),
        country: "PT".to_string(),
        email: email.to_string(),
        phone: Some("+351000000000".to_string()),
    }
}

/// Checkout followed by a completed-session webhook: the standard way the
/// tests arrange a paid order.
pub async fn place_paid_order(
    app: &TestApp,
    variant: &VariantModel,
    quantity: i32,
    email: &str,
) -> storefront_api::entities::order::Model {
    use storefront_api::services::checkout::{CheckoutInput, CheckoutItem, CheckoutOutcome};

    let outcome = app
        .state
        .services
        .checkout
        .checkout(CheckoutInput {
            items: vec![CheckoutItem {
                variant_id: variant.id,
                quantity,
            }],
            shipping_address: test_address(email),
            coupon_code: None,
            user_id: None,
        })
        .await
        .expect("checkout");

    let (order, session_id) = match outcome {
        CheckoutOutcome::PaymentRedirect {
            order, session_id, ..
        } => (order, session_id),
        CheckoutOutcome::FreeOrder { .. } => panic!("expected a paid checkout"),
    };

    let event = webhook_event(
        &format!("evt_paid_{}", order.order_number),
        "checkout.session.completed",
        json!({
            "id": session_id,
            "payment_intent": format!("pi_{}", order.order_number),
        }),
    );
    app.state
        .services
        .webhooks
        .process_event(&event)
        .await
        .expect("session completed");

    app.state
        .services
        .orders
        .get_order(order.id)
        .await
        .expect("reload order")
}

/// Builds a processor event envelope the webhook service understands.
pub fn webhook_event(id: &str, event_type: &str, object: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "type": event_type,
        "data": { "object": object }
    })
}
