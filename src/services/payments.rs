//! Payment processor boundary.
//!
//! The order core talks to the processor through the [`PaymentGateway`]
//! trait; [`StripeGateway`] is the production implementation over Stripe's
//! form-encoded HTTP API.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info, instrument};

use crate::errors::ServiceError;

const STRIPE_API_BASE: &str = "https://api.stripe.com/v1";

/// One line presented on the processor's hosted payment page, priced in
/// minor units. Non-free shipping is passed as a synthetic line item.
#[derive(Debug, Clone)]
pub struct SessionLineItem {
    pub name: String,
    pub amount_cents: i64,
    pub quantity: i32,
}

#[derive(Debug, Clone)]
pub struct CreateSessionRequest {
    pub line_items: Vec<SessionLineItem>,
    pub currency: String,
    /// A positive discount creates a one-time processor coupon applied to
    /// the session.
    pub discount_cents: i64,
    pub customer_email: String,
    pub success_url: String,
    pub cancel_url: String,
    /// Echoed back in webhook events; carries the order snapshot used by
    /// the fallback-reconstruction path.
    pub metadata: Value,
}

#[derive(Debug, Clone)]
pub struct GatewaySession {
    pub session_id: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub payment_intent: String,
    /// None refunds the full captured amount.
    pub amount_cents: Option<i64>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RefundOutcome {
    pub refund_id: String,
    pub status: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Creates a hosted checkout session and returns its id and redirect URL.
    async fn create_checkout_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<GatewaySession, ServiceError>;

    /// Creates a refund against a captured payment intent.
    async fn create_refund(&self, request: RefundRequest) -> Result<RefundOutcome, ServiceError>;
}

#[derive(Clone)]
pub struct StripeGateway {
    client: reqwest::Client,
    secret_key: String,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct StripeSession {
    id: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct StripeCoupon {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StripeRefund {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    message: Option<String>,
}

impl StripeGateway {
    pub fn new(secret_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            secret_key,
            api_base: STRIPE_API_BASE.to_string(),
        }
    }

    /// Overrides the API base URL; used to point at a local stub.
    pub fn with_api_base(mut self, api_base: String) -> Self {
        self.api_base = api_base;
        self
    }

    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        form: &[(String, String)],
    ) -> Result<T, ServiceError> {
        let url = format!("{}{}", self.api_base, path);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.secret_key, None::<&str>)
            .form(form)
            .send()
            .await
            .map_err(|e| {
                error!("Stripe request to {} failed: {}", path, e);
                ServiceError::ExternalServiceError(format!("payment processor unreachable: {e}"))
            })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| {
            ServiceError::ExternalServiceError(format!("payment processor response error: {e}"))
        })?;

        if !status.is_success() {
            let detail = serde_json::from_slice::<StripeErrorBody>(&body)
                .ok()
                .and_then(|b| b.error.message)
                .unwrap_or_else(|| format!("HTTP {status}"));
            error!("Stripe call {} rejected: {}", path, detail);
            return Err(ServiceError::PaymentFailed(detail));
        }

        serde_json::from_slice(&body).map_err(|e| {
            ServiceError::ExternalServiceError(format!(
                "unexpected payment processor response: {e}"
            ))
        })
    }

    /// Creates a one-time amount-off coupon in the processor, used to carry
    /// our discount onto the hosted session.
    async fn create_session_coupon(
        &self,
        amount_cents: i64,
        currency: &str,
    ) -> Result<String, ServiceError> {
        let form = vec![
            ("amount_off".to_string(), amount_cents.to_string()),
            ("currency".to_string(), currency.to_lowercase()),
            ("duration".to_string(), "once".to_string()),
        ];
        let coupon: StripeCoupon = self.post_form("/coupons", &form).await?;
        Ok(coupon.id)
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    #[instrument(skip(self, request), fields(lines = request.line_items.len()))]
    async fn create_checkout_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<GatewaySession, ServiceError> {
        let mut form: Vec<(String, String)> = vec![
            ("mode".to_string(), "payment".to_string()),
            ("success_url".to_string(), request.success_url.clone()),
            ("cancel_url".to_string(), request.cancel_url.clone()),
            ("customer_email".to_string(), request.customer_email.clone()),
        ];

        for (i, item) in request.line_items.iter().enumerate() {
            let prefix = format!("line_items[{i}]");
            form.push((
                format!("{prefix}[price_data][currency]"),
                request.currency.to_lowercase(),
            ));
            form.push((
                format!("{prefix}[price_data][unit_amount]"),
                item.amount_cents.to_string(),
            ));
            form.push((
                format!("{prefix}[price_data][product_data][name]"),
                item.name.clone(),
            ));
            form.push((format!("{prefix}[quantity]"), item.quantity.to_string()));
        }

        if request.discount_cents > 0 {
            let coupon_id = self
                .create_session_coupon(request.discount_cents, &request.currency)
                .await?;
            form.push(("discounts[0][coupon]".to_string(), coupon_id));
        }

        if let Some(metadata) = request.metadata.as_object() {
            for (key, value) in metadata {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                form.push((format!("metadata[{key}]"), rendered));
            }
        }

        let session: StripeSession = self.post_form("/checkout/sessions", &form).await?;
        info!("Created checkout session {}", session.id);

        Ok(GatewaySession {
            session_id: session.id,
            url: session.url,
        })
    }

    #[instrument(skip(self, request), fields(payment_intent = %request.payment_intent))]
    async fn create_refund(&self, request: RefundRequest) -> Result<RefundOutcome, ServiceError> {
        let mut form: Vec<(String, String)> = vec![(
            "payment_intent".to_string(),
            request.payment_intent.clone(),
        )];
        if let Some(amount) = request.amount_cents {
            form.push(("amount".to_string(), amount.to_string()));
        }
        if let Some(reason) = &request.reason {
            // Stripe only accepts a fixed reason vocabulary; free-form text
            // goes into metadata instead.
            form.push(("metadata[reason]".to_string(), reason.clone()));
        }

        let refund: StripeRefund = self.post_form("/refunds", &form).await?;
        info!("Created refund {} ({})", refund.id, refund.status);

        Ok(RefundOutcome {
            refund_id: refund.id,
            status: refund.status,
        })
    }
}
