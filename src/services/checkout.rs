use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::order::{Model as OrderModel, OrderStatus},
    entities::order_activity::ActionType,
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        catalog::CatalogService,
        coupons::CouponService,
        notifications::NotificationService,
        orders::{CreateOrder, NewOrderItem, OrderService, ShippingAddress},
        payments::{CreateSessionRequest, PaymentGateway, SessionLineItem},
        pricing::{self, CartLine},
    },
};

const ORDER_NUMBER_PREFIX: &str = "SWL";
const BASE36: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// A finalized cart line handed over by the (external) cart at checkout time.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct CheckoutItem {
    pub variant_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone)]
pub struct CheckoutInput {
    pub items: Vec<CheckoutItem>,
    pub shipping_address: ShippingAddress,
    pub coupon_code: Option<String>,
    pub user_id: Option<Uuid>,
}

/// What the caller does next after checkout.
#[derive(Debug)]
pub enum CheckoutOutcome {
    /// Zero-total order created directly as paid; redirect straight to the
    /// confirmation view.
    FreeOrder { order: OrderModel },
    /// Pending order awaiting payment; redirect to the processor's hosted
    /// payment page.
    PaymentRedirect {
        order: OrderModel,
        session_id: String,
        url: String,
    },
}

#[derive(Clone)]
pub struct CheckoutService {
    orders: Arc<OrderService>,
    catalog: Arc<CatalogService>,
    coupons: Arc<CouponService>,
    gateway: Arc<dyn PaymentGateway>,
    notifications: Arc<NotificationService>,
    event_sender: EventSender,
    currency: String,
    storefront_base_url: String,
}

impl CheckoutService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        orders: Arc<OrderService>,
        catalog: Arc<CatalogService>,
        coupons: Arc<CouponService>,
        gateway: Arc<dyn PaymentGateway>,
        notifications: Arc<NotificationService>,
        event_sender: EventSender,
        currency: String,
        storefront_base_url: String,
    ) -> Self {
        Self {
            orders,
            catalog,
            coupons,
            gateway,
            notifications,
            event_sender,
            currency,
            storefront_base_url,
        }
    }

    /// Runs the checkout workflow for a finalized cart.
    #[instrument(skip(self, input), fields(items = input.items.len()))]
    pub async fn checkout(&self, input: CheckoutInput) -> Result<CheckoutOutcome, ServiceError> {
        if input.items.is_empty() {
            return Err(ServiceError::ValidationError(
                "Cart is empty".to_string(),
            ));
        }
        input.shipping_address.validate()?;
        if input.items.iter().any(|item| item.quantity <= 0) {
            return Err(ServiceError::ValidationError(
                "Item quantities must be positive".to_string(),
            ));
        }

        // Snapshot the variants in one batch read; the order items must stay
        // stable even if the catalog is edited later.
        let variant_ids: Vec<Uuid> = input.items.iter().map(|item| item.variant_id).collect();
        let variants: HashMap<Uuid, _> = self
            .catalog
            .get_variants(&variant_ids)
            .await?
            .into_iter()
            .map(|variant| (variant.id, variant))
            .collect();

        let mut order_items = Vec::with_capacity(input.items.len());
        for item in &input.items {
            let variant = variants.get(&item.variant_id).ok_or_else(|| {
                ServiceError::ValidationError(format!(
                    "Cart references an unknown product variant ({})",
                    item.variant_id
                ))
            })?;
            if variant.stock_quantity < item.quantity {
                return Err(ServiceError::ValidationError(format!(
                    "Insufficient stock for {} ({} available)",
                    variant.name, variant.stock_quantity
                )));
            }
            order_items.push(NewOrderItem {
                variant_id: variant.id,
                product_name: variant.name.clone(),
                variant_sku: variant.sku.clone(),
                variant_attributes: variant.attributes.clone(),
                unit_price: variant.price,
                quantity: item.quantity,
            });
        }

        let coupon = match input.coupon_code.as_deref() {
            Some(code) => Some(self.coupons.find_active(code).await?.ok_or_else(|| {
                ServiceError::ValidationError(format!("Coupon {} is not valid", code))
            })?),
            None => None,
        };

        let lines: Vec<CartLine> = order_items
            .iter()
            .map(|item| CartLine {
                unit_price: item.unit_price,
                quantity: item.quantity,
            })
            .collect();
        let breakdown = pricing::price_cart(&lines, coupon.as_ref())?;

        let order_number = generate_order_number();

        if breakdown.is_free_order() {
            return self
                .create_free_order(input, order_items, coupon, breakdown, order_number)
                .await;
        }

        // Paid flow: create the processor session first so the pending order
        // carries the session id from the start. If the order insert fails
        // afterwards, the webhook reconstructs it from the session metadata.
        let metadata = session_metadata(&order_number, &input, &order_items, &breakdown, coupon.as_ref());
        let mut line_items: Vec<SessionLineItem> = order_items
            .iter()
            .map(|item| SessionLineItem {
                name: item.product_name.clone(),
                amount_cents: pricing::decimal_to_cents(item.unit_price),
                quantity: item.quantity,
            })
            .collect();
        if breakdown.shipping_cents > 0 {
            line_items.push(SessionLineItem {
                name: "Shipping".to_string(),
                amount_cents: breakdown.shipping_cents,
                quantity: 1,
            });
        }

        let session = self
            .gateway
            .create_checkout_session(CreateSessionRequest {
                line_items,
                currency: self.currency.clone(),
                discount_cents: breakdown.discount_cents,
                customer_email: input.shipping_address.email.clone(),
                success_url: format!(
                    "{}/order-confirmation?session_id={{CHECKOUT_SESSION_ID}}",
                    self.storefront_base_url
                ),
                cancel_url: format!("{}/cart", self.storefront_base_url),
                metadata,
            })
            .await?;

        let order = self
            .orders
            .create_order(CreateOrder {
                order_number: order_number.clone(),
                user_id: input.user_id,
                email: input.shipping_address.email.clone(),
                status: OrderStatus::Pending,
                subtotal: breakdown.subtotal(),
                shipping_cost: breakdown.shipping(),
                tax_amount: rust_decimal::Decimal::ZERO,
                discount_amount: breakdown.discount(),
                total: breakdown.total(),
                currency: self.currency.clone(),
                coupon_id: coupon.as_ref().map(|c| c.id),
                coupon_code: coupon.as_ref().map(|c| c.code.clone()),
                stripe_session_id: Some(session.session_id.clone()),
                shipping_address: input.shipping_address,
                items: order_items,
            })
            .await?;

        info!(order_number = %order_number, session_id = %session.session_id, "Checkout session created");

        Ok(CheckoutOutcome::PaymentRedirect {
            order,
            session_id: session.session_id,
            url: session.url,
        })
    }

    /// 100%-discount path: no processor session; the order is paid on the
    /// spot, the coupon use is recorded, stock is decremented and the
    /// confirmation email goes out immediately.
    async fn create_free_order(
        &self,
        input: CheckoutInput,
        order_items: Vec<NewOrderItem>,
        coupon: Option<crate::entities::coupon::Model>,
        breakdown: pricing::PricingBreakdown,
        order_number: String,
    ) -> Result<CheckoutOutcome, ServiceError> {
        let order = self
            .orders
            .create_order(CreateOrder {
                order_number: order_number.clone(),
                user_id: input.user_id,
                email: input.shipping_address.email.clone(),
                status: OrderStatus::Paid,
                subtotal: breakdown.subtotal(),
                shipping_cost: breakdown.shipping(),
                tax_amount: rust_decimal::Decimal::ZERO,
                discount_amount: breakdown.discount(),
                total: breakdown.total(),
                currency: self.currency.clone(),
                coupon_id: coupon.as_ref().map(|c| c.id),
                coupon_code: coupon.as_ref().map(|c| c.code.clone()),
                stripe_session_id: None,
                shipping_address: input.shipping_address,
                items: order_items,
            })
            .await?;

        if let Some(coupon) = &coupon {
            self.coupons.redeem(coupon.id).await?;
            self.event_sender
                .send(Event::CouponRedeemed {
                    coupon_id: coupon.id,
                    order_id: order.id,
                })
                .await;
        }

        // Stock and email mirror the webhook's paid handling; a free order
        // must not behave differently from a paid one past this point.
        let items = self.orders.get_order_items(order.id).await?;
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

        self.orders
            .log_activity(
                order.id,
                ActionType::PaymentCaptured,
                None,
                None,
                Some(json!({ "free_order": true, "total": "0.00" })),
                coupon.as_ref().map(|c| json!({ "coupon_code": c.code })),
            )
            .await;

        info!(order_number = %order_number, "Free order created as paid");
        Ok(CheckoutOutcome::FreeOrder { order })
    }
}

/// Generates a human-readable order number: `SWL-{base36 timestamp}-{4
/// random base36 chars}`, uppercased. The timestamp is nanosecond-resolution
/// so back-to-back checkouts get distinct prefixes; uniqueness is
/// probabilistic, not guaranteed, and a collision would surface as a
/// unique-constraint error on insert.
pub fn generate_order_number() -> String {
    let now = chrono::Utc::now();
    let ticks = now
        .timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_micros())
        .unsigned_abs();
    let mut rng = rand::thread_rng();
    let suffix: String = (0..4)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("{}-{}-{}", ORDER_NUMBER_PREFIX, to_base36(ticks), suffix)
}

fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(BASE36[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 alphabet is ascii")
}

fn session_metadata(
    order_number: &str,
    input: &CheckoutInput,
    items: &[NewOrderItem],
    breakdown: &pricing::PricingBreakdown,
    coupon: Option<&crate::entities::coupon::Model>,
) -> serde_json::Value {
    json!({
        "order_number": order_number,
        "email": input.shipping_address.email,
        "user_id": input.user_id.map(|id| id.to_string()).unwrap_or_default(),
        "shipping_address": serde_json::to_string(&input.shipping_address).unwrap_or_default(),
        "items": serde_json::to_string(items).unwrap_or_default(),
        "subtotal_cents": breakdown.subtotal_cents,
        "shipping_cents": breakdown.shipping_cents,
        "discount_cents": breakdown.discount_cents,
        "total_cents": breakdown.total_cents,
        "coupon_id": coupon.map(|c| c.id.to_string()).unwrap_or_default(),
        "coupon_code": coupon.map(|c| c.code.clone()).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn order_numbers_carry_prefix_and_shape() {
        let number = generate_order_number();
        let parts: Vec<&str> = number.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "SWL");
        assert_eq!(parts[2].len(), 4);
        assert!(number
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-'));
    }

    #[test]
    fn ten_thousand_order_numbers_do_not_collide() {
        let numbers: HashSet<String> = (0..10_000).map(|_| generate_order_number()).collect();
        assert_eq!(numbers.len(), 10_000);
    }

    #[test]
    fn base36_round_trip_samples() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "Z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(36 * 36 + 1), "101");
    }
}
