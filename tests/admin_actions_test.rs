//! Staff actions on the order ledger: shipping, delivery, cancellation and
//! refunds, including the processor-failure and webhook-race edges.

mod common;

use assert_matches::assert_matches;
use common::{place_paid_order, webhook_event, TestApp};
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;

use storefront_api::{
    entities::order::OrderStatus,
    errors::ServiceError,
    services::admin_actions::{CancelOrder, CancelOutcome, RefundOrder, ShipOrder},
};

fn ship_request() -> ShipOrder {
    ShipOrder {
        carrier: "CTT".to_string(),
        tracking_number: "RR123456789PT".to_string(),
        tracking_url: Some("https://track.example.test/RR123456789PT".to_string()),
    }
}

#[tokio::test]
async fn paid_order_ships_then_delivers() {
    let app = TestApp::new().await;
    let admin = Uuid::new_v4();
    let variant = app.seed_variant("HOODIE-GRY", dec!(55.00), 4).await;
    let order = place_paid_order(&app, &variant, 1, "ship@example.com").await;

    let shipped = app
        .state
        .services
        .admin
        .ship(order.id, admin, ship_request())
        .await
        .expect("ship");
    app.settle().await;

    assert_eq!(shipped.status, OrderStatus::Shipped);
    assert_eq!(shipped.carrier.as_deref(), Some("CTT"));
    assert_eq!(shipped.tracking_number.as_deref(), Some("RR123456789PT"));
    // Confirmation on payment plus the shipping notice.
    assert_eq!(app.mailer.count(), 2);

    let delivered = app
        .state
        .services
        .admin
        .mark_delivered(order.id, admin)
        .await
        .expect("deliver");
    assert_eq!(delivered.status, OrderStatus::Delivered);
}

#[tokio::test]
async fn shipping_twice_conflicts() {
    let app = TestApp::new().await;
    let admin = Uuid::new_v4();
    let variant = app.seed_variant("HOODIE-BLK", dec!(55.00), 4).await;
    let order = place_paid_order(&app, &variant, 1, "ship@example.com").await;

    app.state
        .services
        .admin
        .ship(order.id, admin, ship_request())
        .await
        .expect("first ship");
    let err = app
        .state
        .services
        .admin
        .ship(order.id, admin, ship_request())
        .await
        .expect_err("second ship");
    assert_matches!(err, ServiceError::Conflict(_));
}

#[tokio::test]
async fn delivery_requires_a_shipped_order() {
    let app = TestApp::new().await;
    let admin = Uuid::new_v4();
    let variant = app.seed_variant("SCARF-RED", dec!(22.00), 4).await;
    let order = place_paid_order(&app, &variant, 1, "lost@example.com").await;

    let err = app
        .state
        .services
        .admin
        .mark_delivered(order.id, admin)
        .await
        .expect_err("not shipped yet");
    assert_matches!(err, ServiceError::Conflict(_));
}

#[tokio::test]
async fn full_refund_moves_order_to_refunded() {
    let app = TestApp::new().await;
    let admin = Uuid::new_v4();
    let variant = app.seed_variant("JACKET-OLV", dec!(80.00), 4).await;
    let order = place_paid_order(&app, &variant, 1, "refund@example.com").await;
    app.settle().await;

    let result = app
        .state
        .services
        .admin
        .refund(
            order.id,
            admin,
            RefundOrder {
                amount: None,
                reason: Some("damaged in transit".to_string()),
            },
        )
        .await
        .expect("refund");
    app.settle().await;

    assert_eq!(result.amount, dec!(80.00));
    assert!(!result.partial);
    assert_eq!(result.order.status, OrderStatus::Refunded);
    assert_eq!(app.gateway.refund_count(), 1);
    {
        let refunds = app.gateway.refunds.lock().unwrap();
        assert_eq!(refunds[0].amount_cents, None, "full refund sends no amount");
    }
    // Confirmation plus refund notice.
    assert_eq!(app.mailer.count(), 2);
}

#[tokio::test]
async fn partial_refund_keeps_order_status() {
    let app = TestApp::new().await;
    let admin = Uuid::new_v4();
    let variant = app.seed_variant("BOOTS-BRN", dec!(120.00), 4).await;
    let order = place_paid_order(&app, &variant, 1, "partial@example.com").await;

    let result = app
        .state
        .services
        .admin
        .refund(
            order.id,
            admin,
            RefundOrder {
                amount: Some(dec!(20.00)),
                reason: Some("late delivery credit".to_string()),
            },
        )
        .await
        .expect("partial refund");

    assert!(result.partial);
    assert_eq!(result.amount, dec!(20.00));
    assert_eq!(result.order.status, OrderStatus::Paid);
    let refunds = app.gateway.refunds.lock().unwrap();
    assert_eq!(refunds[0].amount_cents, Some(2000));
}

#[tokio::test]
async fn refund_above_total_is_rejected_before_the_processor() {
    let app = TestApp::new().await;
    let admin = Uuid::new_v4();
    let variant = app.seed_variant("BELT-TAN", dec!(35.00), 4).await;
    let order = place_paid_order(&app, &variant, 1, "greedy@example.com").await;

    let err = app
        .state
        .services
        .admin
        .refund(
            order.id,
            admin,
            RefundOrder {
                amount: Some(dec!(500.00)),
                reason: None,
            },
        )
        .await
        .expect_err("amount above total");
    assert_matches!(err, ServiceError::ValidationError(_));
    assert_eq!(app.gateway.refund_count(), 0, "processor never called");

    let reloaded = app
        .state
        .services
        .orders
        .get_order(order.id)
        .await
        .expect("order");
    assert_eq!(reloaded.status, OrderStatus::Paid);
}

#[tokio::test]
async fn pending_order_has_nothing_to_refund() {
    let app = TestApp::new().await;
    let admin = Uuid::new_v4();
    let variant = app.seed_variant("VEST-BLU", dec!(45.00), 4).await;

    use storefront_api::services::checkout::{CheckoutInput, CheckoutItem, CheckoutOutcome};
    let outcome = app
        .state
        .services
        .checkout
        .checkout(CheckoutInput {
            items: vec![CheckoutItem {
                variant_id: variant.id,
                quantity: 1,
            }],
            shipping_address: common::test_address("pending@example.com"),
            coupon_code: None,
            user_id: None,
        })
        .await
        .expect("checkout");
    let order = assert_matches!(outcome, CheckoutOutcome::PaymentRedirect { order, .. } => order);

    let err = app
        .state
        .services
        .admin
        .refund(order.id, admin, RefundOrder { amount: None, reason: None })
        .await
        .expect_err("no captured payment");
    assert_matches!(err, ServiceError::Conflict(_));
}

#[tokio::test]
async fn refund_webhook_after_admin_refund_is_a_noop() {
    let app = TestApp::new().await;
    let admin = Uuid::new_v4();
    let variant = app.seed_variant("COAT-CAM", dec!(150.00), 4).await;
    let order = place_paid_order(&app, &variant, 1, "race@example.com").await;

    app.state
        .services
        .admin
        .refund(order.id, admin, RefundOrder { amount: None, reason: None })
        .await
        .expect("admin refund");
    app.settle().await;
    let emails_after_admin = app.mailer.count();

    // The processor's own refund event arrives afterwards.
    let event = webhook_event(
        "evt_refund_echo",
        "charge.refunded",
        json!({
            "payment_intent": format!("pi_{}", order.order_number),
            "amount_refunded": 15000,
        }),
    );
    app.state
        .services
        .webhooks
        .process_event(&event)
        .await
        .expect("echo tolerated");
    app.settle().await;

    let reloaded = app
        .state
        .services
        .orders
        .get_order(order.id)
        .await
        .expect("order");
    assert_eq!(reloaded.status, OrderStatus::Refunded);
    assert_eq!(
        app.mailer.count(),
        emails_after_admin,
        "charge.refunded sends no customer email"
    );
}

#[tokio::test]
async fn cancel_requires_a_reason() {
    let app = TestApp::new().await;
    let admin = Uuid::new_v4();
    let variant = app.seed_variant("RING-SLV", dec!(60.00), 4).await;
    let order = place_paid_order(&app, &variant, 1, "cancel@example.com").await;

    let err = app
        .state
        .services
        .admin
        .cancel(
            order.id,
            admin,
            CancelOrder {
                reason: "   ".to_string(),
                notify_customer: false,
                refund: false,
            },
        )
        .await
        .expect_err("blank reason");
    assert_matches!(err, ServiceError::ValidationError(_));
}

#[tokio::test]
async fn cancel_with_refund_reports_processor_failure() {
    let app = TestApp::new().await;
    let admin = Uuid::new_v4();
    let variant = app.seed_variant("WATCH-BLK", dec!(200.00), 4).await;
    let order = place_paid_order(&app, &variant, 1, "unlucky@example.com").await;

    app.gateway.fail_refunds();
    let outcome = app
        .state
        .services
        .admin
        .cancel(
            order.id,
            admin,
            CancelOrder {
                reason: "fraud review".to_string(),
                notify_customer: false,
                refund: true,
            },
        )
        .await
        .expect("cancellation itself succeeds");

    let order = assert_matches!(
        outcome,
        CancelOutcome::CancelledRefundFailed { order, .. } => order
    );
    assert_eq!(order.status, OrderStatus::Cancelled);
}

#[tokio::test]
async fn cancel_with_refund_and_notice() {
    let app = TestApp::new().await;
    let admin = Uuid::new_v4();
    let variant = app.seed_variant("LAMP-BRS", dec!(70.00), 4).await;
    let order = place_paid_order(&app, &variant, 1, "sorry@example.com").await;
    app.settle().await;

    let outcome = app
        .state
        .services
        .admin
        .cancel(
            order.id,
            admin,
            CancelOrder {
                reason: "out of stock".to_string(),
                notify_customer: true,
                refund: true,
            },
        )
        .await
        .expect("cancel");
    app.settle().await;

    let order = assert_matches!(outcome, CancelOutcome::Cancelled { order } => order);
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(app.gateway.refund_count(), 1);

    let notes = app
        .state
        .services
        .orders
        .list_notes(order.id)
        .await
        .expect("notes");
    assert_eq!(notes.len(), 1);
    assert!(notes[0].content.contains("out of stock"));
}

#[tokio::test]
async fn cancelled_order_cannot_be_cancelled_again() {
    let app = TestApp::new().await;
    let admin = Uuid::new_v4();
    let variant = app.seed_variant("DESK-OAK", dec!(300.00), 4).await;
    let order = place_paid_order(&app, &variant, 1, "twice@example.com").await;

    let request = CancelOrder {
        reason: "customer request".to_string(),
        notify_customer: false,
        refund: false,
    };
    app.state
        .services
        .admin
        .cancel(order.id, admin, request.clone())
        .await
        .expect("first cancel");
    let err = app
        .state
        .services
        .admin
        .cancel(order.id, admin, request)
        .await
        .expect_err("second cancel");
    assert_matches!(err, ServiceError::Conflict(_));
}

#[tokio::test]
async fn activity_trail_documents_the_lifecycle() {
    let app = TestApp::new().await;
    let admin = Uuid::new_v4();
    let variant = app.seed_variant("CHAIR-GRN", dec!(90.00), 4).await;
    let order = place_paid_order(&app, &variant, 1, "audit@example.com").await;

    app.state
        .services
        .admin
        .ship(order.id, admin, ship_request())
        .await
        .expect("ship");
    app.state
        .services
        .admin
        .mark_delivered(order.id, admin)
        .await
        .expect("deliver");
    app.settle().await;

    let activity = app
        .state
        .services
        .orders
        .list_activity(order.id)
        .await
        .expect("activity");
    let kinds: Vec<String> = activity
        .iter()
        .map(|entry| entry.action_type.to_string())
        .collect();

    // Payment capture, three status changes and a shipment at minimum.
    assert!(kinds.iter().filter(|k| *k == "status_change").count() >= 3);
    assert!(kinds.iter().any(|k| k == "payment_captured"));
    assert!(kinds.iter().any(|k| k == "shipment"));
}
