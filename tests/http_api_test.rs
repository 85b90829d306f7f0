//! Router-level tests: authentication on the admin surface, webhook
//! signature enforcement and the public checkout and lookup endpoints.

mod common;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use chrono::Utc;
use common::{place_paid_order, test_address, TestApp};
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use storefront_api::handlers::payment_webhooks::sign_payload;

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body bytes");
    serde_json::from_slice(&bytes).expect("json body")
}

fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

#[tokio::test]
async fn health_endpoint_reports_up() {
    let app = TestApp::new().await;
    let response = app
        .router()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "up");
    assert_eq!(body["database"], "up");
}

#[tokio::test]
async fn checkout_over_http_returns_redirect_payload() {
    let app = TestApp::new().await;
    let variant = app.seed_variant("HTTP-TEE", dec!(30.00), 5).await;

    let payload = json!({
        "items": [{ "variant_id": variant.id, "quantity": 1 }],
        "shipping_address": test_address("web@example.com"),
        "coupon_code": null,
        "user_id": null,
    });
    let response = app
        .router()
        .oneshot(json_request(Method::POST, "/api/v1/checkout", payload))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["kind"], "payment_redirect");
    assert!(body["order_number"].as_str().unwrap().starts_with("SWL-"));
    assert!(body["redirect_url"].as_str().unwrap().starts_with("https://"));
}

#[tokio::test]
async fn admin_surface_rejects_missing_and_insufficient_tokens() {
    let app = TestApp::new().await;

    let response = app
        .router()
        .oneshot(
            Request::builder()
                .uri("/api/v1/orders")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let support_token = app.token_with_roles(vec!["support".to_string()]);
    let response = app
        .router()
        .oneshot(
            Request::builder()
                .uri("/api/v1/orders")
                .header(header::AUTHORIZATION, format!("Bearer {support_token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn admin_can_list_and_fetch_orders() {
    let app = TestApp::new().await;
    let admin = Uuid::new_v4();
    let token = app.admin_token(admin);
    let variant = app.seed_variant("HTTP-MUG", dec!(20.00), 5).await;
    let order = place_paid_order(&app, &variant, 1, "listed@example.com").await;

    let response = app
        .router()
        .oneshot(
            Request::builder()
                .uri("/api/v1/orders?status=paid")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["data"][0]["order_number"], order.order_number.as_str());

    // Fetch by order number instead of id.
    let response = app
        .router()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/orders/{}", order.order_number))
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "paid");
    assert_eq!(body["items"].as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn customer_lookup_needs_the_matching_email() {
    let app = TestApp::new().await;
    let variant = app.seed_variant("HTTP-CAP", dec!(25.00), 5).await;
    let order = place_paid_order(&app, &variant, 1, "owner@example.com").await;

    let uri = format!(
        "/api/v1/orders/lookup?order_number={}&email=owner@example.com",
        order.order_number
    );
    let response = app
        .router()
        .oneshot(Request::builder().uri(&uri).body(Body::empty()).unwrap())
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["order_number"], order.order_number.as_str());
    assert_eq!(body["status"], "paid");

    let uri = format!(
        "/api/v1/orders/lookup?order_number={}&email=stranger@example.com",
        order.order_number
    );
    let response = app
        .router()
        .oneshot(Request::builder().uri(&uri).body(Body::empty()).unwrap())
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn webhook_endpoint_enforces_the_signature() {
    let app = TestApp::new().await;
    let payload = json!({
        "id": "evt_http_1",
        "type": "payment_intent.payment_failed",
        "data": { "object": { "id": "pi_x" } }
    })
    .to_string();

    // Unsigned delivery is rejected.
    let response = app
        .router()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/v1/payments/webhook")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(payload.clone()))
                .unwrap(),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // A correctly signed delivery is accepted.
    let signature = sign_payload(
        payload.as_bytes(),
        &app.state.config.stripe_webhook_secret,
        Utc::now().timestamp(),
    );
    let response = app
        .router()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/v1/payments/webhook")
                .header(header::CONTENT_TYPE, "application/json")
                .header("Stripe-Signature", signature)
                .body(Body::from(payload))
                .unwrap(),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn admin_status_patch_rejects_illegal_transitions() {
    let app = TestApp::new().await;
    let admin = Uuid::new_v4();
    let token = app.admin_token(admin);
    let variant = app.seed_variant("HTTP-PIN", dec!(12.00), 5).await;
    let order = place_paid_order(&app, &variant, 1, "patch@example.com").await;

    // paid -> processing is legal.
    let response = app
        .router()
        .oneshot(
            Request::builder()
                .method(Method::PATCH)
                .uri(format!("/api/v1/orders/{}/status", order.id))
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({ "status": "processing" }).to_string()))
                .unwrap(),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    // processing -> pending is not.
    let response = app
        .router()
        .oneshot(
            Request::builder()
                .method(Method::PATCH)
                .uri(format!("/api/v1/orders/{}/status", order.id))
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({ "status": "pending" }).to_string()))
                .unwrap(),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CONFLICT);
}
