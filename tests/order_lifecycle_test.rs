//! End-to-end tests for the order lifecycle over HTTP.
//!
//! - Creation and order numbering
//! - Status progression (new → confirmed → delivery_booked → in_transit → delivered)
//! - Delivery booking, patching and forced status overrides
//! - Listing, duplication, deletion and dashboard metrics

mod common;

use assert_matches::assert_matches;
use ast_orders_api::entities::{customer, order, order_line, order_number_sequence};
use ast_orders_api::events::Event;
use ast_orders_api::services::order_status::DeliveryStatus;
use axum::http::Method;
use chrono::{DateTime, TimeZone, Utc};
use common::{march_2025, response_json, TestApp, ADMIN_TOKEN};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, Set};
use serde_json::{json, Value};

fn decimal(value: &Value) -> Decimal {
    match value {
        Value::String(s) => s.parse().expect("decimal string"),
        Value::Number(n) => n.to_string().parse().expect("decimal number"),
        other => panic!("expected decimal, got {other}"),
    }
}

fn timestamp(value: &Value) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value.as_str().expect("timestamp string"))
        .expect("rfc3339 timestamp")
        .with_timezone(&Utc)
}

fn grip_order() -> Value {
    json!({
        "customer_email": "a@b.com",
        "total_amount": 50,
        "line_items": [{ "product_name": "Grip", "quantity": 2 }]
    })
}

async fn get_order(app: &TestApp, id: i64) -> Value {
    let response = app
        .request(Method::GET, &format!("/api/v1/orders/{id}"), None)
        .await;
    assert_eq!(response.status(), 200);
    response_json(response).await["data"].clone()
}

async fn progress(app: &TestApp, id: i64) -> axum::response::Response {
    app.request(
        Method::POST,
        &format!("/api/v1/orders/{id}/progress"),
        None,
    )
    .await
}

async fn force(app: &TestApp, id: i64, body: Value) -> axum::response::Response {
    app.request_with_headers(
        Method::POST,
        &format!("/api/v1/orders/{id}/force-status"),
        Some(body),
        &[("x-admin-token", ADMIN_TOKEN)],
    )
    .await
}

async fn insert_legacy_order(app: &TestApp, number: &str, created_at: DateTime<Utc>) {
    order::ActiveModel {
        order_number: Set(number.to_string()),
        subtotal: Set(Decimal::ZERO),
        tax_amount: Set(Decimal::ZERO),
        shipping_amount: Set(Decimal::ZERO),
        total_amount: Set(Decimal::ZERO),
        item_count: Set(0),
        delivery_status: Set("new".to_string()),
        created_at: Set(created_at),
        updated_at: Set(created_at),
        ..Default::default()
    }
    .insert(&*app.state.db)
    .await
    .expect("legacy order insert");
}

// ==================== Creation ====================

#[tokio::test]
async fn create_order_assigns_monthly_number_and_item_count() {
    let app = TestApp::new().await;

    let created = app.create_order(grip_order()).await;
    assert_eq!(created["order_number"], "AST-202503-0001");
    assert_eq!(created["order"]["order_number"], "AST-202503-0001");
    assert_eq!(created["order"]["item_count"], 2);
    assert_eq!(created["order"]["delivery_status"], "new");
    assert_eq!(created["order"]["status"], "new");
    assert_eq!(created["order"]["customer_email"], "a@b.com");
    assert_eq!(decimal(&created["order"]["total_amount"]), dec!(50));

    let second = app.create_order(grip_order()).await;
    assert_eq!(second["order_number"], "AST-202503-0002");
}

#[tokio::test]
async fn create_order_continues_legacy_sequence() {
    let app = TestApp::new().await;
    insert_legacy_order(&app, "AST-202503-0007", march_2025()).await;

    let created = app.create_order(grip_order()).await;
    assert_eq!(created["order_number"], "AST-202503-0008");
}

#[tokio::test]
async fn create_order_defaults_line_subtotal_and_exposes_next_status() {
    let app = TestApp::new().await;
    let created = app
        .create_order(json!({
            "customer_name": "Ann Parker",
            "line_items": [
                { "product_name": "Grip", "quantity": 2, "unit_price": "12.50" },
                { "product_name": "Tees", "unit_price": "3.00", "subtotal": "2.00" }
            ]
        }))
        .await;
    assert_eq!(created["order"]["item_count"], 3);

    let detail = get_order(&app, created["order"]["id"].as_i64().unwrap()).await;
    assert_eq!(detail["next_status"], "confirmed");

    let lines = detail["lines"].as_array().expect("lines array");
    assert_eq!(lines.len(), 2);
    let grip = lines.iter().find(|l| l["product_name"] == "Grip").unwrap();
    assert_eq!(decimal(&grip["subtotal"]), dec!(25));
    let tees = lines.iter().find(|l| l["product_name"] == "Tees").unwrap();
    assert_eq!(tees["quantity"], 1);
    assert_eq!(decimal(&tees["subtotal"]), dec!(2));
}

#[tokio::test]
async fn create_order_rejects_invalid_input() {
    let app = TestApp::new().await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(json!({ "line_items": [{ "product_name": "" }] })),
        )
        .await;
    assert_eq!(response.status(), 400);
    let body = response_json(response).await;
    assert_eq!(body["success"], false);

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(json!({ "line_items": [{ "product_name": "Grip", "quantity": 0 }] })),
        )
        .await;
    assert_eq!(response.status(), 400);

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(json!({ "customer_email": "not-an-email" })),
        )
        .await;
    assert_eq!(response.status(), 400);

    let count = order::Entity::find().count(&*app.state.db).await.unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn create_order_snapshots_linked_customer() {
    let app = TestApp::new().await;
    let customer = customer::ActiveModel {
        name: Set("Rory Fairway".to_string()),
        email: Set("rory@example.com".to_string()),
        phone: Set(Some("+44 20 7946 0000".to_string())),
        created_at: Set(march_2025()),
        ..Default::default()
    }
    .insert(&*app.state.db)
    .await
    .unwrap();

    let created = app
        .create_order(json!({ "customer_id": customer.id, "line_items": [] }))
        .await;
    assert_eq!(created["order"]["customer_email"], "rory@example.com");
    assert_eq!(created["order"]["customer_name"], "Rory Fairway");

    let detail = get_order(&app, created["order"]["id"].as_i64().unwrap()).await;
    assert_eq!(detail["customer"]["email"], "rory@example.com");
    assert_eq!(detail["customer"]["phone"], "+44 20 7946 0000");

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(json!({ "customer_id": 9999 })),
        )
        .await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn failed_line_insert_leaves_no_order_behind() {
    let app = TestApp::new().await;
    app.execute_sql("DROP TABLE order_lines").await;

    let response = app
        .request(Method::POST, "/api/v1/orders", Some(grip_order()))
        .await;
    assert_eq!(response.status(), 500);
    let body = response_json(response).await;
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("order_lines"));

    let db = &*app.state.db;
    assert_eq!(order::Entity::find().count(db).await.unwrap(), 0);
    assert_eq!(
        order_number_sequence::Entity::find().count(db).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn create_order_with_overflowing_totals_is_rejected() {
    let app = TestApp::new().await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(json!({
                "line_items": [{
                    "product_name": "Grip",
                    "quantity": 2,
                    "unit_price": "79228162514264337593543950335"
                }]
            })),
        )
        .await;
    assert_eq!(response.status(), 400);
    let body = response_json(response).await;
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("too large"));

    let lines: Vec<Value> = (0..21_475)
        .map(|_| json!({ "product_name": "Balls", "quantity": 100000 }))
        .collect();
    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(json!({ "line_items": lines })),
        )
        .await;
    assert_eq!(response.status(), 400);

    let count = order::Entity::find().count(&*app.state.db).await.unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn create_order_skips_numbers_issued_outside_the_counter() {
    let app = TestApp::new().await;
    let first = app.create_order(grip_order()).await;
    assert_eq!(first["order_number"], "AST-202503-0001");
    insert_legacy_order(&app, "AST-202503-0002", march_2025()).await;

    let mut numbers = Vec::new();
    for _ in 0..3 {
        let created = app.create_order(json!({})).await;
        numbers.push(created["order_number"].as_str().unwrap().to_string());
    }
    assert_eq!(
        numbers,
        ["AST-202503-0003", "AST-202503-0004", "AST-202503-0005"]
    );
}

#[tokio::test]
async fn persistent_order_number_collisions_end_in_conflict() {
    let app = TestApp::new().await;
    // Every insert races a writer that claims the same number first.
    app.execute_sql(
        "CREATE TRIGGER claim_order_number BEFORE INSERT ON orders \
         WHEN NOT EXISTS (SELECT 1 FROM orders WHERE order_number = NEW.order_number) \
         BEGIN \
           INSERT INTO orders (order_number, subtotal, tax_amount, shipping_amount, \
             total_amount, item_count, delivery_status, created_at, updated_at) \
           VALUES (NEW.order_number, 0, 0, 0, 0, 0, 'new', NEW.created_at, NEW.updated_at); \
         END",
    )
    .await;

    let response = app
        .request(Method::POST, "/api/v1/orders", Some(grip_order()))
        .await;
    assert_eq!(response.status(), 409);
    let body = response_json(response).await;
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("unique order number"));

    let db = &*app.state.db;
    assert_eq!(order::Entity::find().count(db).await.unwrap(), 0);
    assert_eq!(
        order_number_sequence::Entity::find().count(db).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn losing_the_month_seed_race_is_retried_then_conflicts() {
    let app = TestApp::new().await;
    // Another creator seeds the month's counter between our update and insert.
    app.execute_sql(
        "CREATE TRIGGER seed_month_first BEFORE INSERT ON order_number_sequences \
         WHEN NOT EXISTS (SELECT 1 FROM order_number_sequences WHERE prefix = NEW.prefix) \
         BEGIN \
           INSERT INTO order_number_sequences (prefix, last_value, updated_at) \
           VALUES (NEW.prefix, 40, NEW.updated_at); \
         END",
    )
    .await;

    let response = app
        .request(Method::POST, "/api/v1/orders", Some(grip_order()))
        .await;
    assert_eq!(response.status(), 409);

    app.execute_sql("DROP TRIGGER seed_month_first").await;
    let created = app.create_order(grip_order()).await;
    assert_eq!(created["order_number"], "AST-202503-0001");
}

// ==================== Progression ====================

#[tokio::test]
async fn progress_walks_the_table_and_stops_at_delivered() {
    let app = TestApp::new().await;
    let created = app.create_order(grip_order()).await;
    let id = created["order"]["id"].as_i64().unwrap();

    let mut observed = Vec::new();
    for _ in 0..4 {
        let response = progress(&app, id).await;
        assert_eq!(response.status(), 200);
        let body = response_json(response).await;
        observed.push(body["data"]["status"].as_str().unwrap().to_string());
    }
    assert_eq!(
        observed,
        ["confirmed", "delivery_booked", "in_transit", "delivered"]
    );

    let response = progress(&app, id).await;
    assert_eq!(response.status(), 400);
    let body = response_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("final status"));

    let detail = get_order(&app, id).await;
    assert_eq!(detail["delivery_status"], "delivered");
    assert_eq!(detail["status"], "delivered");
    assert!(detail["next_status"].is_null());
    assert_eq!(timestamp(&detail["shipped_at"]), march_2025());
    assert_eq!(timestamp(&detail["delivered_at"]), march_2025());
}

#[tokio::test]
async fn progress_reports_previous_and_next_status() {
    let app = TestApp::new().await;
    let created = app.create_order(grip_order()).await;
    let id = created["order"]["id"].as_i64().unwrap();

    let body = response_json(progress(&app, id).await).await;
    assert_eq!(body["data"]["id"], id);
    assert_eq!(body["data"]["order_number"], "AST-202503-0001");
    assert_eq!(body["data"]["previous_status"], "new");
    assert_eq!(body["data"]["status"], "confirmed");
    assert_eq!(body["data"]["next_status"], "delivery_booked");

    let events = app.wait_for_events(2).await;
    assert_matches!(&events[0], Event::OrderCreated { order_number, .. } if order_number == "AST-202503-0001");
    assert_matches!(
        &events[1],
        Event::OrderStatusChanged {
            from: DeliveryStatus::New,
            to: DeliveryStatus::Confirmed,
            forced: false,
            ..
        }
    );
}

#[tokio::test]
async fn progress_on_missing_order_is_not_found() {
    let app = TestApp::new().await;
    let response = progress(&app, 4242).await;
    assert_eq!(response.status(), 404);
}

// ==================== Delivery booking ====================

#[tokio::test]
async fn book_delivery_sets_courier_and_status() {
    let app = TestApp::new().await;
    let created = app.create_order(grip_order()).await;
    let id = created["order"]["id"].as_i64().unwrap();

    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/orders/{id}/book-delivery"),
            Some(json!({ "courier": "DHL", "tracking_number": "X123" })),
        )
        .await;
    assert_eq!(response.status(), 200);
    let body = response_json(response).await;
    let order = &body["data"];
    assert_eq!(order["delivery_status"], "delivery_booked");
    assert_eq!(order["status"], "delivery_booked");
    assert_eq!(order["courier"], "DHL");
    assert_eq!(order["tracking_number"], "X123");
    assert!(order["notes"].as_str().unwrap().contains("Delivery booked"));
}

#[tokio::test]
async fn book_delivery_appends_to_existing_notes_from_any_status() {
    let app = TestApp::new().await;
    let mut payload = grip_order();
    payload["notes"] = json!("Gift wrap");
    let created = app.create_order(payload).await;
    let id = created["order"]["id"].as_i64().unwrap();
    for _ in 0..3 {
        assert_eq!(progress(&app, id).await.status(), 200);
    }

    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/orders/{id}/book-delivery"),
            Some(json!({
                "courier": "UPS",
                "tracking_number": "1Z999",
                "expected_delivery_date": "2025-03-14",
                "notes": "leave at pro shop"
            })),
        )
        .await;
    assert_eq!(response.status(), 200);
    let order = response_json(response).await["data"].clone();
    assert_eq!(order["delivery_status"], "delivery_booked");
    assert_eq!(order["expected_delivery_date"], "2025-03-14");
    assert_eq!(
        order["notes"],
        "Gift wrap\nDelivery booked with UPS (tracking 1Z999): leave at pro shop"
    );
}

#[tokio::test]
async fn book_delivery_requires_courier_and_tracking() {
    let app = TestApp::new().await;
    let created = app.create_order(grip_order()).await;
    let id = created["order"]["id"].as_i64().unwrap();

    for body in [
        json!({ "tracking_number": "X123" }),
        json!({ "courier": "DHL" }),
        json!({ "courier": "  ", "tracking_number": "X123" }),
    ] {
        let response = app
            .request(
                Method::POST,
                &format!("/api/v1/orders/{id}/book-delivery"),
                Some(body),
            )
            .await;
        assert_eq!(response.status(), 400);
    }

    let detail = get_order(&app, id).await;
    assert_eq!(detail["delivery_status"], "new");
    assert!(detail["courier"].is_null());
    assert!(detail["notes"].is_null());
}

// ==================== Patching ====================

#[tokio::test]
async fn empty_patch_is_rejected_before_lookup() {
    let app = TestApp::new().await;

    // No order 777 exists; the empty body is rejected first.
    let response = app
        .request(Method::PUT, "/api/v1/orders/777", Some(json!({})))
        .await;
    assert_eq!(response.status(), 400);
    let body = response_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("No fields to update"));
}

#[tokio::test]
async fn patch_updates_only_supplied_fields() {
    let app = TestApp::new().await;
    let created = app.create_order(grip_order()).await;
    let id = created["order"]["id"].as_i64().unwrap();

    let response = app
        .request(
            Method::PUT,
            &format!("/api/v1/orders/{id}"),
            Some(json!({ "customer_name": "Ann Parker", "payment_status": "paid" })),
        )
        .await;
    assert_eq!(response.status(), 200);
    let order = response_json(response).await["data"].clone();
    assert_eq!(order["customer_name"], "Ann Parker");
    assert_eq!(order["payment_status"], "paid");
    assert_eq!(order["customer_email"], "a@b.com");
    assert_eq!(order["delivery_status"], "new");
}

#[tokio::test]
async fn patch_with_unknown_customer_is_rejected() {
    let app = TestApp::new().await;
    let created = app.create_order(grip_order()).await;
    let id = created["order"]["id"].as_i64().unwrap();

    let response = app
        .request(
            Method::PUT,
            &format!("/api/v1/orders/{id}"),
            Some(json!({ "customer_id": 9999, "notes": "should not land" })),
        )
        .await;
    assert_eq!(response.status(), 400);
    let body = response_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("Customer 9999"));

    let detail = get_order(&app, id).await;
    assert!(detail["customer_id"].is_null());
    assert!(detail["notes"].is_null());
}

#[tokio::test]
async fn patch_with_unknown_status_is_rejected() {
    let app = TestApp::new().await;
    let created = app.create_order(grip_order()).await;
    let id = created["order"]["id"].as_i64().unwrap();

    let response = app
        .request(
            Method::PUT,
            &format!("/api/v1/orders/{id}"),
            Some(json!({ "delivery_status": "shipped", "notes": "should not land" })),
        )
        .await;
    assert_eq!(response.status(), 400);

    let detail = get_order(&app, id).await;
    assert_eq!(detail["delivery_status"], "new");
    assert!(detail["notes"].is_null());
}

#[tokio::test]
async fn patch_with_conflicting_status_aliases_is_rejected() {
    let app = TestApp::new().await;
    let created = app.create_order(grip_order()).await;
    let id = created["order"]["id"].as_i64().unwrap();

    let response = app
        .request(
            Method::PUT,
            &format!("/api/v1/orders/{id}"),
            Some(json!({ "delivery_status": "confirmed", "status": "delivered" })),
        )
        .await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn patch_to_in_transit_stamps_shipped_at() {
    let app = TestApp::new().await;
    let created = app.create_order(grip_order()).await;
    let id = created["order"]["id"].as_i64().unwrap();

    let response = app
        .request(
            Method::PUT,
            &format!("/api/v1/orders/{id}"),
            Some(json!({ "status": "in_transit" })),
        )
        .await;
    assert_eq!(response.status(), 200);
    let order = response_json(response).await["data"].clone();
    assert_eq!(order["delivery_status"], "in_transit");
    assert_eq!(order["status"], "in_transit");
    assert_eq!(timestamp(&order["shipped_at"]), march_2025());
    assert!(order["delivered_at"].is_null());

    let explicit = Utc.with_ymd_and_hms(2025, 3, 2, 8, 0, 0).unwrap();
    let response = app
        .request(
            Method::PUT,
            &format!("/api/v1/orders/{id}"),
            Some(json!({ "delivery_status": "delivered", "delivered_at": explicit })),
        )
        .await;
    assert_eq!(response.status(), 200);
    let order = response_json(response).await["data"].clone();
    assert_eq!(timestamp(&order["delivered_at"]), explicit);
}

// ==================== Forced status ====================

#[tokio::test]
async fn force_status_requires_admin_token() {
    let app = TestApp::new().await;
    let created = app.create_order(grip_order()).await;
    let id = created["order"]["id"].as_i64().unwrap();
    let uri = format!("/api/v1/orders/{id}/force-status");

    let response = app
        .request(Method::POST, &uri, Some(json!({ "status": "delivered" })))
        .await;
    assert_eq!(response.status(), 403);

    let response = app
        .request_with_headers(
            Method::POST,
            &uri,
            Some(json!({ "status": "delivered" })),
            &[("x-admin-token", "wrong-token-wrong-token")],
        )
        .await;
    assert_eq!(response.status(), 403);

    assert_eq!(get_order(&app, id).await["delivery_status"], "new");
}

#[tokio::test]
async fn force_status_is_disabled_without_configured_token() {
    let app = TestApp::with_config(|cfg| cfg.force_status_token = None).await;
    let created = app.create_order(grip_order()).await;
    let id = created["order"]["id"].as_i64().unwrap();

    let response = force(&app, id, json!({ "status": "confirmed" })).await;
    assert_eq!(response.status(), 403);
    let body = response_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("disabled"));
}

#[tokio::test]
async fn force_status_moves_backwards_and_records_reason() {
    let app = TestApp::new().await;
    let created = app.create_order(grip_order()).await;
    let id = created["order"]["id"].as_i64().unwrap();

    let response = force(&app, id, json!({ "status": "delivered" })).await;
    assert_eq!(response.status(), 200);
    let body = response_json(response).await;
    assert_eq!(body["data"]["previous_status"], "new");
    assert_eq!(body["data"]["status"], "delivered");
    assert!(body["data"]["next_status"].is_null());

    let response = force(
        &app,
        id,
        json!({ "status": "confirmed", "reason": "customer reopened" }),
    )
    .await;
    assert_eq!(response.status(), 200);
    let body = response_json(response).await;
    assert_eq!(body["data"]["previous_status"], "delivered");
    assert_eq!(body["data"]["status"], "confirmed");
    assert_eq!(body["data"]["next_status"], "delivery_booked");

    let detail = get_order(&app, id).await;
    assert_eq!(detail["delivery_status"], "confirmed");
    assert_eq!(timestamp(&detail["delivered_at"]), march_2025());
    assert_eq!(
        detail["notes"],
        "Status forced from new to delivered\nStatus forced from delivered to confirmed: customer reopened"
    );
}

#[tokio::test]
async fn force_status_rejects_unknown_status() {
    let app = TestApp::new().await;
    let created = app.create_order(grip_order()).await;
    let id = created["order"]["id"].as_i64().unwrap();

    let response = force(&app, id, json!({ "status": "shipped" })).await;
    assert_eq!(response.status(), 400);
}

// ==================== Listing ====================

#[tokio::test]
async fn list_filters_by_status_newest_first() {
    let app = TestApp::new().await;
    let mut ids = Vec::new();
    for _ in 0..3 {
        let created = app.create_order(grip_order()).await;
        ids.push(created["order"]["id"].as_i64().unwrap());
    }
    for id in &ids[..2] {
        let response = force(&app, *id, json!({ "status": "delivered" })).await;
        assert_eq!(response.status(), 200);
    }

    let response = app
        .request(Method::GET, "/api/v1/orders?status=delivered&limit=10", None)
        .await;
    assert_eq!(response.status(), 200);
    let body = response_json(response).await;
    let data = &body["data"];
    let orders = data["orders"].as_array().unwrap();
    assert_eq!(orders.len(), 2);
    assert!(orders.iter().all(|o| o["delivery_status"] == "delivered"));
    let listed: Vec<i64> = orders.iter().map(|o| o["id"].as_i64().unwrap()).collect();
    assert_eq!(listed, vec![ids[1], ids[0]]);
    assert_eq!(data["total"], 2);
    assert_eq!(data["limit"], 10);
    assert_eq!(data["has_more"], false);
    assert_eq!(data["status_counts"]["delivered"], 2);
    assert_eq!(data["status_counts"]["new"], 1);
    assert_eq!(data["status_counts"]["in_transit"], 0);
}

#[tokio::test]
async fn list_paginates_and_caps_limit() {
    let app = TestApp::new().await;
    for _ in 0..3 {
        app.create_order(grip_order()).await;
    }

    let body = response_json(
        app.request(Method::GET, "/api/v1/orders?status=all&limit=2", None)
            .await,
    )
    .await;
    assert_eq!(body["data"]["orders"].as_array().unwrap().len(), 2);
    assert_eq!(body["data"]["total"], 3);
    assert_eq!(body["data"]["has_more"], true);

    let body = response_json(
        app.request(Method::GET, "/api/v1/orders?limit=2&offset=2", None)
            .await,
    )
    .await;
    assert_eq!(body["data"]["orders"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"]["orders"][0]["order_number"], "AST-202503-0001");
    assert_eq!(body["data"]["has_more"], false);

    let body = response_json(
        app.request(Method::GET, "/api/v1/orders?limit=5000", None)
            .await,
    )
    .await;
    assert_eq!(body["data"]["limit"], 200);
}

#[tokio::test]
async fn list_search_is_case_insensitive_and_literal() {
    let app = TestApp::new().await;
    app.create_order(json!({ "customer_name": "Ann Parker", "customer_email": "ann@club.com" }))
        .await;
    app.create_order(json!({ "customer_name": "Bo Eagle", "customer_email": "bo@links.com" }))
        .await;

    let body = response_json(
        app.request(Method::GET, "/api/v1/orders?search=PARK", None)
            .await,
    )
    .await;
    let orders = body["data"]["orders"].as_array().unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0]["customer_name"], "Ann Parker");

    let body = response_json(
        app.request(Method::GET, "/api/v1/orders?search=202503-0002", None)
            .await,
    )
    .await;
    assert_eq!(body["data"]["orders"][0]["customer_name"], "Bo Eagle");

    let body = response_json(
        app.request(Method::GET, "/api/v1/orders?search=%25", None)
            .await,
    )
    .await;
    assert_eq!(body["data"]["total"], 0);
}

#[tokio::test]
async fn list_rejects_malformed_query() {
    let app = TestApp::new().await;
    let response = app
        .request(Method::GET, "/api/v1/orders?limit=lots", None)
        .await;
    assert_eq!(response.status(), 400);
}

// ==================== Lookup, duplication and deletion ====================

#[tokio::test]
async fn get_by_number_matches_get_by_id() {
    let app = TestApp::new().await;
    let created = app.create_order(grip_order()).await;
    let id = created["order"]["id"].as_i64().unwrap();

    let response = app
        .request(Method::GET, "/api/v1/orders/by-number/AST-202503-0001", None)
        .await;
    assert_eq!(response.status(), 200);
    let by_number = response_json(response).await["data"].clone();
    assert_eq!(by_number, get_order(&app, id).await);

    let response = app
        .request(Method::GET, "/api/v1/orders/by-number/AST-202503-9999", None)
        .await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn malformed_id_is_bad_request() {
    let app = TestApp::new().await;
    let response = app.request(Method::GET, "/api/v1/orders/abc", None).await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn duplicate_copies_lines_under_new_number() {
    let app = TestApp::new().await;
    let mut payload = grip_order();
    payload["payment_status"] = json!("paid");
    let created = app.create_order(payload).await;
    let source_id = created["order"]["id"].as_i64().unwrap();
    assert_eq!(progress(&app, source_id).await.status(), 200);

    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/orders/{source_id}/duplicate"),
            None,
        )
        .await;
    assert_eq!(response.status(), 201);
    let copy = response_json(response).await["data"].clone();
    assert_eq!(copy["order_number"], "AST-202503-0002");
    assert_eq!(copy["order"]["delivery_status"], "new");
    assert_eq!(copy["order"]["item_count"], 2);
    assert_eq!(copy["order"]["customer_email"], "a@b.com");
    assert!(copy["order"]["payment_status"].is_null());
    assert_eq!(copy["order"]["notes"], "Duplicated from AST-202503-0001");

    let detail = get_order(&app, copy["order"]["id"].as_i64().unwrap()).await;
    let lines = detail["lines"].as_array().unwrap();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["product_name"], "Grip");
    assert_eq!(lines[0]["quantity"], 2);

    let source = get_order(&app, source_id).await;
    assert_eq!(source["delivery_status"], "confirmed");
}

#[tokio::test]
async fn delete_removes_order_and_lines() {
    let app = TestApp::new().await;
    let created = app.create_order(grip_order()).await;
    let id = created["order"]["id"].as_i64().unwrap();

    let response = app
        .request(Method::DELETE, &format!("/api/v1/orders/{id}"), None)
        .await;
    assert_eq!(response.status(), 200);
    let body = response_json(response).await;
    assert_eq!(body["data"]["id"], id);
    assert_eq!(body["data"]["deleted"], true);

    let response = app
        .request(Method::GET, &format!("/api/v1/orders/{id}"), None)
        .await;
    assert_eq!(response.status(), 404);

    let remaining_lines = order_line::Entity::find()
        .filter(order_line::Column::OrderId.eq(id as i32))
        .count(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(remaining_lines, 0);

    let response = app
        .request(Method::DELETE, &format!("/api/v1/orders/{id}"), None)
        .await;
    assert_eq!(response.status(), 404);
}

// ==================== Metrics ====================

#[tokio::test]
async fn metrics_summarize_statuses_revenue_and_month() {
    let app = TestApp::new().await;
    let february = Utc.with_ymd_and_hms(2025, 2, 20, 12, 0, 0).unwrap();
    insert_legacy_order(&app, "AST-202502-0001", february).await;

    let mut ids = Vec::new();
    for total in ["50.00", "25.50", "10.00"] {
        let created = app.create_order(json!({ "total_amount": total })).await;
        ids.push(created["order"]["id"].as_i64().unwrap());
    }
    assert_eq!(progress(&app, ids[0]).await.status(), 200);
    assert_eq!(
        force(&app, ids[1], json!({ "status": "delivered" })).await.status(),
        200
    );

    let response = app.request(Method::GET, "/api/v1/orders/metrics", None).await;
    assert_eq!(response.status(), 200);
    let metrics = response_json(response).await["data"].clone();
    assert_eq!(metrics["total_orders"], 4);
    assert_eq!(metrics["new_orders"], 2);
    assert_eq!(metrics["pending_orders"], 1);
    assert_eq!(metrics["delivered_orders"], 1);
    assert_eq!(metrics["this_month_orders"], 3);
    assert_eq!(decimal(&metrics["total_revenue"]), dec!(85.50));
}
