//! HTTP surface against the in-process ledger

use actix_web::{http::StatusCode, test, web, App};
use cardledger_api::{configure, WebhookEndpoint};
use cardledger_core::{
    config::WebhookConfig,
    models::{Account, Card},
};
use cardledger_db::MemoryLedgerStore;
use cardledger_services::{
    constants::{DEFAULT_DECLINE_FEE, DEFAULT_FEE_PERCENT},
    webhook::sign,
    AntiFraudGuard, AuthorizationService, GradeService, LogNotifier, WebhookIngestor,
};
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::sync::Arc;

const SECRET: &str = "whsec-test";
const SIGNATURE_HEADER: &str = "X-Provider-Signature";

fn store() -> Arc<MemoryLedgerStore> {
    let store = Arc::new(MemoryLedgerStore::new());
    store.insert_account(Account {
        id: 1,
        balance: dec!(100.00),
        ..Default::default()
    });
    store
        .insert_card(Card {
            id: 10,
            account_id: 1,
            provider_card_id: Some("ext-10".to_string()),
            ..Default::default()
        })
        .unwrap();
    store
}

fn state(
    store: &Arc<MemoryLedgerStore>,
) -> (web::Data<AuthorizationService>, web::Data<WebhookEndpoint>) {
    let notifier = Arc::new(LogNotifier::new());
    let grades = Arc::new(GradeService::new(
        store.clone(),
        store.clone(),
        DEFAULT_FEE_PERCENT,
    ));

    let authorization = AuthorizationService::new(
        store.clone(),
        grades.clone(),
        AntiFraudGuard::new(store.clone(), 3),
        notifier.clone(),
        DEFAULT_DECLINE_FEE,
    );

    let config = WebhookConfig {
        allowed_ips: vec!["10.20.0.0/16".to_string()],
        secret: Some(SECRET.to_string()),
        ..Default::default()
    };
    let endpoint = WebhookEndpoint::new(
        &config,
        WebhookIngestor::new(store.clone(), grades, notifier),
    )
    .unwrap();

    (web::Data::new(authorization), web::Data::new(endpoint))
}

macro_rules! app {
    ($store:expr) => {{
        let (authorization, endpoint) = state($store);
        test::init_service(
            App::new()
                .app_data(authorization)
                .app_data(endpoint)
                .configure(configure),
        )
        .await
    }};
}

fn webhook_request(body: &Value, source: &str, signature: Option<String>) -> test::TestRequest {
    let body = serde_json::to_vec(body).unwrap();
    let mut req = test::TestRequest::post()
        .uri("/api/v1/webhooks/provider")
        .insert_header(("Content-Type", "application/json"))
        .insert_header(("X-Forwarded-For", source.to_string()));
    if let Some(signature) = signature {
        req = req.insert_header((SIGNATURE_HEADER, signature));
    }
    req.set_payload(body)
}

fn signed(body: &Value) -> Option<String> {
    Some(sign(SECRET, &serde_json::to_vec(body).unwrap()).unwrap())
}

#[actix_web::test]
async fn test_health() {
    let store = store();
    let app = app!(&store);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/api/v1/health").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "healthy");
}

#[actix_web::test]
async fn test_authorize_approves_with_decimal_strings() {
    let store = store();
    let app = app!(&store);

    let req = test::TestRequest::post()
        .uri("/api/v1/authorize")
        .set_json(json!({"card_id": 10, "amount": "50.00", "merchant_name": "Coffee Shop"}))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;

    assert_eq!(
        body,
        json!({
            "success": true,
            "status": "APPROVED",
            "message": "Transaction approved.",
            "fee": "3.35"
        })
    );
    assert_eq!(store.account_balance(1), Some(dec!(46.65)));
}

#[actix_web::test]
async fn test_authorize_decline_is_not_an_http_error() {
    let store = store();
    let app = app!(&store);

    let req = test::TestRequest::post()
        .uri("/api/v1/authorize")
        .set_json(json!({"card_id": 10, "amount": "150.00"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "DECLINED");
    assert_eq!(body["message"], "Insufficient user balance.");
    assert_eq!(body["fee"], "0.50");
}

#[actix_web::test]
async fn test_authorize_rejects_bad_input() {
    let store = store();
    let app = app!(&store);

    for payload in [
        json!({"card_id": 10, "amount": "0"}),
        json!({"card_id": 0, "amount": "5.00"}),
        json!({"amount": "5.00"}),
    ] {
        let req = test::TestRequest::post()
            .uri("/api/v1/authorize")
            .set_json(payload)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}

#[actix_web::test]
async fn test_webhook_capture_and_replay() {
    let store = store();
    let app = app!(&store);

    let event = json!({
        "event_type": "capture",
        "card_id": "ext-10",
        "transaction_id": "tx-100",
        "amount": "20.00",
        "status": "completed"
    });

    let first: Value = test::call_and_read_body_json(
        &app,
        webhook_request(&event, "10.20.3.4", signed(&event)).to_request(),
    )
    .await;
    assert_eq!(first["status"], "ok");
    assert_eq!(first["outcome"]["result"], "processed");

    let replay: Value = test::call_and_read_body_json(
        &app,
        webhook_request(&event, "10.20.3.4", signed(&event)).to_request(),
    )
    .await;
    assert_eq!(replay["outcome"]["result"], "duplicate");
    assert_eq!(replay["outcome"]["detail"], "tx-100");

    assert_eq!(store.account_balance(1), Some(dec!(80.00)));
    assert_eq!(store.entry_count(), 1);
}

#[actix_web::test]
async fn test_webhook_gates() {
    let store = store();
    let app = app!(&store);

    let event = json!({"event_type": "refund", "card_id": "ext-10", "amount": "5.00"});

    let resp = test::call_service(
        &app,
        webhook_request(&event, "192.0.2.1", signed(&event)).to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = test::call_service(
        &app,
        webhook_request(&event, "10.20.3.4", Some("00ff".to_string())).to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = test::call_service(&app, webhook_request(&event, "10.20.3.4", None).to_request()).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let orphan = json!({"event_type": "refund", "card_id": "ext-404", "amount": "5.00"});
    let resp = test::call_service(
        &app,
        webhook_request(&orphan, "10.20.3.4", signed(&orphan)).to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    assert_eq!(store.account_balance(1), Some(dec!(100.00)));
    assert_eq!(store.entry_count(), 0);
}

#[actix_web::test]
async fn test_webhook_malformed_body() {
    let store = store();
    let app = app!(&store);

    let body = b"{\"event_type\": ".to_vec();
    let signature = sign(SECRET, &body).unwrap();
    let req = test::TestRequest::post()
        .uri("/api/v1/webhooks/provider")
        .insert_header(("X-Forwarded-For", "10.20.0.1"))
        .insert_header((SIGNATURE_HEADER, signature))
        .set_payload(body)
        .to_request();

    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}
