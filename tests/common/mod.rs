#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use ast_orders_api::{
    config::AppConfig,
    db::{self, DbConfig},
    events::{self, Event, EventHandler},
    handlers::AppServices,
    services::{clock::FixedClock, orders::OrderSettings},
    AppState,
};
use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::{DateTime, TimeZone, Utc};
use sea_orm::ConnectionTrait;
use serde_json::Value;
use tower::ServiceExt;

pub const ADMIN_TOKEN: &str = "test-admin-token-0123456789";

/// 2025-03-09T10:30:00Z; every order created by the harness lands in `AST-202503`.
pub fn march_2025() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 9, 10, 30, 0).unwrap()
}

/// Collects every published event so tests can assert on them.
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle_event(&self, event: &Event) -> Result<(), String> {
        self.events
            .lock()
            .map_err(|e| e.to_string())?
            .push(event.clone());
        Ok(())
    }
}

impl RecordingHandler {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

/// Helper harness for spinning up an application state backed by an in-memory SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub recorded: Arc<RecordingHandler>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    /// Construct a new test application with fresh database state.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Like [`TestApp::new`], letting the caller adjust the configuration first.
    pub async fn with_config(adjust: impl FnOnce(&mut AppConfig)) -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.force_status_token = Some(ADMIN_TOKEN.to_string());
        adjust(&mut cfg);

        let pool = db::establish_connection_with_config(&DbConfig::in_memory_sqlite())
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db_arc = Arc::new(pool);

        let recorded = Arc::new(RecordingHandler::default());
        let (event_sender, event_rx) = events::channel(256);
        let handlers: Vec<Arc<dyn EventHandler>> = vec![recorded.clone()];
        let event_task = tokio::spawn(events::process_events(event_rx, handlers));

        let services = AppServices::new(
            db_arc.clone(),
            Some(Arc::new(event_sender)),
            Arc::new(FixedClock(march_2025())),
            OrderSettings::from(&cfg),
        );

        let state = AppState {
            db: db_arc,
            config: cfg,
            services,
        };
        let router = ast_orders_api::build_router(state.clone());

        Self {
            router,
            state,
            recorded,
            _event_task: event_task,
        }
    }

    /// Send a request against the router.
    pub async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> Response {
        self.request_with_headers(method, uri, body, &[]).await
    }

    pub async fn request_with_headers(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Creates an order through the API and returns the `data` payload.
    pub async fn create_order(&self, payload: Value) -> Value {
        let response = self
            .request(Method::POST, "/api/v1/orders", Some(payload))
            .await;
        assert_eq!(response.status(), 201, "order creation should succeed");
        response_json(response).await["data"].clone()
    }

    /// Waits until at least `count` events were handled, returning them all.
    pub async fn wait_for_events(&self, count: usize) -> Vec<Event> {
        for _ in 0..100 {
            let events = self.recorded.events();
            if events.len() >= count {
                return events;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        self.recorded.events()
    }

    /// Runs raw SQL against the test database.
    pub async fn execute_sql(&self, sql: &str) {
        self.state
            .db
            .execute_unprepared(sql)
            .await
            .expect("raw sql should run");
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}
