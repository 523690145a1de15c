use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::services::order_status::DeliveryStatus;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

/// Creates a sender and the receiver to hand to [`process_events`].
pub fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSender::new(tx), rx)
}

/// Order lifecycle events, published after the owning transaction commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    OrderCreated {
        order_id: i32,
        order_number: String,
    },
    OrderUpdated {
        order_id: i32,
    },
    OrderStatusChanged {
        order_id: i32,
        from: DeliveryStatus,
        to: DeliveryStatus,
        forced: bool,
    },
    DeliveryBooked {
        order_id: i32,
        courier: String,
        tracking_number: String,
    },
    OrderDuplicated {
        order_id: i32,
        order_number: String,
        source_id: i32,
    },
    OrderDeleted {
        order_id: i32,
    },
}

impl Event {
    pub fn order_id(&self) -> i32 {
        match self {
            Event::OrderCreated { order_id, .. }
            | Event::OrderUpdated { order_id }
            | Event::OrderStatusChanged { order_id, .. }
            | Event::DeliveryBooked { order_id, .. }
            | Event::OrderDuplicated { order_id, .. }
            | Event::OrderDeleted { order_id } => *order_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::OrderCreated { .. } => "order_created",
            Event::OrderUpdated { .. } => "order_updated",
            Event::OrderStatusChanged { .. } => "order_status_changed",
            Event::DeliveryBooked { .. } => "delivery_booked",
            Event::OrderDuplicated { .. } => "order_duplicated",
            Event::OrderDeleted { .. } => "order_deleted",
        }
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: &Event) -> Result<(), String>;
}

/// Writes every event to the log.
#[derive(Debug, Default)]
pub struct LoggingEventHandler;

#[async_trait]
impl EventHandler for LoggingEventHandler {
    async fn handle_event(&self, event: &Event) -> Result<(), String> {
        let payload = serde_json::to_string(event).map_err(|e| e.to_string())?;
        info!(
            event = event.name(),
            order_id = event.order_id(),
            payload = %payload,
            "Order event"
        );
        Ok(())
    }
}

/// Drains `rx`, handing each event to every handler. Returns once all senders are dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, handlers: Vec<Arc<dyn EventHandler>>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        for handler in &handlers {
            if let Err(e) = handler.handle_event(&event).await {
                error!(
                    event = event.name(),
                    order_id = event.order_id(),
                    "Failed to handle event: {}",
                    e
                );
            }
        }
    }

    info!("Event channel closed; event processing stopped");
}
