pub mod orders;

use crate::db::DbPool;
use crate::events::EventSender;
use crate::services::clock::Clock;
use crate::services::orders::{OrderService, OrderSettings};
use std::sync::Arc;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone, Debug)]
pub struct AppServices {
    pub order: Arc<OrderService>,
}

impl AppServices {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Option<Arc<EventSender>>,
        clock: Arc<dyn Clock>,
        settings: OrderSettings,
    ) -> Self {
        let order = Arc::new(
            OrderService::new(db_pool, event_sender)
                .with_clock(clock)
                .with_settings(settings),
        );

        Self { order }
    }
}
