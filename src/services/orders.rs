use crate::{
    config::AppConfig,
    db::{DbPool, QueryBuilder, SearchBuilder},
    entities::{customer, order, order_line},
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        clock::{Clock, SystemClock},
        order_numbers::{month_prefix, next_order_number},
        order_status::DeliveryStatus,
    },
};
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use metrics::{counter, histogram};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DbErr,
    EntityTrait, IntoActiveModel, QueryFilter, QueryOrder, QuerySelect, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};
use utoipa::{IntoParams, ToSchema};
use validator::{Validate, ValidationError};

/// One line of a create request
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate, ToSchema)]
pub struct OrderLineInput {
    pub product_id: Option<i32>,
    pub sku: Option<String>,
    #[validate(length(min = 1, message = "product_name is required"))]
    #[schema(example = "Grip")]
    pub product_name: String,
    /// Defaults to 1
    #[validate(range(min = 1, max = 100000, message = "quantity must be at least 1"))]
    pub quantity: Option<i32>,
    #[validate(custom = "validate_non_negative")]
    #[schema(value_type = Option<String>, example = "12.50")]
    pub unit_price: Option<Decimal>,
    /// Defaults to `unit_price * quantity`
    #[validate(custom = "validate_non_negative")]
    #[schema(value_type = Option<String>)]
    pub subtotal: Option<Decimal>,
    pub image_url: Option<String>,
}

/// Request to create an order with its lines
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate, ToSchema)]
pub struct CreateOrderRequest {
    pub customer_id: Option<i32>,
    #[validate(email(message = "customer_email must be a valid email address"))]
    #[schema(example = "a@b.com")]
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub shipping_address: Option<Value>,
    #[schema(value_type = Option<Object>)]
    pub billing_address: Option<Value>,
    #[validate(custom = "validate_non_negative")]
    #[schema(value_type = Option<String>)]
    pub subtotal: Option<Decimal>,
    #[validate(custom = "validate_non_negative")]
    #[schema(value_type = Option<String>)]
    pub tax_amount: Option<Decimal>,
    #[validate(custom = "validate_non_negative")]
    #[schema(value_type = Option<String>)]
    pub shipping_amount: Option<Decimal>,
    #[validate(custom = "validate_non_negative")]
    #[schema(value_type = Option<String>, example = "50.00")]
    pub total_amount: Option<Decimal>,
    pub payment_method: Option<String>,
    pub payment_status: Option<String>,
    pub notes: Option<String>,
    #[serde(default)]
    #[validate]
    pub line_items: Vec<OrderLineInput>,
}

/// Partial update. Absent fields are left untouched.
///
/// `status` and `delivery_status` name the same field.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate, ToSchema)]
pub struct UpdateOrderRequest {
    pub customer_id: Option<i32>,
    #[validate(email(message = "customer_email must be a valid email address"))]
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub shipping_address: Option<Value>,
    #[schema(value_type = Option<Object>)]
    pub billing_address: Option<Value>,
    #[validate(custom = "validate_non_negative")]
    #[schema(value_type = Option<String>)]
    pub subtotal: Option<Decimal>,
    #[validate(custom = "validate_non_negative")]
    #[schema(value_type = Option<String>)]
    pub tax_amount: Option<Decimal>,
    #[validate(custom = "validate_non_negative")]
    #[schema(value_type = Option<String>)]
    pub shipping_amount: Option<Decimal>,
    #[validate(custom = "validate_non_negative")]
    #[schema(value_type = Option<String>)]
    pub total_amount: Option<Decimal>,
    pub payment_method: Option<String>,
    pub payment_status: Option<String>,
    #[schema(example = "confirmed")]
    pub delivery_status: Option<String>,
    pub status: Option<String>,
    pub notes: Option<String>,
    pub tracking_number: Option<String>,
    pub courier: Option<String>,
    pub expected_delivery_date: Option<NaiveDate>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl UpdateOrderRequest {
    pub fn is_empty(&self) -> bool {
        self.customer_id.is_none()
            && self.customer_email.is_none()
            && self.customer_name.is_none()
            && self.shipping_address.is_none()
            && self.billing_address.is_none()
            && self.subtotal.is_none()
            && self.tax_amount.is_none()
            && self.shipping_amount.is_none()
            && self.total_amount.is_none()
            && self.payment_method.is_none()
            && self.payment_status.is_none()
            && self.delivery_status.is_none()
            && self.status.is_none()
            && self.notes.is_none()
            && self.tracking_number.is_none()
            && self.courier.is_none()
            && self.expected_delivery_date.is_none()
            && self.shipped_at.is_none()
            && self.delivered_at.is_none()
    }

    /// The status this patch asks for, validated against the progression table.
    pub fn requested_status(&self) -> Result<Option<DeliveryStatus>, ServiceError> {
        match (self.delivery_status.as_deref(), self.status.as_deref()) {
            (None, None) => Ok(None),
            (Some(raw), None) | (None, Some(raw)) => parse_status(raw).map(Some),
            (Some(delivery_status), Some(status)) => {
                let delivery_status = parse_status(delivery_status)?;
                let status = parse_status(status)?;
                if delivery_status != status {
                    return Err(ServiceError::ValidationError(format!(
                        "status '{}' conflicts with delivery_status '{}'",
                        status, delivery_status
                    )));
                }
                Ok(Some(delivery_status))
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct BookDeliveryRequest {
    #[schema(example = "DHL")]
    pub courier: Option<String>,
    #[schema(example = "X123")]
    pub tracking_number: Option<String>,
    pub expected_delivery_date: Option<NaiveDate>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ForceStatusRequest {
    pub status: DeliveryStatus,
    pub reason: Option<String>,
}

/// List filters and pagination
#[derive(Debug, Clone, Default, Serialize, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListOrdersQuery {
    /// Case-insensitive substring of order number, customer name or customer email
    pub search: Option<String>,
    /// Exact delivery status; `all` disables the filter
    pub status: Option<String>,
    /// Page size, capped at 200
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Contact fields of the linked customer record
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CustomerContact {
    pub id: i32,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub company: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub billing_address: Option<Value>,
}

impl From<customer::Model> for CustomerContact {
    fn from(model: customer::Model) -> Self {
        Self {
            id: model.id,
            name: model.name,
            email: model.email,
            phone: model.phone,
            company: model.company,
            billing_address: model.billing_address,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderResponse {
    pub id: i32,
    #[schema(example = "AST-202503-0001")]
    pub order_number: String,
    pub customer_id: Option<i32>,
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub shipping_address: Option<Value>,
    #[schema(value_type = Option<Object>)]
    pub billing_address: Option<Value>,
    #[schema(value_type = String)]
    pub subtotal: Decimal,
    #[schema(value_type = String)]
    pub tax_amount: Decimal,
    #[schema(value_type = String)]
    pub shipping_amount: Decimal,
    #[schema(value_type = String)]
    pub total_amount: Decimal,
    pub item_count: i32,
    pub payment_method: Option<String>,
    pub payment_status: Option<String>,
    pub delivery_status: String,
    /// Always equal to `delivery_status`
    pub status: String,
    pub tracking_number: Option<String>,
    pub courier: Option<String>,
    pub expected_delivery_date: Option<NaiveDate>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer: Option<CustomerContact>,
}

impl From<order::Model> for OrderResponse {
    fn from(model: order::Model) -> Self {
        let delivery_status = match DeliveryStatus::from_stored(&model.delivery_status) {
            Some(status) => status.as_str().to_string(),
            None => model.delivery_status,
        };
        Self {
            id: model.id,
            order_number: model.order_number,
            customer_id: model.customer_id,
            customer_email: model.customer_email,
            customer_name: model.customer_name,
            shipping_address: model.shipping_address,
            billing_address: model.billing_address,
            subtotal: model.subtotal,
            tax_amount: model.tax_amount,
            shipping_amount: model.shipping_amount,
            total_amount: model.total_amount,
            item_count: model.item_count,
            payment_method: model.payment_method,
            payment_status: model.payment_status,
            status: delivery_status.clone(),
            delivery_status,
            tracking_number: model.tracking_number,
            courier: model.courier,
            expected_delivery_date: model.expected_delivery_date,
            shipped_at: model.shipped_at,
            delivered_at: model.delivered_at,
            notes: model.notes,
            created_at: model.created_at,
            updated_at: model.updated_at,
            customer: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderLineResponse {
    pub id: i32,
    pub order_id: i32,
    pub product_id: Option<i32>,
    pub sku: Option<String>,
    pub product_name: String,
    pub quantity: i32,
    #[schema(value_type = String)]
    pub unit_price: Decimal,
    #[schema(value_type = String)]
    pub subtotal: Decimal,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<order_line::Model> for OrderLineResponse {
    fn from(model: order_line::Model) -> Self {
        Self {
            id: model.id,
            order_id: model.order_id,
            product_id: model.product_id,
            sku: model.sku,
            product_name: model.product_name,
            quantity: model.quantity,
            unit_price: model.unit_price,
            subtotal: model.subtotal,
            image_url: model.image_url,
            created_at: model.created_at,
        }
    }
}

/// Order with its lines and the status `progress` would move it to
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderDetailResponse {
    #[serde(flatten)]
    pub order: OrderResponse,
    pub lines: Vec<OrderLineResponse>,
    pub next_status: Option<DeliveryStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreatedOrderResponse {
    pub order: OrderResponse,
    #[schema(example = "AST-202503-0001")]
    pub order_number: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderListResponse {
    pub orders: Vec<OrderResponse>,
    pub total: u64,
    pub limit: u64,
    pub offset: u64,
    pub has_more: bool,
    /// Tally of every order per delivery status, ignoring the list filters
    pub status_counts: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StatusChangeResponse {
    pub id: i32,
    pub order_number: String,
    pub previous_status: String,
    pub status: DeliveryStatus,
    pub next_status: Option<DeliveryStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderMetricsResponse {
    pub total_orders: u64,
    #[schema(value_type = String)]
    pub total_revenue: Decimal,
    pub new_orders: u64,
    /// Orders that are neither `new` nor `delivered`
    pub pending_orders: u64,
    pub delivered_orders: u64,
    pub this_month_orders: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeleteOrderResponse {
    pub id: i32,
    pub deleted: bool,
}

/// Tunables read from [`AppConfig`]
#[derive(Debug, Clone)]
pub struct OrderSettings {
    pub order_number_prefix: String,
    pub default_page_size: u64,
    pub max_page_size: u64,
    pub order_number_max_retries: u32,
    pub force_status_token: Option<String>,
}

impl Default for OrderSettings {
    fn default() -> Self {
        Self {
            order_number_prefix: "AST".to_string(),
            default_page_size: 50,
            max_page_size: 200,
            order_number_max_retries: 3,
            force_status_token: None,
        }
    }
}

impl From<&AppConfig> for OrderSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            order_number_prefix: cfg.order_number_prefix.clone(),
            default_page_size: cfg.orders_default_page_size,
            max_page_size: cfg.orders_max_page_size,
            order_number_max_retries: cfg.order_number_max_retries,
            force_status_token: cfg
                .force_status_token
                .as_ref()
                .map(|token| token.trim().to_string())
                .filter(|token| !token.is_empty()),
        }
    }
}

/// Fields of an order about to be inserted, shared by create and duplicate
#[derive(Debug, Clone)]
struct NewOrder {
    customer_id: Option<i32>,
    customer_email: Option<String>,
    customer_name: Option<String>,
    shipping_address: Option<Value>,
    billing_address: Option<Value>,
    subtotal: Decimal,
    tax_amount: Decimal,
    shipping_amount: Decimal,
    total_amount: Decimal,
    payment_method: Option<String>,
    payment_status: Option<String>,
    notes: Option<String>,
    lines: Vec<NewOrderLine>,
}

#[derive(Debug, Clone)]
struct NewOrderLine {
    product_id: Option<i32>,
    sku: Option<String>,
    product_name: String,
    quantity: i32,
    unit_price: Decimal,
    subtotal: Decimal,
    image_url: Option<String>,
}

impl NewOrder {
    fn item_count(&self) -> Result<i32, ServiceError> {
        self.lines
            .iter()
            .try_fold(0i32, |total, line| total.checked_add(line.quantity))
            .ok_or_else(|| {
                ServiceError::ValidationError("total item quantity is too large".to_string())
            })
    }
}

impl TryFrom<CreateOrderRequest> for NewOrder {
    type Error = ServiceError;

    fn try_from(request: CreateOrderRequest) -> Result<Self, Self::Error> {
        let lines = request
            .line_items
            .into_iter()
            .map(|line| -> Result<NewOrderLine, ServiceError> {
                let quantity = line.quantity.unwrap_or(1);
                let unit_price = line.unit_price.unwrap_or(Decimal::ZERO);
                let subtotal = match line.subtotal {
                    Some(subtotal) => subtotal,
                    None => unit_price.checked_mul(Decimal::from(quantity)).ok_or_else(|| {
                        ServiceError::ValidationError(format!(
                            "subtotal of {} is too large",
                            line.product_name
                        ))
                    })?,
                };
                Ok(NewOrderLine {
                    product_id: line.product_id,
                    sku: line.sku,
                    product_name: line.product_name,
                    quantity,
                    unit_price,
                    subtotal,
                    image_url: line.image_url,
                })
            })
            .collect::<Result<Vec<_>, ServiceError>>()?;

        let draft = Self {
            customer_id: request.customer_id,
            customer_email: request.customer_email,
            customer_name: request.customer_name,
            shipping_address: request.shipping_address,
            billing_address: request.billing_address,
            subtotal: request.subtotal.unwrap_or(Decimal::ZERO),
            tax_amount: request.tax_amount.unwrap_or(Decimal::ZERO),
            shipping_amount: request.shipping_amount.unwrap_or(Decimal::ZERO),
            total_amount: request.total_amount.unwrap_or(Decimal::ZERO),
            payment_method: request.payment_method,
            payment_status: request.payment_status,
            notes: request.notes,
            lines,
        };
        draft.item_count()?;
        Ok(draft)
    }
}

/// Order lifecycle operations
#[derive(Clone, Debug)]
pub struct OrderService {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
    clock: Arc<dyn Clock>,
    settings: OrderSettings,
}

impl OrderService {
    /// Creates a new order service instance
    pub fn new(db_pool: Arc<DbPool>, event_sender: Option<Arc<EventSender>>) -> Self {
        Self {
            db_pool,
            event_sender,
            clock: Arc::new(SystemClock),
            settings: OrderSettings::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_settings(mut self, settings: OrderSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &OrderSettings {
        &self.settings
    }

    /// Creates an order and its lines in one transaction
    #[instrument(skip(self, request), fields(line_count = request.line_items.len()))]
    pub async fn create_order(
        &self,
        request: CreateOrderRequest,
    ) -> Result<CreatedOrderResponse, ServiceError> {
        request.validate()?;

        let draft = NewOrder::try_from(request)?;
        let created = self.insert_with_retry(&draft).await?;

        info!(
            order_id = created.id,
            order_number = %created.order_number,
            item_count = created.item_count,
            "Order created successfully"
        );
        counter!("ast_orders.orders.created", 1);

        self.publish(Event::OrderCreated {
            order_id: created.id,
            order_number: created.order_number.clone(),
        })
        .await;

        Ok(CreatedOrderResponse {
            order_number: created.order_number.clone(),
            order: created.into(),
        })
    }

    /// Lists orders newest first
    #[instrument(skip(self))]
    pub async fn list_orders(
        &self,
        query: ListOrdersQuery,
    ) -> Result<OrderListResponse, ServiceError> {
        let db = &*self.db_pool;

        let search = query
            .search
            .as_deref()
            .map(str::trim)
            .filter(|term| !term.is_empty())
            .and_then(|term| {
                SearchBuilder::new()
                    .add_like(order::Column::OrderNumber, term)
                    .add_like(order::Column::CustomerName, term)
                    .add_like(order::Column::CustomerEmail, term)
                    .build()
            });

        let status = query
            .status
            .as_deref()
            .map(str::trim)
            .filter(|status| !status.is_empty() && !status.eq_ignore_ascii_case("all"))
            .map(|status| Condition::all().add(order::Column::DeliveryStatus.eq(status)));

        let builder = QueryBuilder::<order::Entity>::new()
            .filter_opt(search)
            .filter_opt(status)
            .order_by(order::Column::CreatedAt, true)
            .order_by(order::Column::Id, true)
            .paginate(
                query.limit.unwrap_or(self.settings.default_page_size),
                query.offset.unwrap_or(0),
                self.settings.max_page_size,
            );
        let (limit, offset) = (builder.limit(), builder.offset());

        let (orders, total) = builder
            .execute(db)
            .await
            .map_err(db_error("list orders"))?;

        let customers = load_customers(db, orders.iter().filter_map(|o| o.customer_id)).await?;
        let status_counts = status_counts(db).await?;

        let has_more = offset + (orders.len() as u64) < total;
        let orders = orders
            .into_iter()
            .map(|model| {
                let contact = model
                    .customer_id
                    .and_then(|id| customers.get(&id).cloned());
                let mut response = OrderResponse::from(model);
                response.customer = contact;
                response
            })
            .collect();

        Ok(OrderListResponse {
            orders,
            total,
            limit,
            offset,
            has_more,
            status_counts,
        })
    }

    /// Retrieves an order by ID with its lines and customer contact
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn get_order(&self, order_id: i32) -> Result<OrderDetailResponse, ServiceError> {
        let db = &*self.db_pool;
        let order = find_order(db, order_id).await?;
        self.order_detail(order).await
    }

    /// Retrieves an order by its order number
    #[instrument(skip(self), fields(order_number = %order_number))]
    pub async fn get_order_by_number(
        &self,
        order_number: &str,
    ) -> Result<OrderDetailResponse, ServiceError> {
        let db = &*self.db_pool;
        let order = order::Entity::find()
            .filter(order::Column::OrderNumber.eq(order_number))
            .one(db)
            .await
            .map_err(db_error("fetch order by number"))?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_number)))?;
        self.order_detail(order).await
    }

    /// Applies a partial update
    #[instrument(skip(self, patch), fields(order_id = %order_id))]
    pub async fn update_order(
        &self,
        order_id: i32,
        patch: UpdateOrderRequest,
    ) -> Result<OrderResponse, ServiceError> {
        if patch.is_empty() {
            return Err(ServiceError::ValidationError("No fields to update".to_string()));
        }
        patch.validate()?;
        let requested_status = patch.requested_status()?;

        let db = &*self.db_pool;
        let existing = find_order(db, order_id).await?;
        if let Some(customer_id) = patch.customer_id {
            require_customer(db, customer_id).await?;
        }
        let previous_status = DeliveryStatus::from_stored(&existing.delivery_status);
        let now = self.clock.now();

        let mut active = existing.into_active_model();
        if let Some(customer_id) = patch.customer_id {
            active.customer_id = Set(Some(customer_id));
        }
        if let Some(email) = patch.customer_email {
            active.customer_email = Set(Some(email));
        }
        if let Some(name) = patch.customer_name {
            active.customer_name = Set(Some(name));
        }
        if let Some(address) = patch.shipping_address {
            active.shipping_address = Set(Some(address));
        }
        if let Some(address) = patch.billing_address {
            active.billing_address = Set(Some(address));
        }
        if let Some(amount) = patch.subtotal {
            active.subtotal = Set(amount);
        }
        if let Some(amount) = patch.tax_amount {
            active.tax_amount = Set(amount);
        }
        if let Some(amount) = patch.shipping_amount {
            active.shipping_amount = Set(amount);
        }
        if let Some(amount) = patch.total_amount {
            active.total_amount = Set(amount);
        }
        if let Some(method) = patch.payment_method {
            active.payment_method = Set(Some(method));
        }
        if let Some(payment_status) = patch.payment_status {
            active.payment_status = Set(Some(payment_status));
        }
        if let Some(notes) = patch.notes {
            active.notes = Set(Some(notes));
        }
        if let Some(tracking_number) = patch.tracking_number {
            active.tracking_number = Set(Some(tracking_number));
        }
        if let Some(courier) = patch.courier {
            active.courier = Set(Some(courier));
        }
        if let Some(date) = patch.expected_delivery_date {
            active.expected_delivery_date = Set(Some(date));
        }
        if let Some(shipped_at) = patch.shipped_at {
            active.shipped_at = Set(Some(shipped_at));
        }
        if let Some(delivered_at) = patch.delivered_at {
            active.delivered_at = Set(Some(delivered_at));
        }
        if let Some(status) = requested_status {
            active.delivery_status = Set(status.as_str().to_string());
            match status {
                DeliveryStatus::InTransit if patch.shipped_at.is_none() => {
                    active.shipped_at = Set(Some(now));
                }
                DeliveryStatus::Delivered if patch.delivered_at.is_none() => {
                    active.delivered_at = Set(Some(now));
                }
                _ => {}
            }
        }
        active.updated_at = Set(now);

        let updated = active.update(db).await.map_err(db_error("update order"))?;

        info!(order_id, "Order updated successfully");
        self.publish(Event::OrderUpdated { order_id }).await;
        if let (Some(from), Some(to)) = (previous_status, requested_status) {
            if from != to {
                self.publish(Event::OrderStatusChanged {
                    order_id,
                    from,
                    to,
                    forced: false,
                })
                .await;
            }
        }

        Ok(updated.into())
    }

    /// Advances an order exactly one step along the progression table
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn progress_order(
        &self,
        order_id: i32,
    ) -> Result<StatusChangeResponse, ServiceError> {
        let db = &*self.db_pool;
        let existing = find_order(db, order_id).await?;

        let current = DeliveryStatus::from_stored(&existing.delivery_status).ok_or_else(|| {
            ServiceError::InvalidStatus(format!(
                "Order {} has unrecognized status '{}'",
                order_id, existing.delivery_status
            ))
        })?;
        let next = current.next().ok_or_else(|| {
            ServiceError::InvalidStatus(format!(
                "Order {} is already at final status '{}'",
                order_id, current
            ))
        })?;

        let now = self.clock.now();
        let mut update = order::Entity::update_many()
            .col_expr(order::Column::DeliveryStatus, Expr::value(next.as_str()))
            .col_expr(order::Column::UpdatedAt, Expr::value(now));
        match next {
            DeliveryStatus::InTransit => {
                update = update.col_expr(order::Column::ShippedAt, Expr::value(now));
            }
            DeliveryStatus::Delivered => {
                update = update.col_expr(order::Column::DeliveredAt, Expr::value(now));
            }
            _ => {}
        }

        // Compare-and-set on the status we read
        let result = update
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::DeliveryStatus.eq(existing.delivery_status.as_str()))
            .exec(db)
            .await
            .map_err(db_error("progress order"))?;

        if result.rows_affected == 0 {
            warn!(order_id, from = %current, "Order status changed concurrently");
            return Err(ServiceError::Conflict(format!(
                "Order {} changed while progressing; retry",
                order_id
            )));
        }

        info!(order_id, from = %current, to = %next, "Order progressed");
        counter!("ast_orders.orders.progressed", 1);
        self.publish(Event::OrderStatusChanged {
            order_id,
            from: current,
            to: next,
            forced: false,
        })
        .await;

        Ok(StatusChangeResponse {
            id: existing.id,
            order_number: existing.order_number,
            previous_status: current.as_str().to_string(),
            status: next,
            next_status: next.next(),
        })
    }

    /// Sets `delivery_booked` with courier details, whatever the current status
    #[instrument(skip(self, request), fields(order_id = %order_id))]
    pub async fn book_delivery(
        &self,
        order_id: i32,
        request: BookDeliveryRequest,
    ) -> Result<OrderResponse, ServiceError> {
        let courier = non_blank(request.courier.as_deref());
        let tracking_number = non_blank(request.tracking_number.as_deref());
        let (courier, tracking_number) = match (courier, tracking_number) {
            (Some(courier), Some(tracking_number)) => (courier, tracking_number),
            _ => {
                return Err(ServiceError::BadRequest(
                    "courier and tracking_number are required".to_string(),
                ))
            }
        };

        let db = &*self.db_pool;
        let existing = find_order(db, order_id).await?;
        let previous_status = DeliveryStatus::from_stored(&existing.delivery_status);
        let now = self.clock.now();

        let mut entry = format!(
            "Delivery booked with {} (tracking {})",
            courier, tracking_number
        );
        if let Some(extra) = non_blank(request.notes.as_deref()) {
            entry.push_str(": ");
            entry.push_str(&extra);
        }
        let notes = append_note(existing.notes.as_deref(), &entry);

        let mut active = existing.into_active_model();
        active.delivery_status = Set(DeliveryStatus::DeliveryBooked.as_str().to_string());
        active.courier = Set(Some(courier.clone()));
        active.tracking_number = Set(Some(tracking_number.clone()));
        if let Some(date) = request.expected_delivery_date {
            active.expected_delivery_date = Set(Some(date));
        }
        active.notes = Set(Some(notes));
        active.updated_at = Set(now);

        let updated = active.update(db).await.map_err(db_error("book delivery"))?;

        info!(order_id, courier = %courier, "Delivery booked");
        counter!("ast_orders.orders.delivery_booked", 1);
        self.publish(Event::DeliveryBooked {
            order_id,
            courier,
            tracking_number,
        })
        .await;
        if let Some(from) = previous_status.filter(|s| *s != DeliveryStatus::DeliveryBooked) {
            self.publish(Event::OrderStatusChanged {
                order_id,
                from,
                to: DeliveryStatus::DeliveryBooked,
                forced: false,
            })
            .await;
        }

        Ok(updated.into())
    }

    /// Moves an order to any status, forward or backward, given the admin token
    #[instrument(skip(self, admin_token, request), fields(order_id = %order_id, to = %request.status))]
    pub async fn force_status(
        &self,
        order_id: i32,
        admin_token: Option<&str>,
        request: ForceStatusRequest,
    ) -> Result<StatusChangeResponse, ServiceError> {
        self.authorize_force(admin_token)?;

        let db = &*self.db_pool;
        let existing = find_order(db, order_id).await?;
        let from_stored = DeliveryStatus::from_stored(&existing.delivery_status);
        let from = from_stored
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|| existing.delivery_status.clone());
        let to = request.status;
        let now = self.clock.now();

        let mut entry = format!("Status forced from {} to {}", from, to);
        if let Some(reason) = non_blank(request.reason.as_deref()) {
            entry.push_str(": ");
            entry.push_str(&reason);
        }
        let notes = append_note(existing.notes.as_deref(), &entry);
        let order_number = existing.order_number.clone();

        let mut active = existing.into_active_model();
        active.delivery_status = Set(to.as_str().to_string());
        match to {
            DeliveryStatus::InTransit => active.shipped_at = Set(Some(now)),
            DeliveryStatus::Delivered => active.delivered_at = Set(Some(now)),
            _ => {}
        }
        active.notes = Set(Some(notes));
        active.updated_at = Set(now);
        active.update(db).await.map_err(db_error("force order status"))?;

        warn!(order_id, from = %from, to = %to, "Order status forced");
        counter!("ast_orders.orders.status_forced", 1);
        if let Some(from) = from_stored {
            self.publish(Event::OrderStatusChanged {
                order_id,
                from,
                to,
                forced: true,
            })
            .await;
        }

        Ok(StatusChangeResponse {
            id: order_id,
            order_number,
            previous_status: from,
            status: to,
            next_status: to.next(),
        })
    }

    /// Copies an order and its lines under a new order number, reset to `new`
    #[instrument(skip(self), fields(source_id = %source_id))]
    pub async fn duplicate_order(
        &self,
        source_id: i32,
    ) -> Result<CreatedOrderResponse, ServiceError> {
        let db = &*self.db_pool;
        let source = find_order(db, source_id).await?;
        let lines = find_lines(db, source_id).await?;

        let draft = NewOrder {
            customer_id: source.customer_id,
            customer_email: source.customer_email,
            customer_name: source.customer_name,
            shipping_address: source.shipping_address,
            billing_address: source.billing_address,
            subtotal: source.subtotal,
            tax_amount: source.tax_amount,
            shipping_amount: source.shipping_amount,
            total_amount: source.total_amount,
            payment_method: source.payment_method,
            payment_status: None,
            notes: Some(format!("Duplicated from {}", source.order_number)),
            lines: lines
                .into_iter()
                .map(|line| NewOrderLine {
                    product_id: line.product_id,
                    sku: line.sku,
                    product_name: line.product_name,
                    quantity: line.quantity,
                    unit_price: line.unit_price,
                    subtotal: line.subtotal,
                    image_url: line.image_url,
                })
                .collect(),
        };

        let created = self.insert_with_retry(&draft).await?;

        info!(
            source_id,
            order_id = created.id,
            order_number = %created.order_number,
            "Order duplicated"
        );
        counter!("ast_orders.orders.duplicated", 1);
        self.publish(Event::OrderDuplicated {
            order_id: created.id,
            order_number: created.order_number.clone(),
            source_id,
        })
        .await;

        Ok(CreatedOrderResponse {
            order_number: created.order_number.clone(),
            order: created.into(),
        })
    }

    /// Deletes an order and its lines
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn delete_order(&self, order_id: i32) -> Result<DeleteOrderResponse, ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(db_error("begin delete transaction"))?;

        find_order(&txn, order_id).await?;

        let lines = order_line::Entity::delete_many()
            .filter(order_line::Column::OrderId.eq(order_id))
            .exec(&txn)
            .await
            .map_err(db_error("delete order lines"))?;
        order::Entity::delete_by_id(order_id)
            .exec(&txn)
            .await
            .map_err(db_error("delete order"))?;

        txn.commit()
            .await
            .map_err(db_error("commit delete transaction"))?;

        info!(order_id, lines_deleted = lines.rows_affected, "Order deleted");
        counter!("ast_orders.orders.deleted", 1);
        self.publish(Event::OrderDeleted { order_id }).await;

        Ok(DeleteOrderResponse {
            id: order_id,
            deleted: true,
        })
    }

    /// Dashboard totals
    #[instrument(skip(self))]
    pub async fn order_metrics(&self) -> Result<OrderMetricsResponse, ServiceError> {
        let db = &*self.db_pool;
        let now = self.clock.now();
        let month_start = Utc
            .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
            .single()
            .unwrap_or(now);

        let count = |condition: Option<Condition>| async move {
            QueryBuilder::<order::Entity>::new()
                .filter_opt(condition)
                .count(db)
                .await
                .map_err(db_error("count orders"))
        };

        let total_orders = count(None).await?;
        let new_orders = count(Some(
            Condition::all().add(order::Column::DeliveryStatus.eq(DeliveryStatus::New.as_str())),
        ))
        .await?;
        let delivered_orders = count(Some(Condition::all().add(
            order::Column::DeliveryStatus.eq(DeliveryStatus::Delivered.as_str()),
        )))
        .await?;
        let pending_orders = count(Some(Condition::all().add(
            order::Column::DeliveryStatus.is_not_in([
                DeliveryStatus::New.as_str(),
                DeliveryStatus::Delivered.as_str(),
            ]),
        )))
        .await?;
        let this_month_orders = count(Some(
            Condition::all().add(order::Column::CreatedAt.gte(month_start)),
        ))
        .await?;

        let total_revenue: Option<Option<Decimal>> = order::Entity::find()
            .select_only()
            .column_as(Expr::col(order::Column::TotalAmount).sum(), "total_revenue")
            .into_tuple()
            .one(db)
            .await
            .map_err(db_error("sum order revenue"))?;

        Ok(OrderMetricsResponse {
            total_orders,
            total_revenue: total_revenue.flatten().unwrap_or(Decimal::ZERO).round_dp(2),
            new_orders,
            pending_orders,
            delivered_orders,
            this_month_orders,
        })
    }

    fn authorize_force(&self, admin_token: Option<&str>) -> Result<(), ServiceError> {
        let expected = self.settings.force_status_token.as_deref().ok_or_else(|| {
            ServiceError::Forbidden("Force status is disabled".to_string())
        })?;
        match admin_token {
            Some(token) if tokens_match(token.trim(), expected) => Ok(()),
            _ => {
                warn!("Rejected force status request with missing or invalid admin token");
                Err(ServiceError::Forbidden("Invalid admin token".to_string()))
            }
        }
    }

    async fn order_detail(&self, order: order::Model) -> Result<OrderDetailResponse, ServiceError> {
        let db = &*self.db_pool;
        let lines = find_lines(db, order.id).await?;
        let customer = load_customers(db, order.customer_id).await?;
        let next_status = DeliveryStatus::from_stored(&order.delivery_status)
            .and_then(DeliveryStatus::next);
        let contact = order.customer_id.and_then(|id| customer.get(&id).cloned());

        let mut response = OrderResponse::from(order);
        response.customer = contact;

        Ok(OrderDetailResponse {
            order: response,
            lines: lines.into_iter().map(OrderLineResponse::from).collect(),
            next_status,
        })
    }

    async fn insert_with_retry(&self, draft: &NewOrder) -> Result<order::Model, ServiceError> {
        let mut attempt = 0;
        loop {
            match self.insert_order(draft).await {
                Ok(created) => return Ok(created),
                Err(e) if e.is_unique_violation() => {
                    if attempt >= self.settings.order_number_max_retries {
                        error!(attempt, "Order number still colliding after retries");
                        return Err(ServiceError::Conflict(
                            "Could not allocate a unique order number".to_string(),
                        ));
                    }
                    attempt += 1;
                    warn!(attempt, "Order number collision; retrying");
                    counter!("ast_orders.orders.number_conflicts", 1);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn insert_order(&self, draft: &NewOrder) -> Result<order::Model, ServiceError> {
        let start = Instant::now();
        let db = &*self.db_pool;
        let now = self.clock.now();
        let item_count = draft.item_count()?;

        let txn = db.begin().await.map_err(db_error("begin create transaction"))?;

        let (customer_email, customer_name) = match draft.customer_id {
            Some(customer_id) => {
                let customer = require_customer(&txn, customer_id).await?;
                (
                    draft.customer_email.clone().or(Some(customer.email)),
                    draft.customer_name.clone().or(Some(customer.name)),
                )
            }
            None => (draft.customer_email.clone(), draft.customer_name.clone()),
        };

        let prefix = month_prefix(&self.settings.order_number_prefix, now);
        let order_number = next_order_number(&txn, &prefix, now)
            .await
            .map_err(db_error("allocate order number"))?;

        let created = order::ActiveModel {
            order_number: Set(order_number),
            customer_id: Set(draft.customer_id),
            customer_email: Set(customer_email),
            customer_name: Set(customer_name),
            shipping_address: Set(draft.shipping_address.clone()),
            billing_address: Set(draft.billing_address.clone()),
            subtotal: Set(draft.subtotal),
            tax_amount: Set(draft.tax_amount),
            shipping_amount: Set(draft.shipping_amount),
            total_amount: Set(draft.total_amount),
            item_count: Set(item_count),
            payment_method: Set(draft.payment_method.clone()),
            payment_status: Set(draft.payment_status.clone()),
            delivery_status: Set(DeliveryStatus::New.as_str().to_string()),
            notes: Set(draft.notes.clone()),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&txn)
        .await
        .map_err(db_error("insert order"))?;

        for line in &draft.lines {
            order_line::ActiveModel {
                order_id: Set(created.id),
                product_id: Set(line.product_id),
                sku: Set(line.sku.clone()),
                product_name: Set(line.product_name.clone()),
                quantity: Set(line.quantity),
                unit_price: Set(line.unit_price),
                subtotal: Set(line.subtotal),
                image_url: Set(line.image_url.clone()),
                created_at: Set(now),
                ..Default::default()
            }
            .insert(&txn)
            .await
            .map_err(db_error("insert order line"))?;
        }

        txn.commit()
            .await
            .map_err(db_error("commit create transaction"))?;

        histogram!("ast_orders.orders.insert_duration", start.elapsed());
        Ok(created)
    }

    async fn publish(&self, event: Event) {
        if let Some(event_sender) = &self.event_sender {
            let name = event.name();
            if let Err(e) = event_sender.send(event).await {
                warn!(error = %e, event = name, "Failed to send order event");
            }
        }
    }
}

fn db_error(operation: &'static str) -> impl Fn(DbErr) -> ServiceError {
    move |e| {
        error!(error = %e, "Failed to {}", operation);
        ServiceError::DatabaseError(e)
    }
}

/// Loads a referenced customer; an unknown id is a client error.
async fn require_customer<C>(conn: &C, customer_id: i32) -> Result<customer::Model, ServiceError>
where
    C: ConnectionTrait,
{
    customer::Entity::find_by_id(customer_id)
        .one(conn)
        .await
        .map_err(db_error("fetch customer"))?
        .ok_or_else(|| ServiceError::BadRequest(format!("Customer {} not found", customer_id)))
}

async fn find_order<C>(conn: &C, order_id: i32) -> Result<order::Model, ServiceError>
where
    C: ConnectionTrait,
{
    order::Entity::find_by_id(order_id)
        .one(conn)
        .await
        .map_err(db_error("fetch order"))?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
}

async fn find_lines<C>(conn: &C, order_id: i32) -> Result<Vec<order_line::Model>, ServiceError>
where
    C: ConnectionTrait,
{
    order_line::Entity::find()
        .filter(order_line::Column::OrderId.eq(order_id))
        .order_by_asc(order_line::Column::Id)
        .all(conn)
        .await
        .map_err(db_error("fetch order lines"))
}

async fn load_customers<C, I>(conn: &C, ids: I) -> Result<HashMap<i32, CustomerContact>, ServiceError>
where
    C: ConnectionTrait,
    I: IntoIterator<Item = i32>,
{
    let mut ids: Vec<i32> = ids.into_iter().collect();
    ids.sort_unstable();
    ids.dedup();
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let customers = customer::Entity::find()
        .filter(customer::Column::Id.is_in(ids))
        .all(conn)
        .await
        .map_err(db_error("fetch customers"))?;

    Ok(customers
        .into_iter()
        .map(|model| (model.id, CustomerContact::from(model)))
        .collect())
}

async fn status_counts<C>(conn: &C) -> Result<BTreeMap<String, u64>, ServiceError>
where
    C: ConnectionTrait,
{
    let rows: Vec<(String, i64)> = order::Entity::find()
        .select_only()
        .column(order::Column::DeliveryStatus)
        .column_as(Expr::col(order::Column::Id).count(), "count")
        .group_by(order::Column::DeliveryStatus)
        .into_tuple()
        .all(conn)
        .await
        .map_err(db_error("count orders by status"))?;

    let mut counts: BTreeMap<String, u64> = crate::services::order_status::PROGRESSION
        .iter()
        .map(|status| (status.as_str().to_string(), 0))
        .collect();
    for (status, count) in rows {
        let key = DeliveryStatus::from_stored(&status)
            .map(|s| s.as_str().to_string())
            .unwrap_or(status);
        *counts.entry(key).or_insert(0) += count.max(0) as u64;
    }
    Ok(counts)
}

fn parse_status(raw: &str) -> Result<DeliveryStatus, ServiceError> {
    raw.trim().parse::<DeliveryStatus>().map_err(|_| {
        ServiceError::ValidationError(format!(
            "Invalid status '{}'; expected one of: {}",
            raw,
            DeliveryStatus::valid_values()
        ))
    })
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Appends `entry` on its own line
fn append_note(existing: Option<&str>, entry: &str) -> String {
    match existing.map(str::trim_end).filter(|notes| !notes.is_empty()) {
        Some(notes) => format!("{}\n{}", notes, entry),
        None => entry.to_string(),
    }
}

fn tokens_match(given: &str, expected: &str) -> bool {
    given.len() == expected.len()
        && given
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

fn validate_non_negative(amount: &Decimal) -> Result<(), ValidationError> {
    if amount.is_sign_negative() && !amount.is_zero() {
        let mut err = ValidationError::new("non_negative");
        err.message = Some("amount must not be negative".into());
        return Err(err);
    }
    Ok(())
}
