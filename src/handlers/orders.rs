use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};

use crate::services::orders::{
    BookDeliveryRequest, CreateOrderRequest, CreatedOrderResponse, DeleteOrderResponse,
    ForceStatusRequest, ListOrdersQuery, OrderDetailResponse, OrderListResponse,
    OrderMetricsResponse, OrderResponse, StatusChangeResponse, UpdateOrderRequest,
};
use crate::{errors::ServiceError, ApiResponse, ApiResult, AppState};

/// Header carrying the shared secret for the force-status override
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Routes mounted under `/api/v1/orders`
pub fn orders_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_orders).post(create_order))
        .route("/metrics", get(order_metrics))
        .route("/by-number/:order_number", get(get_order_by_number))
        .route(
            "/:id",
            get(get_order).put(update_order).delete(delete_order),
        )
        .route("/:id/progress", post(progress_order))
        .route("/:id/book-delivery", post(book_delivery))
        .route("/:id/force-status", post(force_status))
        .route("/:id/duplicate", post(duplicate_order))
}

fn order_id(path: Result<Path<i32>, PathRejection>) -> Result<i32, ServiceError> {
    path.map(|Path(id)| id)
        .map_err(|_| ServiceError::BadRequest("Order id must be an integer".to_string()))
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ServiceError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| ServiceError::BadRequest(rejection.body_text()))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders",
    summary = "List orders",
    description = "Newest first, with optional search, status filter and limit/offset pagination",
    params(ListOrdersQuery),
    responses(
        (status = 200, description = "Orders retrieved successfully", body = ApiResponse<OrderListResponse>,
            headers(("X-Request-Id" = String, description = "Unique request id"))
        ),
        (status = 400, description = "Invalid request parameters", body = crate::errors::ErrorResponse),
        (status = 500, description = "Internal server error", body = crate::errors::ErrorResponse),
    ),
    tag = "orders"
)]
pub async fn list_orders(
    State(state): State<AppState>,
    query: Result<Query<ListOrdersQuery>, QueryRejection>,
) -> ApiResult<OrderListResponse> {
    let Query(query) =
        query.map_err(|rejection| ServiceError::BadRequest(rejection.body_text()))?;
    let orders = state.services.order.list_orders(query).await?;
    Ok(Json(ApiResponse::success(orders)))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/metrics",
    summary = "Order metrics",
    description = "Totals for the admin dashboard",
    responses(
        (status = 200, description = "Metrics computed", body = ApiResponse<OrderMetricsResponse>),
        (status = 500, description = "Internal server error", body = crate::errors::ErrorResponse),
    ),
    tag = "orders"
)]
pub async fn order_metrics(State(state): State<AppState>) -> ApiResult<OrderMetricsResponse> {
    let metrics = state.services.order.order_metrics().await?;
    Ok(Json(ApiResponse::success(metrics)))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    summary = "Get order",
    description = "Order with its lines, linked customer contact and next status",
    params(("id" = i32, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order retrieved successfully", body = ApiResponse<OrderDetailResponse>),
        (status = 400, description = "Malformed id", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    tag = "orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    id: Result<Path<i32>, PathRejection>,
) -> ApiResult<OrderDetailResponse> {
    let order = state.services.order.get_order(order_id(id)?).await?;
    Ok(Json(ApiResponse::success(order)))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/by-number/{order_number}",
    summary = "Get order by number",
    description = "Retrieve an order by its order number (e.g., AST-202503-0001)",
    params(("order_number" = String, Path, description = "Order number")),
    responses(
        (status = 200, description = "Order retrieved successfully", body = ApiResponse<OrderDetailResponse>),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    tag = "orders"
)]
pub async fn get_order_by_number(
    State(state): State<AppState>,
    Path(order_number): Path<String>,
) -> ApiResult<OrderDetailResponse> {
    let order = state
        .services
        .order
        .get_order_by_number(&order_number)
        .await?;
    Ok(Json(ApiResponse::success(order)))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders",
    summary = "Create order",
    description = "Create an order and its lines; the order number is generated",
    request_body = CreateOrderRequest,
    responses(
        (status = 201, description = "Order created successfully", body = ApiResponse<CreatedOrderResponse>,
            headers(("X-Request-Id" = String, description = "Unique request id"))
        ),
        (status = 400, description = "Invalid request data", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order number could not be allocated", body = crate::errors::ErrorResponse),
        (status = 500, description = "Internal server error", body = crate::errors::ErrorResponse),
    ),
    tag = "orders"
)]
pub async fn create_order(
    State(state): State<AppState>,
    body: Result<Json<CreateOrderRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<CreatedOrderResponse>>), ServiceError> {
    let created = state.services.order.create_order(json_body(body)?).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(created))))
}

#[utoipa::path(
    put,
    path = "/api/v1/orders/{id}",
    summary = "Update order",
    description = "Patch allow-listed order fields; absent fields are unchanged",
    params(("id" = i32, Path, description = "Order id")),
    request_body = UpdateOrderRequest,
    responses(
        (status = 200, description = "Order updated successfully", body = ApiResponse<OrderResponse>),
        (status = 400, description = "Empty patch or invalid status", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    tag = "orders"
)]
pub async fn update_order(
    State(state): State<AppState>,
    id: Result<Path<i32>, PathRejection>,
    body: Result<Json<UpdateOrderRequest>, JsonRejection>,
) -> ApiResult<OrderResponse> {
    let id = order_id(id)?;
    let updated = state
        .services
        .order
        .update_order(id, json_body(body)?)
        .await?;
    Ok(Json(ApiResponse::success(updated)))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/progress",
    summary = "Progress order",
    description = "Advance the order exactly one status along new, confirmed, delivery_booked, in_transit, delivered",
    params(("id" = i32, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order progressed", body = ApiResponse<StatusChangeResponse>),
        (status = 400, description = "Order already at final status", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order changed concurrently", body = crate::errors::ErrorResponse),
    ),
    tag = "orders"
)]
pub async fn progress_order(
    State(state): State<AppState>,
    id: Result<Path<i32>, PathRejection>,
) -> ApiResult<StatusChangeResponse> {
    let change = state.services.order.progress_order(order_id(id)?).await?;
    Ok(Json(ApiResponse::success(change)))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/book-delivery",
    summary = "Book delivery",
    description = "Record courier and tracking number and set the status to delivery_booked",
    params(("id" = i32, Path, description = "Order id")),
    request_body = BookDeliveryRequest,
    responses(
        (status = 200, description = "Delivery booked", body = ApiResponse<OrderResponse>),
        (status = 400, description = "Missing courier or tracking number", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    tag = "orders"
)]
pub async fn book_delivery(
    State(state): State<AppState>,
    id: Result<Path<i32>, PathRejection>,
    body: Result<Json<BookDeliveryRequest>, JsonRejection>,
) -> ApiResult<OrderResponse> {
    let id = order_id(id)?;
    let updated = state
        .services
        .order
        .book_delivery(id, json_body(body)?)
        .await?;
    Ok(Json(ApiResponse::success(updated)))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/force-status",
    summary = "Force order status",
    description = "Administrative override to any status, forward or backward",
    params(
        ("id" = i32, Path, description = "Order id"),
        ("x-admin-token" = String, Header, description = "Force-status shared secret"),
    ),
    request_body = ForceStatusRequest,
    responses(
        (status = 200, description = "Status forced", body = ApiResponse<StatusChangeResponse>),
        (status = 400, description = "Unknown status", body = crate::errors::ErrorResponse),
        (status = 403, description = "Override disabled or token invalid", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    tag = "orders"
)]
pub async fn force_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    id: Result<Path<i32>, PathRejection>,
    body: Result<Json<ForceStatusRequest>, JsonRejection>,
) -> ApiResult<StatusChangeResponse> {
    let id = order_id(id)?;
    let token = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());
    let change = state
        .services
        .order
        .force_status(id, token, json_body(body)?)
        .await?;
    Ok(Json(ApiResponse::success(change)))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/duplicate",
    summary = "Duplicate order",
    description = "Copy an order and its lines under a new order number with status new",
    params(("id" = i32, Path, description = "Source order id")),
    responses(
        (status = 201, description = "Order duplicated", body = ApiResponse<CreatedOrderResponse>),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order number could not be allocated", body = crate::errors::ErrorResponse),
    ),
    tag = "orders"
)]
pub async fn duplicate_order(
    State(state): State<AppState>,
    id: Result<Path<i32>, PathRejection>,
) -> Result<(StatusCode, Json<ApiResponse<CreatedOrderResponse>>), ServiceError> {
    let created = state.services.order.duplicate_order(order_id(id)?).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(created))))
}

#[utoipa::path(
    delete,
    path = "/api/v1/orders/{id}",
    summary = "Delete order",
    description = "Delete an order and all of its lines",
    params(("id" = i32, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order deleted", body = ApiResponse<DeleteOrderResponse>),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    tag = "orders"
)]
pub async fn delete_order(
    State(state): State<AppState>,
    id: Result<Path<i32>, PathRejection>,
) -> ApiResult<DeleteOrderResponse> {
    let deleted = state.services.order.delete_order(order_id(id)?).await?;
    Ok(Json(
        ApiResponse::success(deleted).with_message("Order deleted successfully"),
    ))
}
