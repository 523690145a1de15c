use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "AST Orders API",
        version = "1.0.0",
        description = r#"
# Order lifecycle API

Back-office order management for the storefront admin console.

## Status progression

`new` → `confirmed` → `delivery_booked` → `in_transit` → `delivered`

- `POST /orders/{id}/progress` advances exactly one step.
- `POST /orders/{id}/book-delivery` jumps to `delivery_booked` from any status.
- `POST /orders/{id}/force-status` moves to any status and requires `x-admin-token`.

## Order numbers

`AST-YYYYMM-NNNN`, sequenced per calendar month.

## Error Handling

```json
{
  "success": false,
  "error": "Not found: Order 42 not found",
  "request_id": "6f1c...",
  "timestamp": "2025-03-09T10:30:00Z"
}
```
        "#,
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "orders", description = "Order lifecycle endpoints")
    ),
    paths(
        crate::handlers::orders::list_orders,
        crate::handlers::orders::order_metrics,
        crate::handlers::orders::get_order,
        crate::handlers::orders::get_order_by_number,
        crate::handlers::orders::create_order,
        crate::handlers::orders::update_order,
        crate::handlers::orders::progress_order,
        crate::handlers::orders::book_delivery,
        crate::handlers::orders::force_status,
        crate::handlers::orders::duplicate_order,
        crate::handlers::orders::delete_order,
    ),
    components(
        schemas(
            crate::services::order_status::DeliveryStatus,
            crate::services::orders::CreateOrderRequest,
            crate::services::orders::OrderLineInput,
            crate::services::orders::UpdateOrderRequest,
            crate::services::orders::BookDeliveryRequest,
            crate::services::orders::ForceStatusRequest,
            crate::services::orders::OrderResponse,
            crate::services::orders::OrderLineResponse,
            crate::services::orders::OrderDetailResponse,
            crate::services::orders::CustomerContact,
            crate::services::orders::CreatedOrderResponse,
            crate::services::orders::OrderListResponse,
            crate::services::orders::StatusChangeResponse,
            crate::services::orders::OrderMetricsResponse,
            crate::services::orders::DeleteOrderResponse,
            crate::ResponseMeta,
            crate::errors::ErrorResponse
        )
    )
)]
pub struct ApiDocV1;

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui")
        .url("/api-docs/openapi.json", ApiDocV1::openapi())
        .config(utoipa_swagger_ui::Config::from("/api-docs/openapi.json").try_it_out_enabled(true))
}
