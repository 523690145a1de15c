use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, PaginatorTrait, QueryFilter,
    QuerySelect, Set,
};
use tracing::{debug, warn};

use crate::entities::{order, order_number_sequence};

/// `{prefix}-{YYYY}{MM}`, e.g. `AST-202503`.
pub fn month_prefix(prefix: &str, now: DateTime<Utc>) -> String {
    format!("{}-{}", prefix, now.format("%Y%m"))
}

/// `{month_prefix}-{NNNN}`; sequences past 9999 widen rather than wrap.
pub fn format_order_number(month_prefix: &str, sequence: i32) -> String {
    format!("{}-{:04}", month_prefix, sequence)
}

/// Trailing sequence of an order number issued under `month_prefix`.
pub fn parse_sequence(order_number: &str, month_prefix: &str) -> Option<i32> {
    let tail = order_number.strip_prefix(month_prefix)?.strip_prefix('-')?;
    if tail.is_empty() || !tail.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    tail.parse().ok()
}

/// Allocates the next order number for `month_prefix` on `conn`.
///
/// Must run inside the transaction that inserts the order. The counter row is bumped
/// with a single `UPDATE ... SET last_value = last_value + 1`; the first allocation of a
/// month seeds it from the highest number already in `orders`, and a counter found behind
/// an existing number is moved past it. Two transactions seeding the same month collide on
/// the primary key, and the loser's caller retries.
pub async fn next_order_number<C>(
    conn: &C,
    month_prefix: &str,
    now: DateTime<Utc>,
) -> Result<String, DbErr>
where
    C: ConnectionTrait,
{
    let bumped = order_number_sequence::Entity::update_many()
        .col_expr(
            order_number_sequence::Column::LastValue,
            Expr::col(order_number_sequence::Column::LastValue).add(1),
        )
        .col_expr(order_number_sequence::Column::UpdatedAt, Expr::value(now))
        .filter(order_number_sequence::Column::Prefix.eq(month_prefix))
        .exec(conn)
        .await?;

    if bumped.rows_affected > 0 {
        let row = order_number_sequence::Entity::find_by_id(month_prefix.to_string())
            .one(conn)
            .await?
            .ok_or_else(|| {
                DbErr::RecordNotFound(format!("order number sequence {}", month_prefix))
            })?;
        let candidate = format_order_number(month_prefix, row.last_value);
        if !number_taken(conn, &candidate).await? {
            return Ok(candidate);
        }
        return realign(conn, month_prefix, row.last_value, now).await;
    }

    let seed = highest_existing_sequence(conn, month_prefix).await?;
    let next = seed + 1;
    debug!(month_prefix, seed, "Seeding order number sequence");

    order_number_sequence::ActiveModel {
        prefix: Set(month_prefix.to_string()),
        last_value: Set(next),
        updated_at: Set(now),
    }
    .insert(conn)
    .await?;

    Ok(format_order_number(month_prefix, next))
}

/// Moves a counter that fell behind `orders` past the highest number already issued.
async fn realign<C>(
    conn: &C,
    month_prefix: &str,
    last_value: i32,
    now: DateTime<Utc>,
) -> Result<String, DbErr>
where
    C: ConnectionTrait,
{
    let highest = highest_existing_sequence(conn, month_prefix).await?;
    let next = highest.max(last_value) + 1;
    warn!(
        month_prefix,
        last_value, highest, "Order number sequence behind existing orders; realigning"
    );

    order_number_sequence::Entity::update_many()
        .col_expr(order_number_sequence::Column::LastValue, Expr::value(next))
        .col_expr(order_number_sequence::Column::UpdatedAt, Expr::value(now))
        .filter(order_number_sequence::Column::Prefix.eq(month_prefix))
        .exec(conn)
        .await?;

    Ok(format_order_number(month_prefix, next))
}

async fn number_taken<C>(conn: &C, order_number: &str) -> Result<bool, DbErr>
where
    C: ConnectionTrait,
{
    let existing = order::Entity::find()
        .filter(order::Column::OrderNumber.eq(order_number))
        .count(conn)
        .await?;
    Ok(existing > 0)
}

async fn highest_existing_sequence<C>(conn: &C, month_prefix: &str) -> Result<i32, DbErr>
where
    C: ConnectionTrait,
{
    let numbers: Vec<String> = order::Entity::find()
        .select_only()
        .column(order::Column::OrderNumber)
        .filter(order::Column::OrderNumber.starts_with(format!("{}-", month_prefix)))
        .into_tuple()
        .all(conn)
        .await?;

    Ok(numbers
        .iter()
        .filter_map(|number| parse_sequence(number, month_prefix))
        .max()
        .unwrap_or(0))
}
