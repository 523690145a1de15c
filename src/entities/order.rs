use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// The `orders` table.
///
/// `delivery_status` is the only persisted status; the `status` exposed over HTTP is
/// derived from it.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    /// `AST-YYYYMM-NNNN`, unique
    #[sea_orm(unique)]
    pub order_number: String,
    pub customer_id: Option<i32>,
    /// Snapshot of the customer at order time
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    pub shipping_address: Option<Json>,
    pub billing_address: Option<Json>,
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub shipping_amount: Decimal,
    pub total_amount: Decimal,
    pub item_count: i32,
    pub payment_method: Option<String>,
    pub payment_status: Option<String>,
    pub delivery_status: String,
    pub tracking_number: Option<String>,
    pub courier: Option<String>,
    pub expected_delivery_date: Option<NaiveDate>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    /// Newline-separated log entries
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_line::Entity")]
    OrderLines,
    #[sea_orm(
        belongs_to = "super::customer::Entity",
        from = "Column::CustomerId",
        to = "super::customer::Column::Id",
        on_delete = "SetNull"
    )]
    Customer,
}

impl Related<super::order_line::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderLines.def()
    }
}

impl Related<super::customer::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Customer.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
