use sea_orm::sea_query::{Expr, Func, LikeExpr};
use sea_orm::{
    ColumnTrait, Condition, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, Select,
};

/// Filtered, ordered, limit/offset query over a single entity.
///
/// Every predicate is a bound [`Condition`]; nothing is spliced into SQL text.
pub struct QueryBuilder<E: EntityTrait> {
    query: Select<E>,
    limit: u64,
    offset: u64,
}

impl<E: EntityTrait> Default for QueryBuilder<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: EntityTrait> QueryBuilder<E> {
    /// Create a new query builder
    pub fn new() -> Self {
        Self {
            query: E::find(),
            limit: 50,
            offset: 0,
        }
    }

    /// Add pagination; `limit` is clamped to `1..=max_limit`
    pub fn paginate(mut self, limit: u64, offset: u64, max_limit: u64) -> Self {
        self.limit = limit.clamp(1, max_limit.max(1));
        self.offset = offset;
        self
    }

    /// Add a filter condition
    pub fn filter(mut self, condition: Condition) -> Self {
        self.query = self.query.filter(condition);
        self
    }

    /// Add a filter condition when one is present
    pub fn filter_opt(self, condition: Option<Condition>) -> Self {
        match condition {
            Some(condition) => self.filter(condition),
            None => self,
        }
    }

    /// Add ordering
    pub fn order_by<C>(mut self, column: C, desc: bool) -> Self
    where
        C: ColumnTrait,
    {
        self.query = if desc {
            self.query.order_by_desc(column)
        } else {
            self.query.order_by_asc(column)
        };
        self
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Execute the query, returning one page and the total matching the same filters
    pub async fn execute<C>(self, db: &C) -> Result<(Vec<E::Model>, u64), sea_orm::DbErr>
    where
        C: ConnectionTrait,
        E::Model: Send + Sync,
    {
        let total = self.query.clone().count(db).await?;

        let items = self
            .query
            .limit(self.limit)
            .offset(self.offset)
            .all(db)
            .await?;

        Ok((items, total))
    }

    /// Execute and return only the count
    pub async fn count<C>(self, db: &C) -> Result<u64, sea_orm::DbErr>
    where
        C: ConnectionTrait,
        E::Model: Send + Sync,
    {
        self.query.count(db).await
    }
}

/// Helper for building OR-combined search conditions
#[derive(Default)]
pub struct SearchBuilder {
    conditions: Vec<Condition>,
}

impl SearchBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Case-insensitive substring match; `%`, `_` and `\` in `term` match literally
    pub fn add_like<C: ColumnTrait>(mut self, column: C, term: &str) -> Self {
        if !term.is_empty() {
            let pattern = format!("%{}%", escape_like(&term.to_lowercase()));
            self.conditions.push(
                Condition::all().add(
                    Expr::expr(Func::lower(Expr::col(column)))
                        .like(LikeExpr::new(pattern).escape('\\')),
                ),
            );
        }
        self
    }

    /// Add an exact match condition
    pub fn add_eq<C: ColumnTrait, V>(mut self, column: C, value: V) -> Self
    where
        V: Into<sea_orm::Value>,
    {
        self.conditions.push(Condition::all().add(column.eq(value)));
        self
    }

    /// Build the final condition
    pub fn build(self) -> Option<Condition> {
        if self.conditions.is_empty() {
            None
        } else {
            Some(
                self.conditions
                    .into_iter()
                    .fold(Condition::any(), |acc, cond| acc.add(cond)),
            )
        }
    }
}

fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
