//! Lazily evaluated queries
//!
//! A [`Query`] only describes a read. Nothing reaches the database until one
//! of the terminal operations ([`to_list`](Query::to_list),
//! [`first`](Query::first), [`count`](Query::count), [`any`](Query::any),
//! [`all`](Query::all), [`page`](Query::page)) is awaited. Rows are
//! materialised through the session the query was created from, so every
//! returned instance is tracked there.

use crate::entity::{Entity, EntityHandle};
use crate::error::{DataError, Result};
use crate::filter::{Filter, SqlFragment};
use crate::mapping::{quote_ident, EntityMap};
use crate::pagination::{Page, PageRequest};
use crate::session::Session;
use bridge_traits::database::{QueryRow, QueryValue};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
enum QuerySource {
    Table,
    Sql { sql: String, params: Vec<QueryValue> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SortOrder {
    Ascending,
    Descending,
}

pub struct Query<T: Entity> {
    session: Arc<Session>,
    source: QuerySource,
    filters: Vec<Filter>,
    order: Vec<(String, SortOrder)>,
    skip: Option<i64>,
    take: Option<i64>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> Query<T> {
    pub(crate) fn table(session: Arc<Session>) -> Self {
        Self::with_source(session, QuerySource::Table)
    }

    /// Rows of a caller supplied `SELECT`, which must return the entity's
    /// mapped columns
    pub(crate) fn sql(session: Arc<Session>, sql: String, params: Vec<QueryValue>) -> Self {
        Self::with_source(session, QuerySource::Sql { sql, params })
    }

    fn with_source(session: Arc<Session>, source: QuerySource) -> Self {
        Self {
            session,
            source,
            filters: Vec::new(),
            order: Vec::new(),
            skip: None,
            take: None,
            _entity: PhantomData,
        }
    }

    /// Keep rows matching `filter`, in addition to earlier filters
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, column: impl Into<String>) -> Self {
        self.order.push((column.into(), SortOrder::Ascending));
        self
    }

    pub fn order_by_desc(mut self, column: impl Into<String>) -> Self {
        self.order.push((column.into(), SortOrder::Descending));
        self
    }

    /// Skip the first `count` rows; negative counts skip nothing
    pub fn skip(mut self, count: i64) -> Self {
        self.skip = Some(count.max(0));
        self
    }

    /// Return at most `count` rows; negative counts return nothing
    pub fn take(mut self, count: i64) -> Self {
        self.take = Some(count.max(0));
        self
    }

    fn map(&self) -> Result<&EntityMap> {
        self.session.registry().map::<T>()
    }

    /// Render the `SELECT`, with or without the skip/take window
    fn select(&self, windowed: bool) -> Result<SqlFragment> {
        let map = self.map()?;
        let mut out = SqlFragment::default();

        out.sql.push_str("SELECT * FROM ");
        match &self.source {
            QuerySource::Table => out.sql.push_str(&quote_ident(map.table())),
            QuerySource::Sql { sql, params } => {
                out.sql.push('(');
                out.sql.push_str(sql);
                out.sql.push_str(") AS ");
                out.sql.push_str(&quote_ident(map.table()));
                out.params.extend(params.iter().cloned());
            }
        }

        for (index, filter) in self.filters.iter().enumerate() {
            out.sql
                .push_str(if index == 0 { " WHERE (" } else { " AND (" });
            let fragment = filter.render(Some(map))?;
            out.sql.push_str(&fragment.sql);
            out.sql.push(')');
            out.params.extend(fragment.params);
        }

        if !self.order.is_empty() {
            let mut terms = Vec::with_capacity(self.order.len());
            for (column, order) in &self.order {
                if !map.has_column(column) {
                    return Err(DataError::invalid_argument(
                        "order_by",
                        format!("column {} is not mapped on {}", column, map.table()),
                    ));
                }
                let direction = match order {
                    SortOrder::Ascending => "ASC",
                    SortOrder::Descending => "DESC",
                };
                terms.push(format!("{} {}", quote_ident(column), direction));
            }
            out.sql.push_str(" ORDER BY ");
            out.sql.push_str(&terms.join(", "));
        }

        if windowed {
            match (self.take, self.skip) {
                (Some(take), Some(skip)) => {
                    out.sql.push_str(&format!(" LIMIT {} OFFSET {}", take, skip))
                }
                (Some(take), None) => out.sql.push_str(&format!(" LIMIT {}", take)),
                (None, Some(skip)) => out.sql.push_str(&format!(" LIMIT -1 OFFSET {}", skip)),
                (None, None) => {}
            }
        }

        Ok(out)
    }

    /// The SQL text and parameters [`to_list`](Self::to_list) would run
    pub fn to_sql(&self) -> Result<(String, Vec<QueryValue>)> {
        let fragment = self.select(true)?;
        Ok((fragment.sql, fragment.params))
    }

    async fn fetch(&self, fragment: SqlFragment) -> Result<Vec<QueryRow>> {
        debug!(entity = T::TABLE, sql = %fragment.sql, "Running query");
        self.session.query_rows(&fragment.sql, &fragment.params).await
    }

    async fn scalar(&self, fragment: SqlFragment) -> Result<i64> {
        let rows = self.fetch(fragment).await?;
        rows.first()
            .and_then(|row| row.get("Value"))
            .and_then(QueryValue::as_i64)
            .ok_or_else(|| DataError::Materialization {
                table: T::TABLE.to_string(),
                message: "scalar query returned no value".to_string(),
            })
    }

    fn wrap(inner: SqlFragment, prefix: &str, suffix: &str) -> SqlFragment {
        SqlFragment {
            sql: format!("{}{}{}", prefix, inner.sql, suffix),
            params: inner.params,
        }
    }

    /// Materialise every matching row
    pub async fn to_list(&self) -> Result<Vec<EntityHandle<T>>> {
        let rows = self.fetch(self.select(true)?).await?;
        self.session.materialize(rows)
    }

    /// The first matching row, if any
    pub async fn first(&self) -> Result<Option<EntityHandle<T>>> {
        let mut query = self.clone();
        query.take = Some(1);
        Ok(query.to_list().await?.into_iter().next())
    }

    /// Number of matching rows
    pub async fn count(&self) -> Result<i64> {
        let inner = self.select(true)?;
        self.scalar(Self::wrap(inner, "SELECT COUNT(*) AS \"Value\" FROM (", ") AS \"q\""))
            .await
    }

    /// Whether any row matches
    pub async fn any(&self) -> Result<bool> {
        let inner = self.select(true)?;
        let exists = self
            .scalar(Self::wrap(inner, "SELECT EXISTS(", ") AS \"Value\""))
            .await?;
        Ok(exists != 0)
    }

    /// Whether every matching row also satisfies `predicate`. Rows for which
    /// `predicate` evaluates to `NULL` do not count against it.
    pub async fn all(&self, predicate: &Filter) -> Result<bool> {
        let map = self.map()?;
        let condition = predicate.render(Some(map))?;
        let inner = self.select(true)?;

        let mut params = inner.params;
        params.extend(condition.params);
        let fragment = SqlFragment {
            sql: format!(
                "SELECT NOT EXISTS(SELECT 1 FROM ({}) AS \"q\" WHERE NOT ({})) AS \"Value\"",
                inner.sql, condition.sql
            ),
            params,
        };
        Ok(self.scalar(fragment).await? != 0)
    }

    /// One window of the matching rows plus their total count. Any
    /// skip/take set on the query is replaced by `request`.
    pub async fn page(&self, request: PageRequest) -> Result<Page<EntityHandle<T>>> {
        let unwindowed = self.select(false)?;
        let total = self
            .scalar(Self::wrap(
                unwindowed,
                "SELECT COUNT(*) AS \"Value\" FROM (",
                ") AS \"q\"",
            ))
            .await?;

        let mut window = self.clone();
        window.skip = Some(request.offset);
        window.take = Some(request.limit);
        let items = window.to_list().await?;

        Ok(Page::new(items, total, request))
    }
}

impl<T: Entity> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            source: self.source.clone(),
            filters: self.filters.clone(),
            order: self.order.clone(),
            skip: self.skip,
            take: self.take,
            _entity: PhantomData,
        }
    }
}

impl<T: Entity> fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("entity", &T::TABLE)
            .field("source", &self.source)
            .field("filters", &self.filters)
            .field("order", &self.order)
            .field("skip", &self.skip)
            .field("take", &self.take)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SqliteAdapter;
    use crate::entity::ActorId;
    use crate::test_support::{note, registry, Note};
    use crate::tracker::EntityState;
    use bridge_traits::database::{DatabaseConfig, NodeType};
    use bridge_traits::time::SystemClock;

    async fn seeded_session() -> Arc<Session> {
        let adapter = SqliteAdapter::connect_lazy(DatabaseConfig::in_memory()).unwrap();
        let session = Arc::new(Session::new(
            NodeType::Slave,
            Arc::new(adapter),
            registry(),
            Arc::new(SystemClock),
        ));
        session.ensure_created().await.unwrap();
        for (id, body) in [(1, "apple"), (2, "banana"), (3, "cherry"), (4, "avocado")] {
            session.set_state(&note(id, body), EntityState::Added).unwrap();
        }
        session.save_changes(ActorId::ANONYMOUS).await.unwrap();
        session.detach_all();
        session
    }

    #[tokio::test]
    async fn test_to_sql_is_lazy_and_composable() {
        let session = seeded_session().await;
        let query = Query::<Note>::table(session)
            .filter(Filter::like("Body", "a%"))
            .order_by_desc("Id")
            .skip(1)
            .take(2);

        let (sql, params) = query.to_sql().unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM \"Note\" WHERE (\"Body\" LIKE ?) ORDER BY \"Id\" DESC LIMIT 2 OFFSET 1"
        );
        assert_eq!(params, vec![QueryValue::Text("a%".to_string())]);
    }

    #[tokio::test]
    async fn test_terminals() {
        let session = seeded_session().await;
        let query = Query::<Note>::table(session).filter(Filter::like("Body", "a%"));

        assert_eq!(query.count().await.unwrap(), 2);
        assert!(query.any().await.unwrap());
        assert!(query.all(&Filter::ne("Body", "banana")).await.unwrap());
        assert!(!query.all(&Filter::eq("Body", "apple")).await.unwrap());

        let first = query.clone().order_by_desc("Id").first().await.unwrap().unwrap();
        assert_eq!(first.id(), 4);
        let ids: Vec<i64> = query.order_by("Id").to_list().await.unwrap().iter().map(|n| n.id()).collect();
        assert_eq!(ids, vec![1, 4]);
    }

    #[tokio::test]
    async fn test_page() {
        let session = seeded_session().await;
        let page = Query::<Note>::table(session)
            .order_by("Id")
            .page(PageRequest::new(2, 3))
            .await
            .unwrap();

        assert_eq!(page.total, 4);
        assert_eq!(page.pages, 2);
        let ids: Vec<i64> = page.items.iter().map(|n| n.id()).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_sql_source() {
        let session = seeded_session().await;
        let query = Query::<Note>::sql(
            session,
            "SELECT * FROM \"Note\" WHERE \"Id\" > ?".to_string(),
            vec![QueryValue::Integer(2)],
        )
        .filter(Filter::ne("Body", "cherry"));

        let notes = query.to_list().await.unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].read().body, "avocado");
    }

    #[tokio::test]
    async fn test_unknown_columns_are_rejected() {
        let session = seeded_session().await;

        let err = Query::<Note>::table(Arc::clone(&session))
            .order_by("Missing")
            .to_list()
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::InvalidArgument { ref field, .. } if field == "order_by"));

        let err = Query::<Note>::table(session)
            .filter(Filter::eq("Missing", 1))
            .count()
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn test_results_are_tracked_once() {
        let session = seeded_session().await;
        let query = Query::<Note>::table(Arc::clone(&session));

        let first = query.to_list().await.unwrap();
        let second = query.to_list().await.unwrap();

        assert_eq!(session.tracked_count(), 4);
        assert!(first.iter().zip(&second).all(|(a, b)| a.same_instance(b)));
    }
}
