//! List/CRUD query building and execution for user tables.
//!
//! Rows travel as JSON in both directions: the projection wraps an ordered
//! column list in `to_jsonb(...)` so responses never depend on compile-time
//! row types, and write values are bound as text parameters cast to the
//! column's PostgreSQL type.

use serde_json::{Map, Value};
use sqlx::{postgres::PgArguments, query::Query, PgConnection, Postgres, Row};

use crate::{
    error::DbError,
    filter::{self, SqlParam},
    schema::{quote_ident, ColumnDescriptor, SchemaSnapshot, TableDescriptor},
};

pub const DEFAULT_PER_PAGE: i64 = 20;
pub const MAX_PER_PAGE: i64 = 500;

/// Raw list-endpoint options as they arrive from the query string.
#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    pub filter: Option<String>,
    pub sort: Option<String>,
    pub fields: Option<String>,
    pub expand: Option<String>,
    pub search: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
    pub skip_total: bool,
}

#[derive(Clone, Debug)]
pub struct ListResult {
    pub items: Vec<Value>,
    pub page: i64,
    pub per_page: i64,
    /// `-1` when the caller asked to skip the count.
    pub total_items: i64,
}

/// Attaches accumulated parameters to a query in order.
pub fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [SqlParam],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            SqlParam::Text(value) => query.bind(value),
            SqlParam::Int(value) => query.bind(value),
            SqlParam::TextArray(values) => query.bind(values),
        };
    }
    query
}

fn parse_page(opts: &ListOptions) -> Result<(i64, i64), DbError> {
    let page = opts.page.unwrap_or(1);
    if page < 1 {
        return Err(DbError::validation("page must be >= 1"));
    }
    let per_page = opts.per_page.unwrap_or(DEFAULT_PER_PAGE);
    if !(1..=MAX_PER_PAGE).contains(&per_page) {
        return Err(DbError::validation(format!(
            "perPage must be between 1 and {MAX_PER_PAGE}"
        )));
    }
    Ok((page, per_page))
}

fn parse_fields<'t>(
    table: &'t TableDescriptor,
    fields: Option<&str>,
) -> Result<Vec<&'t ColumnDescriptor>, DbError> {
    match fields {
        None => Ok(table.columns.iter().collect()),
        Some(raw) if raw.trim() == "*" => Ok(table.columns.iter().collect()),
        Some(raw) => {
            let mut out = Vec::new();
            for name in raw.split(',') {
                let name = name.trim();
                if name.is_empty() {
                    continue;
                }
                let column = table
                    .column(name)
                    .ok_or_else(|| DbError::validation(format!("unknown column \"{name}\"")))?;
                out.push(column);
            }
            if out.is_empty() {
                return Err(DbError::validation("fields must name at least one column"));
            }
            Ok(out)
        }
    }
}

fn parse_sort(table: &TableDescriptor, sort: &str) -> Result<Vec<(String, bool)>, DbError> {
    let mut out = Vec::new();
    for part in sort.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (name, descending) = match part.strip_prefix('-') {
            Some(rest) => (rest, true),
            None => (part.strip_prefix('+').unwrap_or(part), false),
        };
        let column = table
            .column(name)
            .ok_or_else(|| DbError::validation(format!("unknown sort column \"{name}\"")))?;
        out.push((column.name.clone(), descending));
    }
    Ok(out)
}

/// `to_tsvector('simple', coalesce(a,'') || ' ' || ...)` over the table's
/// text columns.
fn search_vector(table: &TableDescriptor) -> Option<String> {
    let text_columns: Vec<String> = table
        .columns
        .iter()
        .filter(|c| c.pg_type.is_searchable_text())
        .map(|c| format!("coalesce({}, '')", quote_ident(&c.name)))
        .collect();
    if text_columns.is_empty() {
        return None;
    }
    Some(format!(
        "to_tsvector('simple', {})",
        text_columns.join(" || ' ' || ")
    ))
}

fn projection(columns: &[&ColumnDescriptor]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Runs a list query: filter + search + sort + pagination, then an optional
/// COUNT over the same predicate.
pub async fn run_list(
    conn: &mut PgConnection,
    table: &TableDescriptor,
    opts: &ListOptions,
) -> Result<ListResult, DbError> {
    let (page, per_page) = parse_page(opts)?;
    let columns = parse_fields(table, opts.fields.as_deref())?;

    let mut params: Vec<SqlParam> = Vec::new();
    let mut predicates: Vec<String> = Vec::new();

    if let Some(raw) = opts.filter.as_deref() {
        predicates.push(filter::compile(raw, table, &mut params)?);
    }

    let mut rank_expr = None;
    if let Some(term) = opts.search.as_deref().filter(|t| !t.trim().is_empty()) {
        let vector = search_vector(table).ok_or_else(|| {
            DbError::validation("table has no text columns to search")
        })?;
        params.push(SqlParam::Text(term.to_owned()));
        let placeholder = params.len();
        predicates.push(format!(
            "{vector} @@ websearch_to_tsquery('simple', ${placeholder})"
        ));
        rank_expr = Some(format!(
            "ts_rank({vector}, websearch_to_tsquery('simple', ${placeholder}))"
        ));
    }

    let where_clause = if predicates.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", predicates.join(" AND "))
    };
    let predicate_params = params.len();

    let order_clause = match opts.sort.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(sort) => {
            let keys = parse_sort(table, sort)?;
            if keys.is_empty() {
                default_order(table, rank_expr.as_deref())
            } else {
                let parts: Vec<String> = keys
                    .iter()
                    .map(|(name, desc)| {
                        format!("{} {}", quote_ident(name), if *desc { "DESC" } else { "ASC" })
                    })
                    .collect();
                format!(" ORDER BY {}", parts.join(", "))
            }
        }
        None => default_order(table, rank_expr.as_deref()),
    };

    params.push(SqlParam::Int(per_page));
    let limit_placeholder = params.len();
    params.push(SqlParam::Int((page - 1) * per_page));
    let offset_placeholder = params.len();

    let inner = format!(
        "SELECT {} FROM {}{}{} LIMIT ${} OFFSET ${}",
        projection(&columns),
        table.qualified(),
        where_clause,
        order_clause,
        limit_placeholder,
        offset_placeholder,
    );
    let items_sql = format!("SELECT to_jsonb(sub) AS rec FROM ({inner}) sub");

    let rows = bind_params(sqlx::query(&items_sql), &params)
        .fetch_all(&mut *conn)
        .await?;
    let items = rows
        .into_iter()
        .map(|row| row.try_get::<Value, _>("rec").map_err(DbError::from))
        .collect::<Result<Vec<_>, _>>()?;

    let total_items = if opts.skip_total {
        -1
    } else {
        let count_sql = format!("SELECT COUNT(*) FROM {}{}", table.qualified(), where_clause);
        let count_params = &params[..predicate_params];
        let row = bind_params(sqlx::query(&count_sql), count_params)
            .fetch_one(&mut *conn)
            .await?;
        row.try_get::<i64, _>(0).map_err(DbError::from)?
    };

    Ok(ListResult {
        items,
        page,
        per_page,
        total_items,
    })
}

fn default_order(table: &TableDescriptor, rank_expr: Option<&str>) -> String {
    if let Some(rank) = rank_expr {
        return format!(" ORDER BY {rank} DESC");
    }
    if let Some(pk) = &table.primary_key {
        return format!(" ORDER BY {} ASC", quote_ident(pk));
    }
    match table.columns.first() {
        Some(col) => format!(" ORDER BY {} ASC", quote_ident(&col.name)),
        None => String::new(),
    }
}

fn primary_key<'t>(table: &'t TableDescriptor) -> Result<&'t ColumnDescriptor, DbError> {
    let pk = table.primary_key.as_deref().ok_or_else(|| {
        DbError::not_found(format!(
            "table \"{}\" has no single-column primary key",
            table.name
        ))
    })?;
    table
        .column(pk)
        .ok_or_else(|| DbError::not_found(format!("primary key column \"{pk}\" missing")))
}

/// Fetches one record by primary key, projected to `fields`.
pub async fn fetch_record(
    conn: &mut PgConnection,
    table: &TableDescriptor,
    id: &str,
    fields: Option<&str>,
) -> Result<Option<Value>, DbError> {
    let pk = primary_key(table)?;
    let columns = parse_fields(table, fields)?;
    let sql = format!(
        "SELECT to_jsonb(sub) AS rec FROM (SELECT {} FROM {} WHERE {} = $1::{}) sub",
        projection(&columns),
        table.qualified(),
        quote_ident(&pk.name),
        pk.pg_type.cast_name(),
    );
    let row = sqlx::query(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(|r| r.try_get::<Value, _>("rec").map_err(DbError::from))
        .transpose()
}

/// Converts one JSON body value into a bindable text parameter for `column`.
fn encode_value(column: &ColumnDescriptor, value: &Value) -> Result<Option<String>, DbError> {
    match value {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(b.to_string())),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::String(s) => Ok(Some(s.clone())),
        Value::Array(_) | Value::Object(_) => {
            if column.pg_type.is_json() {
                serde_json::to_string(value)
                    .map(Some)
                    .map_err(|err| DbError::validation(err.to_string()))
            } else {
                Err(DbError::validation(format!(
                    "column \"{}\" does not accept structured values",
                    column.name
                )))
            }
        }
    }
}

fn validate_body<'t>(
    table: &'t TableDescriptor,
    body: &Map<String, Value>,
) -> Result<Vec<(&'t ColumnDescriptor, Option<String>)>, DbError> {
    let mut out = Vec::with_capacity(body.len());
    for (name, value) in body {
        let column = table
            .column(name)
            .ok_or_else(|| DbError::validation(format!("unknown column \"{name}\"")))?;
        out.push((column, encode_value(column, value)?));
    }
    Ok(out)
}

fn reject_view(table: &TableDescriptor) -> Result<(), DbError> {
    if table.is_view {
        return Err(DbError::validation(format!(
            "\"{}\" is a view and is read-only",
            table.name
        )));
    }
    Ok(())
}

/// `INSERT ... RETURNING` the full row as JSON.
pub async fn insert_record(
    conn: &mut PgConnection,
    table: &TableDescriptor,
    body: &Map<String, Value>,
) -> Result<Value, DbError> {
    reject_view(table)?;
    let values = validate_body(table, body)?;

    let sql = if values.is_empty() {
        format!(
            "WITH ins AS (INSERT INTO {} DEFAULT VALUES RETURNING *) SELECT to_jsonb(ins) AS rec FROM ins",
            table.qualified()
        )
    } else {
        let columns: Vec<String> = values.iter().map(|(c, _)| quote_ident(&c.name)).collect();
        let placeholders: Vec<String> = values
            .iter()
            .enumerate()
            .map(|(i, (c, _))| format!("${}::{}", i + 1, c.pg_type.cast_name()))
            .collect();
        format!(
            "WITH ins AS (INSERT INTO {} ({}) VALUES ({}) RETURNING *) SELECT to_jsonb(ins) AS rec FROM ins",
            table.qualified(),
            columns.join(", "),
            placeholders.join(", "),
        )
    };

    let mut query = sqlx::query(&sql);
    for (_, value) in &values {
        query = query.bind(value.as_deref());
    }
    let row = query.fetch_one(&mut *conn).await?;
    row.try_get::<Value, _>("rec").map_err(DbError::from)
}

/// Partial `UPDATE ... RETURNING`; only the supplied columns change.
pub async fn update_record(
    conn: &mut PgConnection,
    table: &TableDescriptor,
    id: &str,
    body: &Map<String, Value>,
) -> Result<Option<Value>, DbError> {
    reject_view(table)?;
    let pk = primary_key(table)?;
    let values = validate_body(table, body)?;
    if values.is_empty() {
        return Err(DbError::validation("update body must set at least one column"));
    }

    let assignments: Vec<String> = values
        .iter()
        .enumerate()
        .map(|(i, (c, _))| {
            format!(
                "{} = ${}::{}",
                quote_ident(&c.name),
                i + 1,
                c.pg_type.cast_name()
            )
        })
        .collect();
    let sql = format!(
        "WITH upd AS (UPDATE {} SET {} WHERE {} = ${}::{} RETURNING *) SELECT to_jsonb(upd) AS rec FROM upd",
        table.qualified(),
        assignments.join(", "),
        quote_ident(&pk.name),
        values.len() + 1,
        pk.pg_type.cast_name(),
    );

    let mut query = sqlx::query(&sql);
    for (_, value) in &values {
        query = query.bind(value.as_deref());
    }
    query = query.bind(id);
    let row = query.fetch_optional(&mut *conn).await?;
    row.map(|r| r.try_get::<Value, _>("rec").map_err(DbError::from))
        .transpose()
}

/// Deletes by primary key, returning the removed row as JSON; `None` when
/// nothing matched.
pub async fn delete_record(
    conn: &mut PgConnection,
    table: &TableDescriptor,
    id: &str,
) -> Result<Option<Value>, DbError> {
    reject_view(table)?;
    let pk = primary_key(table)?;
    let sql = format!(
        "WITH del AS (DELETE FROM {} WHERE {} = $1::{} RETURNING *) SELECT to_jsonb(del) AS rec FROM del",
        table.qualified(),
        quote_ident(&pk.name),
        pk.pg_type.cast_name(),
    );
    let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await?;
    row.map(|r| r.try_get::<Value, _>("rec").map_err(DbError::from))
        .transpose()
}

/// One-level foreign-key expansion: referents are fetched in a single batch
/// per expanded column and nested under `expand.<friendly>` where the
/// friendly name strips a trailing `_id`.
pub async fn resolve_expand(
    conn: &mut PgConnection,
    snapshot: &SchemaSnapshot,
    table: &TableDescriptor,
    items: &mut [Value],
    expand: &str,
) -> Result<(), DbError> {
    for raw in expand.split(',') {
        let column = raw.trim();
        if column.is_empty() {
            continue;
        }
        let fk = table.foreign_key(column).ok_or_else(|| {
            DbError::validation(format!("\"{column}\" is not a foreign-key column"))
        })?;
        let Some(ref_table) = snapshot.tables.get(&fk.references_table) else {
            continue;
        };

        let mut wanted: Vec<String> = Vec::new();
        for item in items.iter() {
            if let Some(text) = json_scalar_text(&item[column]) {
                if !wanted.contains(&text) {
                    wanted.push(text);
                }
            }
        }
        if wanted.is_empty() {
            continue;
        }

        let ref_col = quote_ident(&fk.references_column);
        let sql = format!(
            "SELECT {ref_col}::text AS fk, to_jsonb(sub) AS rec FROM (SELECT * FROM {}) sub WHERE {ref_col}::text = ANY($1)",
            ref_table.qualified(),
        );
        let rows = sqlx::query(&sql)
            .bind(&wanted)
            .fetch_all(&mut *conn)
            .await?;

        let mut referents: Vec<(String, Value)> = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("fk").map_err(DbError::from)?;
            let rec: Value = row.try_get("rec").map_err(DbError::from)?;
            referents.push((key, rec));
        }

        let friendly = column.strip_suffix("_id").unwrap_or(column).to_owned();
        for item in items.iter_mut() {
            let Some(text) = json_scalar_text(&item[column]) else {
                continue;
            };
            let Some((_, rec)) = referents.iter().find(|(key, _)| *key == text) else {
                continue;
            };
            let expand_slot = item
                .as_object_mut()
                .ok_or_else(|| DbError::validation("expand requires object rows"))?
                .entry("expand")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(map) = expand_slot.as_object_mut() {
                map.insert(friendly.clone(), rec.clone());
            }
        }
    }
    Ok(())
}

fn json_scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
