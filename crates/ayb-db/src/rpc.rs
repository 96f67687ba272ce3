//! `pg_proc` introspection and invocation for the RPC surface.

use serde_json::{Map, Value};
use sqlx::{PgConnection, Row};

use crate::{error::DbError, query::bind_params, filter::SqlParam, schema::quote_ident};

#[derive(Clone, Debug)]
pub struct FunctionDescriptor {
    pub schema: String,
    pub name: String,
    pub args: Vec<FunctionArg>,
    pub returns_set: bool,
    pub returns_void: bool,
    /// Composite return (row type or RETURNS TABLE / record).
    pub returns_composite: bool,
}

#[derive(Clone, Debug)]
pub struct FunctionArg {
    pub name: String,
    pub pg_type: String,
}

/// Shape of an RPC response.
#[derive(Clone, Debug)]
pub enum RpcResult {
    Void,
    Scalar(Value),
    Row(Option<Value>),
    Rows(Vec<Value>),
}

/// Resolves a function in `public` by name, preferring the overload whose
/// argument count matches the caller's payload.
pub async fn resolve_function(
    conn: &mut PgConnection,
    name: &str,
    provided_args: usize,
) -> Result<FunctionDescriptor, DbError> {
    let rows = sqlx::query(
        r#"
        SELECT n.nspname AS schema,
               p.proname AS name,
               p.pronargs::int4 AS nargs,
               p.proretset AS retset,
               p.prorettype::regtype::text AS rettype,
               t.typtype::text AS ret_typtype,
               COALESCE(p.proargnames, ARRAY[]::text[]) AS argnames,
               ARRAY(
                   SELECT a.t::regtype::text
                   FROM unnest(p.proargtypes) AS a(t)
               ) AS argtypes
        FROM pg_catalog.pg_proc p
        JOIN pg_catalog.pg_namespace n ON n.oid = p.pronamespace
        JOIN pg_catalog.pg_type t ON t.oid = p.prorettype
        WHERE n.nspname = 'public'
          AND p.proname = $1
          AND p.prokind = 'f'
        "#,
    )
    .bind(name)
    .fetch_all(&mut *conn)
    .await?;

    if rows.is_empty() {
        return Err(DbError::not_found(format!("function \"{name}\" not found")));
    }

    let row = rows
        .iter()
        .find(|row| {
            row.try_get::<i32, _>("nargs")
                .map(|n| n as usize == provided_args)
                .unwrap_or(false)
        })
        .ok_or_else(|| {
            DbError::validation(format!(
                "no overload of \"{name}\" accepts {provided_args} argument(s)"
            ))
        })?;

    let argnames: Vec<String> = row.try_get("argnames").map_err(DbError::from)?;
    let argtypes: Vec<String> = row.try_get("argtypes").map_err(DbError::from)?;
    if argnames.len() < argtypes.len() {
        return Err(DbError::validation(format!(
            "function \"{name}\" has unnamed arguments and cannot be called by name"
        )));
    }

    let args = argtypes
        .into_iter()
        .zip(argnames)
        .map(|(pg_type, arg_name)| FunctionArg {
            name: arg_name,
            pg_type,
        })
        .collect();

    let rettype: String = row.try_get("rettype").map_err(DbError::from)?;
    let ret_typtype: String = row.try_get("ret_typtype").map_err(DbError::from)?;

    Ok(FunctionDescriptor {
        schema: row.try_get("schema").map_err(DbError::from)?,
        name: row.try_get("name").map_err(DbError::from)?,
        args,
        returns_set: row.try_get("retset").map_err(DbError::from)?,
        returns_void: rettype == "void",
        returns_composite: ret_typtype == "c" || rettype == "record",
    })
}

/// Invokes the function with named arguments inside the caller's session.
pub async fn call_function(
    conn: &mut PgConnection,
    descriptor: &FunctionDescriptor,
    args: &Map<String, Value>,
) -> Result<RpcResult, DbError> {
    let mut params: Vec<SqlParam> = Vec::with_capacity(args.len());
    let mut named: Vec<String> = Vec::with_capacity(args.len());

    for (name, value) in args {
        let arg = descriptor
            .args
            .iter()
            .find(|a| &a.name == name)
            .ok_or_else(|| {
                DbError::validation(format!(
                    "function \"{}\" has no argument \"{name}\"",
                    descriptor.name
                ))
            })?;
        let encoded = match value {
            Value::Null => None,
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::String(s) => Some(s.clone()),
            structured @ (Value::Array(_) | Value::Object(_)) => {
                if arg.pg_type == "json" || arg.pg_type == "jsonb" {
                    Some(
                        serde_json::to_string(structured)
                            .map_err(|err| DbError::validation(err.to_string()))?,
                    )
                } else {
                    return Err(DbError::validation(format!(
                        "argument \"{name}\" does not accept structured values"
                    )));
                }
            }
        };
        match encoded {
            Some(text) => {
                params.push(SqlParam::Text(text));
                named.push(format!(
                    "{} => ${}::{}",
                    quote_ident(name),
                    params.len(),
                    arg.pg_type
                ));
            }
            None => named.push(format!("{} => NULL", quote_ident(name))),
        }
    }

    let invocation = format!(
        "{}.{}({})",
        quote_ident(&descriptor.schema),
        quote_ident(&descriptor.name),
        named.join(", ")
    );

    if descriptor.returns_void {
        let sql = format!("SELECT {invocation}");
        bind_params(sqlx::query(&sql), &params)
            .execute(&mut *conn)
            .await?;
        return Ok(RpcResult::Void);
    }

    let sql = format!("SELECT to_jsonb(f) AS rec FROM {invocation} AS f");

    if descriptor.returns_set {
        let rows = bind_params(sqlx::query(&sql), &params)
            .fetch_all(&mut *conn)
            .await?;
        let values = rows
            .into_iter()
            .map(|row| row.try_get::<Value, _>("rec").map_err(DbError::from))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(RpcResult::Rows(values));
    }

    let row = bind_params(sqlx::query(&sql), &params)
        .fetch_optional(&mut *conn)
        .await?;
    let value = row
        .map(|r| r.try_get::<Value, _>("rec").map_err(DbError::from))
        .transpose()?;

    if descriptor.returns_composite {
        Ok(RpcResult::Row(value))
    } else {
        Ok(RpcResult::Scalar(value.unwrap_or(Value::Null)))
    }
}
