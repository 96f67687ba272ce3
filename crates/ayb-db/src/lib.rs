//! AllYourBase persistence and query engine.
//!
//! This crate owns everything that talks to PostgreSQL: the connection pool
//! and embedded migrations, the introspection snapshot behind the
//! collections surface, the filter compiler, the RLS session gateway, and
//! the stores for the internal `_ayb_` tables.

pub mod error;
pub mod filter;
pub mod query;
pub mod rpc;
pub mod schema;
pub mod session;
pub mod sqlsplit;
pub mod store;

use sqlx::{postgres::PgPoolOptions, PgPool};

pub use error::DbError;
pub use filter::SqlParam;
pub use query::{ListOptions, ListResult};
pub use schema::{
    ColumnDescriptor, ForeignKey, PgType, SchemaCache, SchemaSnapshot, TableDescriptor,
    UniqueIndex,
};
pub use session::{RlsGateway, SessionClaims};
pub use store::{
    apps::{ApiKeyRecord, AppRecord},
    flows::SmsCodeRecord,
    jobs::{JobRecord, JobState, ScheduleRecord},
    oauth::{
        AuthorizationCodeRecord, OauthAccountRecord, OauthClientRecord, OauthTokenRecord,
    },
    users::{SessionRecord, UserRecord},
    webhooks::{WebhookDeliveryRecord, WebhookDeliveryStatus, WebhookRecord},
};

/// Primary handle to the AllYourBase database.
#[derive(Clone, Debug)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connects to PostgreSQL and applies the embedded migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Wraps an already-connected pool; used by tests that manage their own
    /// databases.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Exposes the underlying pool for composed queries and background
    /// workers.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
