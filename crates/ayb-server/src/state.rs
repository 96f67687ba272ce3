//! Process-wide application state constructed at startup and shared with
//! every handler.

use std::sync::Arc;

use ayb_auth::{
    identity::IdentityService, jwt::JwtKeys, oauth_provider::OAuthConsumer,
    oauth_server::OAuthServer,
};
use ayb_db::{Db, RlsGateway, SchemaCache};
use ayb_jobs::WebhookDispatcher;

use crate::{config::AppConfig, middleware::rate_limit::RateLimiter, realtime::RealtimeHub};

pub struct AppState {
    pub config: AppConfig,
    pub db: Db,
    pub schema: Arc<SchemaCache>,
    pub gateway: RlsGateway,
    pub jwt: JwtKeys,
    pub identity: IdentityService,
    pub oauth: OAuthServer,
    pub consumer: OAuthConsumer,
    pub hub: Arc<RealtimeHub>,
    pub dispatcher: Arc<WebhookDispatcher>,
    pub rate_limiter: RateLimiter,
}

pub type SharedState = Arc<AppState>;
