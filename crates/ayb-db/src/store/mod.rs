//! Stores for the internal `_ayb_` tables. One module per concern, all
//! methods hanging off [`crate::Db`].

pub mod apps;
pub mod flows;
pub mod jobs;
pub mod oauth;
pub mod users;
pub mod webhooks;
