// REST API v4 surface
//
// `client` owns transport mechanics; each sibling module adds one endpoint
// group as inherent methods on `RestClient`.

pub mod client;

mod auth;
mod channels;
mod files;
mod posts;
mod teams;
mod users;

pub use auth::{TOKEN_HEADER, VERSION_HEADER};
pub use client::{PER_PAGE, RATE_LIMIT_RESET_HEADER, RestClient, rate_limit_error};
