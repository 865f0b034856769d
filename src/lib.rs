pub mod api;
pub mod auth;
pub mod config;
pub mod consts;
pub mod dispatch;
pub mod extractor;
pub mod processor;
pub mod prompts;
pub mod store;
