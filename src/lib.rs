pub mod attachments;
pub mod constants;
pub mod conversation;
pub mod db;
pub mod hardening;
pub mod health;
pub mod identity;
pub mod ingress;
pub mod logging;
pub mod main_helper;
pub mod persistence;
pub mod server;
pub mod specs;
pub mod str_utils;
pub mod streaming;
pub mod titles;
pub mod tools;
pub mod types;
pub mod upstream;

pub use types::*;

pub use main_helper::{AppState, Args};
