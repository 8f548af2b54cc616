pub mod aggregate;
pub mod broker;
pub mod config;
pub mod event;
pub mod filter;
pub mod health;
pub mod service;
pub mod store;
