// Library for tests to access modules

pub mod alert_evaluator;
pub mod app_stats;
pub mod clock;
pub mod collector;
pub mod command;
pub mod config;
pub mod deployer;
pub mod docker_repo;
pub mod error;
pub mod event_bus;
pub mod git_repo;
pub mod maintenance;
pub mod models;
pub mod periodic;
pub mod routes;
pub mod store;
pub mod version;
pub mod webhook;
