//! Host for the crawler engine: configuration, logging, the page-list plugin,
//! failed-image persistence and event reporting.
pub mod config;
pub mod events;
pub mod logging;
pub mod persistence;
pub mod plugin;
