// src/lib.rs
pub mod ports {
    pub mod paper_broker;
}
pub mod execution {
    pub mod broker;
    pub mod engine;
}
pub mod alert;
pub mod config;
pub mod engine;
pub mod market;
pub mod portfolio;
pub mod risk;
pub mod signal;
pub mod spread;
pub mod stats;
pub mod universe;
