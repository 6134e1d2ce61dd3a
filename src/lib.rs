//! Sensor job scheduling and recovery for the building-automation to cloud bridge.
//!
//! The route layer drives [`services::jobs::Jobs`]; the binary wires the
//! Postgres store, the HTTP clients, startup rehydration and the health monitor.

pub mod models {
    pub mod desigo;
    pub mod scope;
}

pub mod client;
pub mod config;
pub mod credentials;
pub mod db {
    #[cfg(test)]
    pub mod memory;
    pub mod models;
    pub mod store;
    pub mod tables;
}
pub mod schema;
pub mod utils;
pub mod services {
    pub mod fetch;
    pub mod health;
    pub mod jobs;
    pub mod rehydrate;
    pub mod scheduler;
    pub mod send;
}

#[cfg(test)]
pub mod testing;
