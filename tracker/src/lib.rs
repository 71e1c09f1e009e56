//! Game server tracker: master-list discovery, status polling, and a
//! consumer-facing change feed.
//!
//! The pipeline runs in three stages. The master poller discovers server
//! endpoints from the configured master directories, every discovered server
//! gets a poll task that reconciles status responses into the shared
//! directory, and the resulting change events flow through the change log to
//! connected feed consumers.

pub mod changelog;
pub mod directory;
pub mod feed;
pub mod gameserver;
pub mod geo;
pub mod master;
pub mod scheduler;
pub mod utils;
