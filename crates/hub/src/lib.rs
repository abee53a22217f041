//! Garden hub: sensor polling, alert tracking, AI-assisted watering
//! schedules and the HTTP API over them.

pub mod alerts;
pub mod classifier;
pub mod cloud;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod gateway;
pub mod memory;
pub mod model;
pub mod mqtt;
pub mod poller;
pub mod schedules;
pub mod seq;
pub mod sources;
pub mod state;
pub mod web;
