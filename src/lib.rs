//! Gamehall - workstation reservation and timeout release engine
//!
//! Users place short holds on gaming-center computers; unconfirmed holds are
//! released automatically when their deadline passes, and every occupancy
//! change is pushed to live map viewers.

pub mod api;
pub mod config;
pub mod db;
pub mod models;
pub mod services;
