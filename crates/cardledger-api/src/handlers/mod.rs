//! HTTP request handlers

pub mod authorization;
pub mod health;
pub mod webhook;
