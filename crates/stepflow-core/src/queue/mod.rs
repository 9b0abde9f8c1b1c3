//! Messaging ports for the callback path.

pub mod broker;
