//! Shared helpers for outbox-relay integration tests.

pub mod db;
