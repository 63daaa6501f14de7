//! Integration tests against the in-memory store.

mod e2e;
mod properties;
mod support;
