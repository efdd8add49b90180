//! End-to-end tests against cores written in WAT.

mod fetch;
mod lifecycle;
mod message_store;
mod trap;
