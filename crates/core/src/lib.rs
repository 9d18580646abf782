//! Domain layer shared by the webhook handler, the fanout coordinator and the
//! storage/client crates. Nothing in here performs I/O.

pub mod dedup;
pub mod envelope;
pub mod template;
pub mod types;
