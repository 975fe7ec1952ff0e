//! SQLite reference implementations of the persistence traits.
//!
//! A single connection guarded by a mutex; SQLite does not allow async
//! calls, so every method runs its statements inside one short synchronous
//! critical section (and one transaction where atomicity is required).

use serde_json::Value as JsonValue;

mod client;
mod server;

pub use crate::{
    client::SqliteClientPersistence,
    server::SqliteServerPersistence,
};

pub(crate) fn to_json_text(value: &impl serde::Serialize) -> anyhow::Result<String> {
    Ok(serde_json::to_string(value)?)
}

pub(crate) fn from_json_text<T: serde::de::DeserializeOwned>(text: &str) -> anyhow::Result<T> {
    Ok(serde_json::from_str(text)?)
}

pub(crate) fn opt_json_text(value: &Option<JsonValue>) -> anyhow::Result<Option<String>> {
    value.as_ref().map(|v| to_json_text(v)).transpose()
}
