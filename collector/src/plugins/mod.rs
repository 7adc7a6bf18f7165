//! Built-in vendor plugins
//!
//! Each plugin declares explicit record types for the vendor payloads it
//! reads. A record deserializes leniently (every field optional, odd shapes
//! tolerated) and maps totally onto its dataset's declared schema, so a
//! `Default` record doubles as the blank-dataset sentinel.

pub mod azure_entra;
pub mod domains;
pub mod knowbe4;
pub mod okta;

use crate::context::EngineContext;
use crate::error::PluginError;
use crate::registry::Plugin;
use crate::schema::{Row, Schema};
use serde::de::DeserializeOwned;
use serde_json::Value as Json;
use std::sync::Arc;
use tracing::warn;

/// Every built-in plugin
pub fn builtin() -> Vec<Arc<dyn Plugin>> {
    vec![
        Arc::new(azure_entra::AzureEntra),
        Arc::new(domains::Domains),
        Arc::new(knowbe4::KnowBe4),
        Arc::new(okta::Okta),
    ]
}

/// A vendor record and the dataset it lands in
pub trait Record: DeserializeOwned + Default {
    fn schema() -> Schema;

    /// Total mapping onto [`Record::schema`]
    fn to_row(&self) -> Row;
}

/// Decode raw items, dropping the ones that are not records at all
pub(crate) fn decode<R: Record>(items: Vec<Json>) -> Vec<R> {
    let mut records = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value(item) {
            Ok(record) => records.push(record),
            Err(e) => warn!(tag = %R::schema().tag(), error = %e, "skipping undecodable item"),
        }
    }
    records
}

/// Buffer records under their dataset
pub(crate) fn store<R: Record>(ctx: &EngineContext, records: &[R]) -> Result<u64, PluginError> {
    let rows = records.iter().map(Record::to_row).collect();
    Ok(ctx.store(&R::schema(), rows)?)
}

/// Blank the dataset of `R` unless it already has rows this run
pub(crate) async fn blank<R: Record>(ctx: &EngineContext) -> Result<(), PluginError> {
    let schema = R::schema();
    ctx.write_blank(&schema, R::default().to_row()).await?;
    Ok(())
}

/// Tolerant field decoders for vendor JSON
pub(crate) mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    /// Integer from a number or numeric string; anything else is `None`
    pub fn int<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
        Ok(match Option::<Value>::deserialize(d)? {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        })
    }

    /// Truthiness; missing and null are `false`
    pub fn flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        Ok(match Option::<Value>::deserialize(d)? {
            Some(Value::Bool(b)) => b,
            Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            Some(Value::String(s)) => matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "yes"),
            Some(Value::Array(a)) => !a.is_empty(),
            Some(Value::Object(o)) => !o.is_empty(),
            Some(Value::Null) | None => false,
        })
    }

    /// Any JSON kept as its compact text
    pub fn text<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(match Option::<Value>::deserialize(d)? {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(other) => Some(other.to_string()),
        })
    }
}
