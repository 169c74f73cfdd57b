//! Event upconversion.
//!
//! Stored events keep the payload kind they were written with. On read, the
//! upconverter rewrites each legacy payload to its current kind by following
//! registered conversions (`kind -> next kind`) until no conversion applies.
//!
//! Conversions are registered explicitly at startup:
//!
//! ```
//! use commitstore::conversion::EventUpconverter;
//!
//! let upconverter = EventUpconverter::builder()
//!     .register("orders.Placed.v1", "orders.Placed.v2", |mut data| {
//!         data["currency"] = serde_json::json!("EUR");
//!         Ok(data)
//!     })
//!     .build()
//!     .unwrap();
//! assert_eq!(upconverter.len(), 1);
//! ```
//!
//! `build` rejects two conversions for the same source kind and any cycle
//! among conversions, so a chain always terminates.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::model::{Commit, EventMessage, Payload};
use crate::persistence::{self, PipelineHook};

/// Upconverter configuration and runtime errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpconverterError {
    #[error("Multiple converters registered for payload kind {kind}")]
    MultipleConvertersFound { kind: String },

    #[error("Converter cycle: {}", .chain.join(" -> "))]
    ConversionCycle { chain: Vec<String> },

    #[error("Conversion of {kind} failed: {reason}")]
    ConversionFailed { kind: String, reason: String },
}

pub type Result<T> = std::result::Result<T, UpconverterError>;

type ConvertFn = dyn Fn(serde_json::Value) -> Result<serde_json::Value> + Send + Sync;

/// One registered conversion step.
#[derive(Clone)]
pub struct Converter {
    source: String,
    target: String,
    convert: Arc<ConvertFn>,
}

impl Converter {
    pub fn new<F>(source: impl Into<String>, target: impl Into<String>, convert: F) -> Self
    where
        F: Fn(serde_json::Value) -> Result<serde_json::Value> + Send + Sync + 'static,
    {
        Self {
            source: source.into(),
            target: target.into(),
            convert: Arc::new(convert),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

impl fmt::Debug for Converter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Converter")
            .field("source", &self.source)
            .field("target", &self.target)
            .finish()
    }
}

/// Collects conversions before validation.
#[derive(Debug, Default)]
pub struct UpconverterBuilder {
    converters: Vec<Converter>,
}

impl UpconverterBuilder {
    pub fn register<F>(mut self, source: &str, target: &str, convert: F) -> Self
    where
        F: Fn(serde_json::Value) -> Result<serde_json::Value> + Send + Sync + 'static,
    {
        self.converters.push(Converter::new(source, target, convert));
        self
    }

    pub fn with_converter(mut self, converter: Converter) -> Self {
        self.converters.push(converter);
        self
    }

    /// Validate and freeze the registry.
    pub fn build(self) -> Result<EventUpconverter> {
        let mut converters: HashMap<String, Converter> = HashMap::new();
        for converter in self.converters {
            if converters.contains_key(&converter.source) {
                return Err(UpconverterError::MultipleConvertersFound {
                    kind: converter.source,
                });
            }
            converters.insert(converter.source.clone(), converter);
        }

        detect_cycles(&converters)?;

        info!(converters = converters.len(), "Event upconverter configured");
        Ok(EventUpconverter { converters })
    }
}

/// Walk every chain; revisiting a kind on the same walk is a cycle.
fn detect_cycles(converters: &HashMap<String, Converter>) -> Result<()> {
    let mut cleared: HashSet<&str> = HashSet::new();

    for start in converters.keys() {
        let mut chain: Vec<&str> = Vec::new();
        let mut on_path: HashSet<&str> = HashSet::new();
        let mut kind = start.as_str();

        while let Some(converter) = converters.get(kind) {
            if cleared.contains(kind) {
                break;
            }
            if !on_path.insert(kind) {
                chain.push(kind);
                return Err(UpconverterError::ConversionCycle {
                    chain: chain.into_iter().map(str::to_string).collect(),
                });
            }
            chain.push(kind);
            kind = converter.target.as_str();
        }

        cleared.extend(chain);
    }

    Ok(())
}

/// Validated registry of payload conversions.
#[derive(Debug, Default)]
pub struct EventUpconverter {
    converters: HashMap<String, Converter>,
}

impl EventUpconverter {
    pub fn builder() -> UpconverterBuilder {
        UpconverterBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.converters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.converters.is_empty()
    }

    /// Whether a payload of this kind would be rewritten.
    pub fn converts(&self, kind: &str) -> bool {
        self.converters.contains_key(kind)
    }

    /// Convert one payload to its current kind.
    pub fn convert_payload(&self, payload: Payload) -> Result<Payload> {
        let Payload { mut kind, mut data } = payload;
        while let Some(converter) = self.converters.get(&kind) {
            data = (converter.convert)(data)?;
            debug!(from = %converter.source, to = %converter.target, "Upconverted payload");
            kind = converter.target.clone();
        }
        Ok(Payload { kind, data })
    }

    /// Upconvert every event of a commit.
    ///
    /// A commit with nothing to convert is returned as-is, events buffer
    /// included. Otherwise a new commit carries the same identity fields and
    /// headers with the rewritten events in their original order.
    pub fn upconvert(&self, commit: Commit) -> Result<Commit> {
        if !commit.events.iter().any(|e| self.converts(&e.body.kind)) {
            return Ok(commit);
        }

        let events = commit
            .events
            .into_iter()
            .map(|event| {
                if !self.converts(&event.body.kind) {
                    return Ok(event);
                }
                Ok(EventMessage {
                    body: self.convert_payload(event.body)?,
                    headers: event.headers,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Commit { events, ..commit })
    }
}

impl PipelineHook for EventUpconverter {
    fn select(&self, commit: Commit) -> persistence::Result<Option<Commit>> {
        Ok(Some(self.upconvert(commit)?))
    }
}
