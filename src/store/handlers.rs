// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Typed mutation handlers.
//!
//! Every component gets the generic JSON handler unless a caller registers
//! its own, e.g. a handler that rejects negative currency balances.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Map, Value};

use crate::component::{MutationPayload, StateComponent};
use crate::error::{EngineError, Result};

/// Computes the next value of a component from its current value and a payload.
///
/// Handlers must be pure: the store calls them while holding the component's
/// writer lock and discards the result if anything fails.
pub trait MutationHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(
        &self,
        component: StateComponent,
        current: &Value,
        payload: &MutationPayload,
    ) -> Result<Value>;
}

/// Treats component values as JSON objects.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonMutationHandler;

impl JsonMutationHandler {
    fn as_object(component: StateComponent, current: &Value) -> Result<Map<String, Value>> {
        match current {
            Value::Object(map) => Ok(map.clone()),
            Value::Null => Ok(Map::new()),
            other => Err(EngineError::InvalidPayload {
                component,
                reason: format!("expected an object value, found {}", json_type(other)),
            }),
        }
    }
}

impl MutationHandler for JsonMutationHandler {
    fn name(&self) -> &'static str {
        "json"
    }

    fn apply(
        &self,
        component: StateComponent,
        current: &Value,
        payload: &MutationPayload,
    ) -> Result<Value> {
        match payload {
            MutationPayload::CasUpdate { value } | MutationPayload::Restore { value } => {
                Ok(value.clone())
            }
            MutationPayload::DeltaPatch { patch } => {
                let mut map = Self::as_object(component, current)?;
                for (key, value) in patch {
                    if value.is_null() {
                        map.remove(key);
                    } else {
                        map.insert(key.clone(), value.clone());
                    }
                }
                Ok(Value::Object(map))
            }
            MutationPayload::CounterAdd { key, delta } => {
                let mut map = Self::as_object(component, current)?;
                let existing = match map.get(key) {
                    None | Some(Value::Null) => 0,
                    Some(v) => v.as_i64().ok_or_else(|| EngineError::InvalidPayload {
                        component,
                        reason: format!("counter '{}' is {}, not an integer", key, json_type(v)),
                    })?,
                };
                let next = existing.checked_add(*delta).ok_or_else(|| EngineError::InvalidPayload {
                    component,
                    reason: format!("counter '{}' overflows", key),
                })?;
                map.insert(key.clone(), Value::from(next));
                Ok(Value::Object(map))
            }
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Per-component handler lookup.
pub struct HandlerRegistry {
    fallback: Arc<dyn MutationHandler>,
    handlers: DashMap<StateComponent, Arc<dyn MutationHandler>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self {
            fallback: Arc::new(JsonMutationHandler),
            handlers: DashMap::new(),
        }
    }
}

impl HandlerRegistry {
    pub fn register(&self, component: StateComponent, handler: Arc<dyn MutationHandler>) {
        tracing::info!(%component, handler = handler.name(), "Registered mutation handler");
        self.handlers.insert(component, handler);
    }

    #[must_use]
    pub fn get(&self, component: StateComponent) -> Arc<dyn MutationHandler> {
        self.handlers
            .get(&component)
            .map(|h| h.value().clone())
            .unwrap_or_else(|| self.fallback.clone())
    }
}
