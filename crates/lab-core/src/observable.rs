//! Observable values with change notifications.
//!
//! [`Observable<T>`] wraps a `tokio::sync::watch` channel so multiple
//! subscribers can wait for value changes without polling. Metadata and the
//! validator live in a shared `Arc<RwLock<..>>` so every clone of an
//! observable sees the same constraints.

use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::LabError;

type Validator<T> = Arc<dyn Fn(&T) -> Result<()> + Send + Sync>;

struct ObservableSharedState<T> {
    metadata: ObservableMetadata,
    validator: Option<Validator<T>>,
}

// =============================================================================
// ParameterBase Trait - Generic Parameter Access
// =============================================================================

/// Base trait for all parameters, providing type-erased access to common
/// operations (manifest snapshots, generic listings).
pub trait ParameterBase: Send + Sync {
    /// Get the parameter name
    fn name(&self) -> String;

    /// Get the current value as JSON
    fn get_json(&self) -> Result<serde_json::Value>;

    /// Set the value from JSON
    fn set_json(&self, value: serde_json::Value) -> Result<()>;

    /// Get the parameter metadata (returns a clone for thread safety).
    fn metadata(&self) -> ObservableMetadata;
}

/// Combines [`ParameterBase`] with `Any` for downcasting when the concrete
/// type is needed.
pub trait ParameterAny: ParameterBase {
    /// Get a reference to this parameter as `&dyn Any` for downcasting
    fn as_any(&self) -> &dyn Any;

    /// Type name of the parameter value (e.g., "f64", "String")
    fn type_name(&self) -> &'static str;

    /// Attempt to get the value as f64 (returns None if not f64 type)
    fn value_as_f64(&self) -> Option<f64>;

    /// Attempt to get the value as String (returns None if not String type)
    fn value_as_string(&self) -> Option<String>;
}

// =============================================================================
// Observable<T>
// =============================================================================

/// A thread-safe, observable value with change notifications.
pub struct Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// The watch channel sender (holds current value)
    sender: watch::Sender<T>,
    /// Shared metadata and validator (enables dynamic updates)
    shared: Arc<RwLock<ObservableSharedState<T>>>,
}

impl<T: Clone + Send + Sync + 'static> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.shared.read();
        f.debug_struct("Observable")
            .field("metadata", &shared.metadata)
            .field("has_validator", &shared.validator.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + Sync + 'static> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(), // shares the same watch channel
            shared: self.shared.clone(), // shares the same metadata
        }
    }
}

/// Metadata for an observable parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservableMetadata {
    /// Parameter name (unique within a device).
    pub name: String,

    /// Human-readable description.
    pub description: Option<String>,

    /// Physical units (e.g., "nm", "W", "s").
    pub units: Option<String>,

    /// Whether this parameter rejects `set()` calls.
    pub read_only: bool,

    /// Minimum value for numeric constraints.
    #[serde(default)]
    pub min_value: Option<f64>,

    /// Maximum value for numeric constraints.
    #[serde(default)]
    pub max_value: Option<f64>,

    /// Allowed values for choice constraints.
    #[serde(default)]
    pub enum_values: Vec<String>,
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new observable with an initial value.
    pub fn new(name: impl Into<String>, initial_value: T) -> Self {
        let (sender, _) = watch::channel(initial_value);
        Self {
            sender,
            shared: Arc::new(RwLock::new(ObservableSharedState {
                metadata: ObservableMetadata {
                    name: name.into(),
                    description: None,
                    units: None,
                    read_only: false,
                    min_value: None,
                    max_value: None,
                    enum_values: Vec::new(),
                },
                validator: None,
            })),
        }
    }

    /// Add a description to this observable.
    pub fn with_description(self, description: impl Into<String>) -> Self {
        self.shared.write().metadata.description = Some(description.into());
        self
    }

    /// Add units to this observable.
    pub fn with_units(self, units: impl Into<String>) -> Self {
        self.shared.write().metadata.units = Some(units.into());
        self
    }

    /// Mark this observable as read-only.
    pub fn read_only(self) -> Self {
        self.shared.write().metadata.read_only = true;
        self
    }

    /// Add a custom validator function.
    pub fn with_validator<F>(self, validator: F) -> Self
    where
        F: Fn(&T) -> Result<()> + Send + Sync + 'static,
    {
        self.shared.write().validator = Some(Arc::new(validator));
        self
    }

    /// Get the current value (clone).
    pub fn get(&self) -> T {
        self.sender.borrow().clone()
    }

    /// Get the parameter name.
    pub fn name(&self) -> String {
        self.shared.read().metadata.name.clone()
    }

    /// Get the metadata (returns a clone for thread safety).
    pub fn metadata(&self) -> ObservableMetadata {
        self.shared.read().metadata.clone()
    }

    /// Validate a value without setting it.
    ///
    /// Useful when an expensive operation (a hardware write) must not happen
    /// if validation would fail.
    pub fn validate(&self, value: &T) -> Result<()> {
        let guard = self.shared.read();
        if guard.metadata.read_only {
            return Err(anyhow!("parameter '{}' is read-only", guard.metadata.name));
        }

        if let Some(validator) = &guard.validator {
            validator(value)?;
        }

        Ok(())
    }

    /// Set a new value, notifying all subscribers.
    ///
    /// Returns error if the parameter is read-only or validation fails.
    pub fn set(&self, value: T) -> Result<()> {
        self.validate(&value)?;
        self.sender.send_replace(value);
        Ok(())
    }

    /// Set value without validation (internal use).
    pub(crate) fn set_unchecked(&self, value: T) {
        self.sender.send_replace(value);
    }

    /// Subscribe to value changes.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + PartialOrd + std::fmt::Debug + 'static,
{
    /// Set numeric range constraints.
    ///
    /// Values are validated against `min <= value <= max` and the bounds are
    /// recorded in the metadata when they convert to f64.
    pub fn with_range(self, min: T, max: T) -> Self
    where
        T: Into<f64> + Copy,
    {
        {
            let mut guard = self.shared.write();
            guard.metadata.min_value = Some(min.into());
            guard.metadata.max_value = Some(max.into());
        }
        self.with_validator(move |value| {
            if *value < min || *value > max {
                Err(anyhow!("value {:?} outside range [{:?}, {:?}]", value, min, max))
            } else {
                Ok(())
            }
        })
    }
}

impl Observable<String> {
    /// Set discrete choice constraints, recorded in metadata.
    pub fn with_choices(self, choices: Vec<String>) -> Self {
        self.shared.write().metadata.enum_values = choices.clone();
        self.with_validator(move |value| {
            if choices.iter().any(|c| c == value) {
                Ok(())
            } else {
                Err(LabError::ParameterInvalidChoice.into())
            }
        })
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + Serialize + for<'de> Deserialize<'de> + 'static,
{
    /// Get the current value as JSON
    pub fn get_json(&self) -> Result<serde_json::Value> {
        let value = self.get();
        let name = self.name();
        serde_json::to_value(&value)
            .map_err(|e| anyhow!("failed to serialize parameter '{}': {}", name, e))
    }

    /// Set the value from JSON
    pub fn set_json(&self, json_value: serde_json::Value) -> Result<()> {
        let name = self.name();
        let value: T = serde_json::from_value(json_value).map_err(|e| {
            anyhow!(
                "failed to deserialize parameter '{}': {}. Expected type: {}",
                name,
                e,
                std::any::type_name::<T>()
            )
        })?;
        self.set(value)
    }
}

// =============================================================================
// ParameterSet - Named Parameter Registry
// =============================================================================

/// Collection of named parameters owned by one device.
///
/// Stores parameters as trait objects so generic code can enumerate and
/// snapshot them without knowing concrete types.
#[derive(Default)]
pub struct ParameterSet {
    parameters: std::collections::HashMap<String, Box<dyn ParameterAny>>,
}

impl std::fmt::Debug for ParameterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterSet")
            .field("parameters", &format!("{} parameters", self.parameters.len()))
            .field("names", &self.names())
            .finish()
    }
}

impl ParameterSet {
    /// Create a new empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register any parameter-like object that implements [`ParameterAny`].
    pub fn register<P>(&mut self, parameter: P)
    where
        P: ParameterAny + 'static,
    {
        let name = parameter.name();
        self.parameters.insert(name, Box::new(parameter));
    }

    /// Get a parameter by name with a specific concrete type.
    pub fn get_typed<P>(&self, name: &str) -> Option<&P>
    where
        P: ParameterAny + 'static,
    {
        self.parameters
            .get(name)
            .and_then(|p| p.as_any().downcast_ref::<P>())
    }

    /// Get a parameter by name as a trait object (generic access).
    pub fn get(&self, name: &str) -> Option<&dyn ParameterBase> {
        self.parameters
            .get(name)
            .map(|p| p.as_ref() as &dyn ParameterBase)
    }

    /// Iterate over all parameters as trait objects.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &dyn ParameterBase)> {
        self.parameters
            .iter()
            .map(|(name, param)| (name.as_str(), param.as_ref() as &dyn ParameterBase))
    }

    /// List all parameter names.
    pub fn names(&self) -> Vec<&str> {
        self.parameters.keys().map(|s| s.as_str()).collect()
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn test_observable_basic() {
        let obs = Observable::new("gain", 1.0_f64);
        assert_eq!(obs.get(), 1.0);
        obs.set(2.0).unwrap();
        assert_eq!(obs.get(), 2.0);
    }

    #[test]
    fn test_observable_range() {
        let obs = Observable::new("wavelength_nm", 640.0_f64).with_range(400.0, 1100.0);
        assert!(obs.set(532.0).is_ok());
        assert!(obs.set(200.0).is_err());
        assert!(obs.set(1200.0).is_err());
        let meta = obs.metadata();
        assert_eq!(meta.min_value, Some(400.0));
        assert_eq!(meta.max_value, Some(1100.0));
    }

    #[test]
    fn test_observable_read_only() {
        let obs = Observable::new("serial", "P5003184".to_string()).read_only();
        assert!(obs.set("other".into()).is_err());
        assert_eq!(obs.get(), "P5003184");
    }

    #[test]
    fn test_observable_choices() {
        let obs = Observable::new("mode", "narrow_pulse".to_string())
            .with_choices(vec!["cw".into(), "broad_pulse".into(), "narrow_pulse".into()]);
        assert!(obs.set("cw".into()).is_ok());
        assert!(obs.set("pulsed".into()).is_err());
    }

    #[tokio::test]
    async fn test_observable_subscription() {
        let obs = Observable::new("delay_s", 0.0_f64);
        let mut rx = obs.subscribe();
        obs.set(2.4e-4).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 2.4e-4);
    }

    #[test]
    fn test_observable_clones_share_state() {
        let a = Observable::new("x", 1.0_f64);
        let b = a.clone();
        a.set(3.0).unwrap();
        assert_eq!(b.get(), 3.0);
    }
}
