//! `Parameter<T>` - declarative parameter management.
//!
//! A [`Parameter`] composes an [`Observable`] with hardware callbacks. When
//! `set()` is called the value is validated first, then written to the device,
//! then the internal value updates and subscribers are notified. A failed
//! validation never reaches the hardware; a failed hardware write never
//! updates the cached value.
//!
//! ```text
//! param.set(value)
//!   1. validate against constraints (range, choices, read-only)
//!   2. write to hardware (if a writer is connected)
//!   3. update internal value, notify watch subscribers
//!   4. call change listeners (storage, logging)
//! ```

use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

use crate::error::LabError;
use crate::observable::{Observable, ObservableMetadata, ParameterAny, ParameterBase};

/// Typed parameter with automatic hardware synchronization.
#[derive(Clone)]
pub struct Parameter<T>
where
    T: Clone + Send + Sync + PartialEq + Debug + 'static,
{
    /// Base reactive primitive (watch channel, validation, metadata)
    inner: Observable<T>,

    /// Hardware write function (optional)
    hardware_writer:
        Option<Arc<dyn Fn(T) -> BoxFuture<'static, Result<(), LabError>> + Send + Sync>>,

    /// Hardware read function (optional)
    hardware_reader:
        Option<Arc<dyn Fn() -> BoxFuture<'static, Result<T, LabError>> + Send + Sync>>,

    /// Change listeners, called after the value changes
    change_listeners: Arc<RwLock<Vec<Arc<dyn Fn(&T) + Send + Sync>>>>,
}

impl<T> Parameter<T>
where
    T: Clone + Send + Sync + PartialEq + Debug + 'static,
{
    /// Create a new parameter with an initial value.
    pub fn new(name: impl Into<String>, initial: T) -> Self {
        Self {
            inner: Observable::new(name, initial),
            hardware_writer: None,
            hardware_reader: None,
            change_listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Set parameter description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.inner = self.inner.with_description(description);
        self
    }

    /// Set parameter unit.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.inner = self.inner.with_units(unit);
        self
    }

    /// Set numeric range constraints.
    pub fn with_range(mut self, min: T, max: T) -> Self
    where
        T: PartialOrd + Into<f64> + Copy,
    {
        self.inner = self.inner.with_range(min, max);
        self
    }

    /// Set custom validation function.
    pub fn with_validator(
        mut self,
        validator: impl Fn(&T) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.inner = self.inner.with_validator(validator);
        self
    }

    /// Make parameter read-only.
    pub fn read_only(mut self) -> Self {
        self.inner = self.inner.read_only();
        self
    }

    /// Connect hardware write function.
    ///
    /// After calling this, `set()` writes to hardware before updating the
    /// internal value. If the hardware write fails the value is not updated.
    pub fn connect_to_hardware_write(
        &mut self,
        writer: impl Fn(T) -> BoxFuture<'static, Result<(), LabError>> + Send + Sync + 'static,
    ) {
        self.hardware_writer = Some(Arc::new(writer));
    }

    /// Connect hardware read function.
    pub fn connect_to_hardware_read(
        &mut self,
        reader: impl Fn() -> BoxFuture<'static, Result<T, LabError>> + Send + Sync + 'static,
    ) {
        self.hardware_reader = Some(Arc::new(reader));
    }

    /// Add change listener (called after value changes).
    pub async fn add_change_listener(&self, listener: impl Fn(&T) + Send + Sync + 'static) {
        let mut listeners = self.change_listeners.write().await;
        listeners.push(Arc::new(listener));
    }

    /// Get current value.
    pub fn get(&self) -> T {
        self.inner.get()
    }

    /// Set value (validates, writes to hardware if connected, notifies
    /// subscribers).
    pub async fn set(&self, value: T) -> Result<()> {
        // Validate BEFORE the hardware write so a rejected value never
        // reaches the device.
        self.inner.validate(&value)?;

        if let Some(writer) = &self.hardware_writer {
            writer(value.clone()).await?;
        }

        self.inner.set_unchecked(value.clone());

        let listeners = self.change_listeners.read().await;
        for listener in listeners.iter() {
            listener(&value);
        }

        Ok(())
    }

    /// Read current value from hardware and update the parameter.
    ///
    /// Does NOT validate; the hardware is the source of truth.
    pub async fn read_from_hardware(&self) -> Result<()> {
        let reader = self
            .hardware_reader
            .as_ref()
            .ok_or(LabError::ParameterNoHardwareReader)?;

        let value = reader().await?;
        self.inner.set_unchecked(value.clone());

        let listeners = self.change_listeners.read().await;
        for listener in listeners.iter() {
            listener(&value);
        }

        Ok(())
    }

    /// Subscribe to value changes.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.inner.subscribe()
    }

    /// Parameter name.
    pub fn name(&self) -> String {
        self.inner.name()
    }

    /// Parameter unit of measurement.
    pub fn unit(&self) -> Option<String> {
        self.inner.metadata().units
    }

    /// Check if parameter is read-only.
    pub fn is_read_only(&self) -> bool {
        self.inner.metadata().read_only
    }
}

impl Parameter<String> {
    /// Set discrete choice constraints.
    pub fn with_choices(mut self, choices: Vec<String>) -> Self {
        self.inner = self.inner.with_choices(choices);
        self
    }
}

// =============================================================================
// Trait implementations for generic parameter collections
// =============================================================================

impl<T> ParameterBase for Parameter<T>
where
    T: Clone + Send + Sync + PartialEq + Debug + Serialize + for<'de> Deserialize<'de> + 'static,
{
    fn name(&self) -> String {
        self.inner.name()
    }

    fn get_json(&self) -> Result<serde_json::Value> {
        self.inner.get_json()
    }

    fn set_json(&self, value: serde_json::Value) -> Result<()> {
        let typed_value: T = serde_json::from_value(value)?;
        futures::executor::block_on(self.set(typed_value))
    }

    fn metadata(&self) -> ObservableMetadata {
        self.inner.metadata()
    }
}

impl<T> ParameterAny for Parameter<T>
where
    T: Clone + Send + Sync + PartialEq + Debug + Serialize + for<'de> Deserialize<'de> + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn value_as_f64(&self) -> Option<f64> {
        self.as_any()
            .downcast_ref::<Parameter<f64>>()
            .map(|p| p.get())
    }

    fn value_as_string(&self) -> Option<String> {
        self.as_any()
            .downcast_ref::<Parameter<String>>()
            .map(|p| p.get())
    }
}
