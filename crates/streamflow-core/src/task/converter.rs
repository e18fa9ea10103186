//! Data converters.
//!
//! A converter computes fields to add to a context's business data before
//! its task is dispatched. The result is merged: keys it returns overwrite,
//! every other key is kept.

use std::sync::Arc;

use dashmap::DashMap;

use streamflow_types::DataMap;
use streamflow_types::context::Context;
use streamflow_types::definition::TaskDescriptor;

use super::TaskError;

/// Computes the business-data fields a task needs from a context.
pub trait DataConverter: Send + Sync {
    fn convert(&self, context: &Context, task: &TaskDescriptor) -> Result<DataMap, TaskError>;
}

impl<F> DataConverter for F
where
    F: Fn(&Context, &TaskDescriptor) -> Result<DataMap, TaskError> + Send + Sync,
{
    fn convert(&self, context: &Context, task: &TaskDescriptor) -> Result<DataMap, TaskError> {
        self(context, task)
    }
}

/// Converters by the name task descriptors refer to them with.
#[derive(Default)]
pub struct ConverterRegistry {
    converters: DashMap<String, Arc<dyn DataConverter>>,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, converter: impl DataConverter + 'static) {
        self.converters.insert(name.into(), Arc::new(converter));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DataConverter>> {
        self.converters.get(name).map(|c| Arc::clone(c.value()))
    }

    /// Apply the task's converter to every context. A task without a
    /// converter leaves the contexts unchanged.
    pub fn apply(&self, contexts: &mut [Context], task: &TaskDescriptor) -> Result<(), TaskError> {
        let Some(name) = task.converter.as_deref() else {
            return Ok(());
        };
        let converter = self
            .get(name)
            .ok_or_else(|| TaskError::UnknownConverter(name.to_string()))?;
        for context in contexts.iter_mut() {
            let fields = converter.convert(context, task)?;
            context.merge_business_data(fields);
        }
        Ok(())
    }
}
