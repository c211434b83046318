//! Saving and restoring network state.
//!
//! Every component walks its own parameters and buffers through
//! [`StateDict::visit_state`], naming them with dotted paths such as
//! `block3.0.attn.1.weight`. The collected tensors are stored in the
//! safetensors format.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor, Var};
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{LayerError, LayerResult};

/// Receives the named tensors of a component.
pub trait StateVisitor {
    /// Visits a learnable parameter.
    fn parameter(&mut self, name: &str, value: &Var) -> LayerResult<()>;

    /// Visits a non-learnable buffer such as batch-norm running statistics.
    fn buffer(&mut self, name: &str, value: &RwLock<Tensor>) -> LayerResult<()>;
}

/// A component whose parameters and buffers can be enumerated by name.
pub trait StateDict {
    /// Walks every parameter and buffer under `prefix`.
    fn visit_state(&self, prefix: &str, visitor: &mut dyn StateVisitor) -> LayerResult<()>;

    /// Returns copies of all named tensors.
    fn state_dict(&self) -> LayerResult<HashMap<String, Tensor>> {
        let mut collector = Collector::default();
        self.visit_state("", &mut collector)?;
        Ok(collector.tensors)
    }

    /// Returns every learnable parameter with its dotted name, in visiting order.
    ///
    /// The returned [`Var`]s share storage with the component.
    fn named_parameters(&self) -> LayerResult<Vec<(String, Var)>> {
        let mut names = Named::default();
        self.visit_state("", &mut names)?;
        Ok(names.parameters)
    }

    /// Returns a copy of every buffer with its dotted name, in visiting order.
    fn named_buffers(&self) -> LayerResult<Vec<(String, Tensor)>> {
        let mut names = Named::default();
        self.visit_state("", &mut names)?;
        Ok(names.buffers)
    }

    /// Overwrites parameters and buffers with the tensors in `state`.
    ///
    /// Every name this component owns must be present with a matching shape.
    /// Nothing is overwritten unless the whole state checks out.
    fn load_state_dict(&self, state: &HashMap<String, Tensor>) -> LayerResult<()> {
        self.visit_state("", &mut Checker { state })?;
        self.visit_state("", &mut Loader { state })
    }

    /// Writes the state to a safetensors file.
    fn save_weights(&self, path: impl AsRef<Path>) -> LayerResult<()>
    where
        Self: Sized,
    {
        let state = self.state_dict()?;
        debug!(path = %path.as_ref().display(), tensors = state.len(), "saving weights");
        candle_core::safetensors::save(&state, path)?;
        Ok(())
    }

    /// Restores the state from a safetensors file.
    fn load_weights(&self, path: impl AsRef<Path>, device: &Device) -> LayerResult<()>
    where
        Self: Sized,
    {
        let state = candle_core::safetensors::load(path.as_ref(), device)?;
        debug!(path = %path.as_ref().display(), tensors = state.len(), "loading weights");
        self.load_state_dict(&state)
    }
}

/// Joins a parent prefix and a child name with a dot.
pub fn join_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

#[derive(Default)]
struct Collector {
    tensors: HashMap<String, Tensor>,
}

impl StateVisitor for Collector {
    fn parameter(&mut self, name: &str, value: &Var) -> LayerResult<()> {
        self.tensors
            .insert(name.to_string(), value.as_tensor().detach());
        Ok(())
    }

    fn buffer(&mut self, name: &str, value: &RwLock<Tensor>) -> LayerResult<()> {
        self.tensors.insert(name.to_string(), value.read().clone());
        Ok(())
    }
}

#[derive(Default)]
struct Named {
    parameters: Vec<(String, Var)>,
    buffers: Vec<(String, Tensor)>,
}

impl StateVisitor for Named {
    fn parameter(&mut self, name: &str, value: &Var) -> LayerResult<()> {
        self.parameters.push((name.to_string(), value.clone()));
        Ok(())
    }

    fn buffer(&mut self, name: &str, value: &RwLock<Tensor>) -> LayerResult<()> {
        self.buffers.push((name.to_string(), value.read().clone()));
        Ok(())
    }
}

fn lookup<'a>(
    state: &'a HashMap<String, Tensor>,
    name: &str,
    expected: &[usize],
) -> LayerResult<&'a Tensor> {
    let tensor = state
        .get(name)
        .ok_or_else(|| LayerError::CheckpointError {
            message: format!("missing tensor '{name}'"),
        })?;
    if tensor.dims() != expected {
        return Err(LayerError::CheckpointError {
            message: format!(
                "tensor '{name}' has shape {:?}, expected {:?}",
                tensor.dims(),
                expected
            ),
        });
    }
    Ok(tensor)
}

/// Validates names and shapes without touching the component.
struct Checker<'a> {
    state: &'a HashMap<String, Tensor>,
}

impl StateVisitor for Checker<'_> {
    fn parameter(&mut self, name: &str, value: &Var) -> LayerResult<()> {
        lookup(self.state, name, value.dims()).map(|_| ())
    }

    fn buffer(&mut self, name: &str, value: &RwLock<Tensor>) -> LayerResult<()> {
        lookup(self.state, name, value.read().dims()).map(|_| ())
    }
}

struct Loader<'a> {
    state: &'a HashMap<String, Tensor>,
}

impl StateVisitor for Loader<'_> {
    fn parameter(&mut self, name: &str, value: &Var) -> LayerResult<()> {
        let tensor = lookup(self.state, name, value.dims())?;
        value.set(&tensor.to_device(value.device())?)?;
        Ok(())
    }

    fn buffer(&mut self, name: &str, value: &RwLock<Tensor>) -> LayerResult<()> {
        let mut guard = value.write();
        let tensor = lookup(self.state, name, guard.dims())?;
        *guard = tensor.to_device(guard.device())?;
        Ok(())
    }
}
