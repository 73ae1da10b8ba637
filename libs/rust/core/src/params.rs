//! Learnable tensors owned by a model.
//!
//! Layers refer to their weights by `ParamId`; the optimizer and the Parseval
//! tightener are the only writers and each holds `&mut ParameterStore` for the
//! duration of its stage.

use std::collections::BTreeMap;

use ndarray::ArrayD;

use crate::error::{PixelDpError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(usize);

impl ParamId {
    pub fn index(self) -> usize { self.0 }
}

/// Role of a tensor; decides how it is reshaped for tightening and whether it
/// contributes to weight decay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// `[filter, filter, in, out]`
    ConvKernel,
    /// `[in, out]`
    DenseWeights,
    Bias,
}

#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub kind: ParamKind,
    pub value: ArrayD<f32>,
    tracked_for_tightening: bool,
}

impl Parameter {
    pub fn is_tracked_for_tightening(&self) -> bool { self.tracked_for_tightening }
}

/// Gradients (or any per-parameter update) keyed by parameter.
pub type Gradients = BTreeMap<ParamId, ArrayD<f32>>;

#[derive(Debug, Clone, Default)]
pub struct ParameterStore {
    params: Vec<Parameter>,
}

impl ParameterStore {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&mut self, name: impl Into<String>, kind: ParamKind, value: ArrayD<f32>) -> ParamId {
        let id = ParamId(self.params.len());
        self.params.push(Parameter { name: name.into(), kind, value: value.as_standard_layout().into_owned(), tracked_for_tightening: false });
        id
    }

    /// Tags a tensor for the Parseval retraction after every optimizer step.
    pub fn track_for_tightening(&mut self, id: ParamId) -> Result<()> {
        let p = self.params.get_mut(id.0).ok_or_else(|| unknown(id))?;
        if p.kind == ParamKind::Bias {
            return Err(PixelDpError::config(format!("bias '{}' cannot be tracked for tightening", p.name)));
        }
        p.tracked_for_tightening = true;
        Ok(())
    }

    pub fn get(&self, id: ParamId) -> Result<&Parameter> { self.params.get(id.0).ok_or_else(|| unknown(id)) }

    pub fn value(&self, id: ParamId) -> Result<&ArrayD<f32>> { self.get(id).map(|p| &p.value) }

    pub fn value_mut(&mut self, id: ParamId) -> Result<&mut ArrayD<f32>> {
        self.params.get_mut(id.0).map(|p| &mut p.value).ok_or_else(|| unknown(id))
    }

    /// Replaces a tensor's value; the shape must not change.
    pub fn assign(&mut self, id: ParamId, value: ArrayD<f32>) -> Result<()> {
        let slot = self.value_mut(id)?;
        if slot.shape() != value.shape() {
            return Err(PixelDpError::shape(format!("assign {:?} into {:?}", value.shape(), slot.shape())));
        }
        *slot = value.as_standard_layout().into_owned();
        Ok(())
    }

    pub fn ids(&self) -> impl Iterator<Item = ParamId> + '_ { (0..self.params.len()).map(ParamId) }

    pub fn iter(&self) -> impl Iterator<Item = (ParamId, &Parameter)> + '_ {
        self.params.iter().enumerate().map(|(i, p)| (ParamId(i), p))
    }

    pub fn tracked_for_tightening(&self) -> Vec<ParamId> {
        self.iter().filter(|(_, p)| p.is_tracked_for_tightening()).map(|(id, _)| id).collect()
    }

    pub fn find(&self, name: &str) -> Option<ParamId> {
        self.iter().find(|(_, p)| p.name == name).map(|(id, _)| id)
    }

    pub fn len(&self) -> usize { self.params.len() }
    pub fn is_empty(&self) -> bool { self.params.is_empty() }
}

fn unknown(id: ParamId) -> PixelDpError { PixelDpError::shape(format!("unknown parameter #{}", id.0)) }
