//! Read-only lookup of line and transformer parameters by id.
//!
//! Catalogues are handed to the network reader explicitly. Parameters embedded in a network
//! document take precedence over the catalogue.

use std::collections::HashMap;

use crate::case::LineParameters;
use crate::transformer::TransformerParameters;

pub trait ParameterCatalogue {
    fn line_parameters(&self, id: &str) -> Option<LineParameters>;
    fn transformer_parameters(&self, id: &str) -> Option<TransformerParameters>;
}

/// A catalogue that knows nothing, for documents that embed all their parameters.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyCatalogue;

impl ParameterCatalogue for EmptyCatalogue {
    fn line_parameters(&self, _id: &str) -> Option<LineParameters> {
        None
    }

    fn transformer_parameters(&self, _id: &str) -> Option<TransformerParameters> {
        None
    }
}

#[derive(Debug, Default, Clone)]
pub struct Catalogue {
    lines: HashMap<String, LineParameters>,
    transformers: HashMap<String, TransformerParameters>,
}

impl Catalogue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces line parameters under their own id.
    pub fn insert_line(&mut self, parameters: LineParameters) -> &mut Self {
        self.lines.insert(parameters.id.clone(), parameters);
        self
    }

    pub fn insert_transformer(&mut self, parameters: TransformerParameters) -> &mut Self {
        self.transformers.insert(parameters.id.clone(), parameters);
        self
    }

    pub fn len(&self) -> usize {
        self.lines.len() + self.transformers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ParameterCatalogue for Catalogue {
    fn line_parameters(&self, id: &str) -> Option<LineParameters> {
        self.lines.get(id).cloned()
    }

    fn transformer_parameters(&self, id: &str) -> Option<TransformerParameters> {
        self.transformers.get(id).cloned()
    }
}
