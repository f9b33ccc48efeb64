use std::fs::File;
use std::path::Path;

use log::info;
use ndarray::prelude::*;

use ndarray_npy::{NpzReader, NpzWriter};

use super::error::{GraphError, Result};
use super::{Graph, VariableKind};

fn serialization_error(error: impl std::fmt::Display) -> GraphError {
    GraphError::Serialization(error.to_string())
}

impl Graph {
    /// Writes the array of every variable and constant to an `.npz` archive,
    /// keyed by identifier.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        info!("serializing to {} ...", path.display());
        let mut npz_writer = NpzWriter::new(File::create(path).map_err(serialization_error)?);
        for node in &self.nodes {
            if !matches!(node.kind, VariableKind::Variable | VariableKind::Constant) {
                continue;
            }
            if let Some(array) = &node.array {
                npz_writer
                    .add_array(node.identifier.as_str(), array)
                    .map_err(serialization_error)?;
            }
        }
        npz_writer.finish().map_err(serialization_error)?;
        Ok(())
    }

    /// Associates every array in the archive with the variable of the same
    /// name; names this graph does not declare are skipped. Returns the
    /// number of arrays loaded.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        info!("loading arrays from {} ...", path.display());
        let mut npz_reader =
            NpzReader::new(File::open(path).map_err(serialization_error)?).map_err(serialization_error)?;
        let mut loaded = 0;
        for name in npz_reader.names().map_err(serialization_error)? {
            let Ok(variable) = self.lookup(&name) else {
                continue;
            };
            let array: ArrayD<f64> = npz_reader.by_name(&name).map_err(serialization_error)?;
            self.associate_array(variable, array)?;
            loaded += 1;
        }
        Ok(loaded)
    }
}
