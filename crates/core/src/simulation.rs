//! Simulation submission request and its validation rules.
//!
//! The molecule and configuration payloads are opaque to the job engine;
//! only their outer shape is checked here so malformed submissions are
//! rejected before a job record exists.

use serde::Deserialize;
use serde_json::Value;
use validator::{Validate, ValidationError};

use crate::error::CoreError;

/// Maximum number of atoms accepted in a molecule specification.
pub const MAX_ATOMS: usize = 50;

/// Body of `POST /api/v1/simulations`.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SimulationRequest {
    /// Solver variant to run (e.g. `vqe`, `sqd`).
    #[validate(length(min = 1, max = 32))]
    pub method: String,

    /// Molecule specification, handed verbatim to the solver.
    #[validate(custom(function = "validate_molecule"))]
    pub molecule: Value,

    /// Solver configuration, handed verbatim to the solver.
    #[serde(default = "empty_object")]
    #[validate(custom(function = "validate_config"))]
    pub config: Value,
}

impl SimulationRequest {
    /// Run all validation rules, mapping failures to [`CoreError::Validation`].
    pub fn validate_request(&self) -> Result<(), CoreError> {
        self.validate()
            .map_err(|e| CoreError::Validation(e.to_string()))?;
        if self.method.trim() != self.method {
            return Err(CoreError::Validation(
                "method must not have leading or trailing whitespace".to_string(),
            ));
        }
        Ok(())
    }

    /// Human-readable molecule name (`molecule.name`), empty when absent.
    pub fn molecule_name(&self) -> String {
        molecule_name(&self.molecule)
    }
}

/// Extract `name` from a molecule specification.
pub fn molecule_name(molecule: &Value) -> String {
    molecule
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

fn validate_molecule(molecule: &Value) -> Result<(), ValidationError> {
    let Some(obj) = molecule.as_object() else {
        return Err(ValidationError::new("molecule_not_object")
            .with_message("molecule must be a JSON object".into()));
    };
    let Some(atoms) = obj.get("atoms").and_then(Value::as_array) else {
        return Err(ValidationError::new("molecule_missing_atoms")
            .with_message("molecule.atoms must be an array".into()));
    };
    if atoms.is_empty() || atoms.len() > MAX_ATOMS {
        return Err(ValidationError::new("molecule_atom_count").with_message(
            format!("molecule must contain between 1 and {MAX_ATOMS} atoms").into(),
        ));
    }
    Ok(())
}

fn validate_config(config: &Value) -> Result<(), ValidationError> {
    if config.is_object() {
        Ok(())
    } else {
        Err(ValidationError::new("config_not_object")
            .with_message("config must be a JSON object".into()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
