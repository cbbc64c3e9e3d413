use std::collections::HashMap;
use std::sync::Arc;

use crate::solver::Solver;

/// Method name to solver lookup, built once at startup.
#[derive(Clone, Default)]
pub struct SolverRegistry {
    solvers: HashMap<String, Arc<dyn Solver>>,
}

impl SolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `solver` under `method`, replacing any previous entry.
    pub fn register(&mut self, method: impl Into<String>, solver: Arc<dyn Solver>) -> &mut Self {
        self.solvers.insert(method.into(), solver);
        self
    }

    pub fn with(mut self, method: impl Into<String>, solver: Arc<dyn Solver>) -> Self {
        self.register(method, solver);
        self
    }

    pub fn get(&self, method: &str) -> Option<Arc<dyn Solver>> {
        self.solvers.get(method).cloned()
    }

    pub fn contains(&self, method: &str) -> bool {
        self.solvers.contains_key(method)
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.solvers.keys().cloned().collect();
        methods.sort();
        methods
    }

    pub fn is_empty(&self) -> bool {
        self.solvers.is_empty()
    }
}

impl std::fmt::Debug for SolverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolverRegistry")
            .field("methods", &self.methods())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::{ProgressSink, SolverError, SolverInput, SolverOutput};

    struct Fixed(f64);

    impl Solver for Fixed {
        fn run(&self, _input: &SolverInput, _sink: &ProgressSink) -> Result<SolverOutput, SolverError> {
            Ok(SolverOutput {
                energy: self.0,
                energy_history: vec![self.0],
                converged: true,
                num_iterations: 1,
                metadata: serde_json::json!({}),
            })
        }
    }

    #[test]
    fn lookup_by_method() {
        let registry = SolverRegistry::new()
            .with("vqe", Arc::new(Fixed(-1.0)))
            .with("fci", Arc::new(Fixed(-1.1)));

        assert!(registry.contains("vqe"));
        assert!(registry.get("unknown").is_none());
        assert_eq!(registry.methods(), vec!["fci".to_string(), "vqe".to_string()]);
    }

    #[test]
    fn register_replaces_existing_entry() {
        let mut registry = SolverRegistry::new();
        registry
            .register("vqe", Arc::new(Fixed(-1.0)))
            .register("vqe", Arc::new(Fixed(-2.0)));

        let input = SolverInput {
            job_id: qsim_core::types::new_job_id(),
            method: "vqe".into(),
            molecule: serde_json::json!({}),
            config: serde_json::json!({}),
        };
        let (sink, _rx) = ProgressSink::channel(Default::default());
        let output = registry.get("vqe").unwrap().run(&input, &sink).unwrap();
        assert_eq!(output.energy, -2.0);
        assert_eq!(registry.methods().len(), 1);
    }
}
