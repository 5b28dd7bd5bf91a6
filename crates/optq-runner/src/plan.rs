//! Hooks an embedding program implements to drive an iterative case.
//!
//! The runner owns scheduling and concurrency; a plan only proposes parameters
//! and digests results. A case runs its batch rounds through one
//! [`BatchSearch`], then one [`RefineChain`] per seed, then [`OptimizationPlan::commit`].

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One completed evaluation fed back into a search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluated {
    pub params: Value,
    pub result: Value,
}

/// Ask/tell batch search shared by the rounds of one case.
pub trait BatchSearch: Send {
    /// Up to `batch_size` candidates for the next round. An empty batch ends
    /// the batch phase early.
    fn ask(&mut self, batch_size: usize) -> Result<Vec<Value>>;

    fn tell(&mut self, evaluated: Vec<Evaluated>) -> Result<()>;

    fn converged(&self) -> bool {
        false
    }

    /// Incumbent handed to every refinement chain.
    fn best(&self) -> Option<Value>;
}

/// Sequential local refinement from one seed.
pub trait RefineChain: Send {
    /// Next parameters to evaluate, or `None` once the chain has converged.
    fn next_step(&mut self) -> Option<Value>;

    fn update(&mut self, result: Value) -> Result<()>;

    fn best(&self) -> Value;
}

pub trait OptimizationPlan: Send + Sync {
    fn batch_search(&self, case_id: &str) -> Result<Box<dyn BatchSearch>>;

    fn seeds(&self, case_id: &str, count: usize) -> Vec<u64> {
        let _ = case_id;
        (0..count as u64).collect()
    }

    fn refine_chain(
        &self,
        case_id: &str,
        seed: u64,
        incumbent: Option<&Value>,
    ) -> Result<Box<dyn RefineChain>>;

    /// Folds the per-seed bests into the case result written to `result_ref`.
    fn commit(&self, case_id: &str, bests: Vec<Value>) -> Result<Value>;
}
