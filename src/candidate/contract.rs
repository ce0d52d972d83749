/// Candidate invocation contract
use crate::config::types::{EntryPoint, HarnessConfig, WordWidth};
use serde::{Deserialize, Serialize};

/// What every candidate must satisfy: one exported zero-argument routine
/// named `entry_point` returning an unsigned `word_width`-bit integer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateContract {
    pub entry_point: EntryPoint,
    pub word_width: WordWidth,
}

impl CandidateContract {
    pub fn new(entry_point: EntryPoint, word_width: WordWidth) -> Self {
        Self {
            entry_point,
            word_width,
        }
    }

    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(config.entry_point.clone(), config.word_width)
    }

    /// Human-readable C signature, used in diagnostics.
    pub fn signature(&self) -> String {
        let ret = match self.word_width {
            WordWidth::W32 => "uint32_t",
            WordWidth::W64 => "uint64_t",
        };
        format!("{} {}(void)", ret, self.entry_point)
    }
}

impl Default for CandidateContract {
    fn default() -> Self {
        Self::from_config(&HarnessConfig::default())
    }
}

/// An invocable candidate. The returned word is zero-extended to 64 bits;
/// the evaluator masks it to the contract width.
pub trait Candidate {
    fn invoke(&mut self) -> u64;
}

impl<F> Candidate for F
where
    F: FnMut() -> u64,
{
    fn invoke(&mut self) -> u64 {
        self()
    }
}
