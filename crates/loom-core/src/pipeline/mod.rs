//! Unit pipelines built on [`crate::processor::UnitProcessor`] and the ordered pool.

pub mod extract;
pub mod tesseract;

pub use extract::{
    BatchFailure, Concept, ConceptExtractor, Dataset, Element, ExtractionOutcome, ExtractionTask, MappingMode,
};
pub use tesseract::{TesseractBuilder, TesseractTask};

use crate::error::LoomError;
use crate::processor::FailurePolicy;

/// Whether a failed unit ends the run. Cancellation and a dead stream always do.
pub(crate) fn should_abort(policy: FailurePolicy, err: &LoomError) -> bool {
    policy == FailurePolicy::AbortRun || matches!(err, LoomError::Cancelled | LoomError::StreamTransport(_))
}
