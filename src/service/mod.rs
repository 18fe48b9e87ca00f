pub mod aligner;
pub mod evaluator;
pub mod normalizer;
pub mod orchestrator;
pub mod report;
pub mod uploads;

pub use aligner::LineItemAligner;
pub use evaluator::DiscrepancyEvaluator;
pub use normalizer::Normalizer;
pub use orchestrator::{with_timeout, MatchRequest, MatchService, Reconciler};
pub use report::ReportWriter;
pub use uploads::UploadStore;
