pub mod language;
pub mod price;
pub mod translate;

use async_trait::async_trait;

use crate::error::EnrichError;

/// A value that can be written into one or more output columns.
pub trait EnrichedValue: Clone + Send + Sync + 'static {
    fn columns() -> &'static [&'static str];
    fn to_cells(&self) -> Vec<String>;
}

/// Derives a structured value from one row's input field by calling an
/// external service. A failed call is reported, never panicked.
#[async_trait]
pub trait Enricher: Send + Sync + 'static {
    type Output: EnrichedValue;

    /// Short stage name used for logs and the status column.
    fn name(&self) -> &'static str;

    /// Column holding the text to enrich.
    fn input_column(&self) -> &'static str;

    /// Value substituted when every attempt failed.
    fn fallback(&self) -> Self::Output;

    /// Value shown for rows that have not completed yet.
    fn pending(&self, _input: &str) -> Self::Output {
        self.fallback()
    }

    async fn enrich(&self, input: &str) -> Result<Self::Output, EnrichError>;
}

/// Outcome of a retried enrichment. Both arms carry a usable value.
#[derive(Debug, Clone, PartialEq)]
pub enum EnrichmentResult<T> {
    Success(T),
    Failure(T),
}

impl<T> EnrichmentResult<T> {
    pub fn value(&self) -> &T {
        match self {
            EnrichmentResult::Success(v) | EnrichmentResult::Failure(v) => v,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, EnrichmentResult::Success(_))
    }
}

/// One row's pending enrichment.
#[derive(Debug, Clone)]
pub struct Task {
    pub index: usize,
    pub input: String,
}
