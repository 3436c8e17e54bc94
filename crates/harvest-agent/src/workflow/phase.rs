use futures::future::BoxFuture;

use harvest_core::error::PhaseError;

/// What a successful phase reports back to the engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseReport {
    pub quality_score: f64,
}

impl PhaseReport {
    pub fn new(quality_score: f64) -> Self {
        Self {
            quality_score: quality_score.clamp(0.0, 1.0),
        }
    }
}

impl Default for PhaseReport {
    fn default() -> Self {
        Self { quality_score: 1.0 }
    }
}

pub type PhaseResult = Result<PhaseReport, PhaseError>;

/// A named step of a workflow.
///
/// A phase writes its own slot in the state. It must not push to the
/// execution log or error list; the engine does that from the returned result.
pub trait Phase<S>: Send + Sync {
    fn name(&self) -> &str;

    fn run<'a>(&'a self, state: &'a mut S) -> BoxFuture<'a, PhaseResult>;
}

/// A phase backed by a synchronous closure.
pub struct FnPhase<F> {
    name: String,
    f: F,
}

impl<F> FnPhase<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<S, F> Phase<S> for FnPhase<F>
where
    S: Send,
    F: Fn(&mut S) -> PhaseResult + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run<'a>(&'a self, state: &'a mut S) -> BoxFuture<'a, PhaseResult> {
        let result = (self.f)(state);
        Box::pin(std::future::ready(result))
    }
}
