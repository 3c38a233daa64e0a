//! Trait for composable admission stages.

use super::adaptive::{CompletionToken, Outcome};
use super::descriptor::RequestDescriptor;
use super::gate::GatePermit;
use crate::error::Rejection;

/// A transport-agnostic admission decision point.
///
/// Stages hold disjoint state, so several of them can be chained in any
/// order. A decision is always immediate: a stage never waits for capacity.
pub trait AdmissionStage: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Decide whether the request may proceed.
    fn admit(&self, descriptor: &RequestDescriptor) -> Result<Ticket, Rejection>;
}

/// Resources held by an admitted request.
///
/// Completing or dropping the ticket releases everything it holds, so the
/// release happens whatever the handler does.
#[derive(Debug, Default)]
#[must_use = "dropping a ticket immediately releases the admission"]
pub struct Ticket {
    permit: Option<GatePermit>,
    completion: Option<CompletionToken>,
}

impl Ticket {
    /// A ticket with nothing to release.
    pub fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn new(permit: Option<GatePermit>, completion: Option<CompletionToken>) -> Self {
        Self { permit, completion }
    }

    /// Report the handler outcome and release held resources.
    pub fn complete(mut self, outcome: Outcome) {
        if let Some(completion) = self.completion.take() {
            completion.done(outcome);
        }
        self.permit.take();
    }
}
