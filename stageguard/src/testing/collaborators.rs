//! Scripted collaborators for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;

use crate::errors::StageFailure;
use crate::workflow::{StageCall, StageCollaborator, StageInput};

/// One scripted reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedReply {
    /// Return this output.
    Ok(Value),
    /// Fail with this failure.
    Fail(StageFailure),
    /// Never return. Ends only by timeout or cancellation.
    Hang,
}

impl ScriptedReply {
    /// A failure reply from a message.
    #[must_use]
    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail(StageFailure::new(message))
    }
}

/// A collaborator that plays back a script of replies, one per call.
///
/// The last reply repeats once the script runs out; an empty script returns
/// `null`.
#[derive(Debug)]
pub struct ScriptedCollaborator {
    script: Mutex<VecDeque<ScriptedReply>>,
    last: Mutex<Option<ScriptedReply>>,
    inputs: Mutex<Vec<StageInput>>,
    attempts: Mutex<Vec<u32>>,
}

impl ScriptedCollaborator {
    /// Creates a collaborator from a script.
    #[must_use]
    pub fn new(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self {
            script: Mutex::new(replies.into_iter().collect()),
            last: Mutex::new(None),
            inputs: Mutex::new(Vec::new()),
            attempts: Mutex::new(Vec::new()),
        }
    }

    /// Always returns `output`.
    #[must_use]
    pub fn succeeding(output: Value) -> Self {
        Self::new([ScriptedReply::Ok(output)])
    }

    /// Always fails with `message`.
    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::new([ScriptedReply::fail(message)])
    }

    /// Never returns.
    #[must_use]
    pub fn hanging() -> Self {
        Self::new([ScriptedReply::Hang])
    }

    /// Appends replies to the script.
    pub fn push(&self, replies: impl IntoIterator<Item = ScriptedReply>) {
        self.script.lock().extend(replies);
    }

    /// Number of calls made.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.inputs.lock().len()
    }

    /// Inputs received, in call order.
    #[must_use]
    pub fn inputs(&self) -> Vec<StageInput> {
        self.inputs.lock().clone()
    }

    /// Attempt numbers received, in call order.
    #[must_use]
    pub fn attempt_numbers(&self) -> Vec<u32> {
        self.attempts.lock().clone()
    }

    fn next_reply(&self) -> Option<ScriptedReply> {
        let mut script = self.script.lock();
        let mut last = self.last.lock();
        if let Some(reply) = script.pop_front() {
            *last = Some(reply.clone());
            return Some(reply);
        }
        last.clone()
    }
}

#[async_trait]
impl StageCollaborator for ScriptedCollaborator {
    async fn invoke(&self, call: &StageCall) -> Result<Value, StageFailure> {
        self.inputs.lock().push(call.input.clone());
        self.attempts.lock().push(call.attempt);
        match self.next_reply() {
            None => Ok(Value::Null),
            Some(ScriptedReply::Ok(output)) => Ok(output),
            Some(ScriptedReply::Fail(failure)) => Err(failure),
            Some(ScriptedReply::Hang) => {
                std::future::pending::<()>().await;
                Ok(Value::Null)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationToken;
    use serde_json::json;

    fn call(attempt: u32) -> StageCall {
        StageCall {
            run_id: "r".to_string(),
            stage_id: "s".to_string(),
            attempt,
            deadline: tokio::time::Instant::now(),
            input: StageInput::new(json!("goal")),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_script_plays_in_order_then_repeats() {
        let collaborator = ScriptedCollaborator::new([
            ScriptedReply::fail("connection reset"),
            ScriptedReply::Ok(json!(1)),
        ]);
        assert!(collaborator.invoke(&call(1)).await.is_err());
        assert_eq!(collaborator.invoke(&call(2)).await.unwrap(), json!(1));
        assert_eq!(collaborator.invoke(&call(3)).await.unwrap(), json!(1));
        assert_eq!(collaborator.calls(), 3);
        assert_eq!(collaborator.attempt_numbers(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_empty_script_returns_null() {
        let collaborator = ScriptedCollaborator::new([]);
        assert_eq!(collaborator.invoke(&call(1)).await.unwrap(), Value::Null);
    }

    #[test]
    fn test_hang_never_resolves() {
        let collaborator = ScriptedCollaborator::hanging();
        let c = call(1);
        let mut fut = tokio_test::task::spawn(collaborator.invoke(&c));
        tokio_test::assert_pending!(fut.poll());
    }
}
