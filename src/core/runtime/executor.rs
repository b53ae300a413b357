// Copyright (c) 2026 Concordia
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]

//! The external virtual machine boundary.
//!
//! The program language a transaction's `form` is written in, and the
//! machine that evaluates it, are explicitly out of scope here: this
//! module only defines the `execute(form, address, state) -> (newState,
//! result)` interface the consensus engine calls against, plus a
//! deterministic placeholder implementation for tests and for running
//! without a VM wired in.

use crate::core::cell::Value;
use crate::core::state::model::{State, TransactionResult};
use crate::core::types::PeerKey;
use thiserror::Error;

/// Execution error surfaced by an `Executor` implementation that cannot
/// produce a result at all (as opposed to a transaction-level failure,
/// which is reported through `TransactionResult::err` instead).
#[derive(Debug, Error)]
pub enum ExecError {
    /// No VM is wired in.
    #[error("not implemented")]
    NotImplemented,
}

/// The external VM boundary. Evaluates one transaction's program `form`
/// as `address` against `state`, producing the state that results and
/// the result reported back to the submitting client. Implementations
/// must be deterministic: the same `(form, address, state)` triple
/// always yields the same `(newState, result)` pair, on every peer.
pub trait Executor: Send + Sync {
    /// Evaluate `form` as `address` against `state`.
    fn execute(&self, form: &str, address: &PeerKey, state: &State) -> (State, TransactionResult);
}

/// Deterministic no-op executor: every transaction succeeds with
/// `Value::Nil` and leaves state unchanged. Used in tests and as the
/// default until a real VM is wired in via the `Executor` trait above.
#[derive(Clone, Debug, Default)]
pub struct NoopExecutor;

impl NoopExecutor {
    /// Construct a new no-op executor.
    pub fn new() -> Self {
        Self
    }
}

impl Executor for NoopExecutor {
    fn execute(&self, _form: &str, _address: &PeerKey, state: &State) -> (State, TransactionResult) {
        (state.clone(), TransactionResult::ok(Value::Nil))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::PeerKey;

    #[test]
    fn noop_leaves_state_untouched_and_succeeds() {
        let state = State::genesis(0);
        let addr = PeerKey(vec![1u8; 32]);
        let exec = NoopExecutor::new();
        let (new_state, result) = exec.execute("(+ 1 2)", &addr, &state);
        assert_eq!(new_state, state);
        assert_eq!(result, TransactionResult::ok(Value::Nil));
    }
}
