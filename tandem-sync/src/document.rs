//! Replicated document state held by each room.
//!
//! The server never looks inside document payloads. It needs three
//! capabilities from the replica type: merge a delta, summarize what it
//! knows (state vector), and produce the delta a peer is missing.
//! [`YrsDocument`] provides them with a `yrs::Doc`; tests plug in simpler
//! merge-semigroups through the same trait.

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{ReadTxn, StateVector, Transact, Update};

/// Content-level failures: the frame was well-formed, the payload was not.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("corrupt update payload: {0}")]
    CorruptUpdate(String),
    #[error("corrupt state vector: {0}")]
    CorruptStateVector(String),
    #[error("update rejected by document: {0}")]
    Rejected(String),
}

/// An opaque, mergeable replica.
///
/// `apply` must be commutative and idempotent across updates: applying the
/// same set of updates in any order, any number of times, yields the same
/// state. A failed `apply` must leave the state untouched.
pub trait DocumentState: Default + Send + 'static {
    /// Merge an incremental update into this replica.
    ///
    /// Returns `false` only if the update carried nothing to merge; such
    /// updates need not be relayed.
    fn apply(&mut self, update: &[u8]) -> Result<bool, MergeError>;

    /// Compact summary of everything this replica has seen.
    fn state_vector(&self) -> Vec<u8>;

    /// Update containing everything this replica knows that a peer with
    /// `state_vector` does not.
    fn diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, MergeError>;

    /// The whole replica as a single update.
    fn snapshot(&self) -> Vec<u8> {
        let empty = Self::default().state_vector();
        self.diff(&empty).unwrap_or_default()
    }
}

/// Yjs-compatible replica (v1 update encoding).
pub struct YrsDocument {
    doc: yrs::Doc,
}

impl Default for YrsDocument {
    fn default() -> Self {
        Self {
            doc: yrs::Doc::new(),
        }
    }
}

impl YrsDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrow the underlying `yrs::Doc`, e.g. to read shared types.
    pub fn doc(&self) -> &yrs::Doc {
        &self.doc
    }
}

impl DocumentState for YrsDocument {
    fn apply(&mut self, update: &[u8]) -> Result<bool, MergeError> {
        let update =
            Update::decode_v1(update).map_err(|e| MergeError::CorruptUpdate(e.to_string()))?;
        if update.is_empty() {
            return Ok(false);
        }
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| MergeError::Rejected(e.to_string()))?;
        Ok(true)
    }

    fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    fn diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, MergeError> {
        let remote = StateVector::decode_v1(state_vector)
            .map_err(|e| MergeError::CorruptStateVector(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&remote))
    }

    fn snapshot(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }
}
