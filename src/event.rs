//! Event model for the indexing pipeline.
//!
//! Producers submit opaque values with a monotone version token; an
//! [`Interpreter`] turns each value into an [`Indexable`] the engine can
//! apply. [`DataConsumer`] is the seam between pipeline stages.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Monotone ingestion token. Persisted as the disk partition's watermark.
pub type Version = u64;

/// What an event does to its document
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexOp {
    Add,
    Update,
    Delete,
}

/// A single interpreted event: a unique document id, the operation, and
/// the document content for adds and updates.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Indexable {
    /// Caller-provided 64-bit unique document identifier
    pub uid: u64,
    pub op: IndexOp,
    pub content: Option<String>,
}

impl Indexable {
    pub fn add(uid: u64, content: impl Into<String>) -> Self {
        Self {
            uid,
            op: IndexOp::Add,
            content: Some(content.into()),
        }
    }

    pub fn update(uid: u64, content: impl Into<String>) -> Self {
        Self {
            uid,
            op: IndexOp::Update,
            content: Some(content.into()),
        }
    }

    pub fn delete(uid: u64) -> Self {
        Self {
            uid,
            op: IndexOp::Delete,
            content: None,
        }
    }
}

/// Turns a user-supplied source value into an indexable document.
pub trait Interpreter<V>: Send + Sync {
    fn interpret(&self, value: &V) -> Indexable;
}

impl<V, F> Interpreter<V> for F
where
    F: Fn(&V) -> Indexable + Send + Sync,
{
    fn interpret(&self, value: &V) -> Indexable {
        self(value)
    }
}

/// A pipeline stage that accepts an ordered batch of events together with
/// the highest version the batch represents.
pub trait DataConsumer<V>: Send + Sync {
    fn consume(&self, events: Vec<V>, version: Version) -> Result<()>;
}
