pub mod compose;
pub mod extract;
pub mod fingerprint;

use shared::types::LabelSnapshot;
use crate::error::SourceError;

/// Anything that can produce a full label snapshot on demand.
pub trait LabelSource: Send {
    fn snapshot(&self) -> Result<LabelSnapshot, SourceError>;
}
