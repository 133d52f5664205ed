//! Moves a confirmed-malicious file into the quarantine folder
//!
//! The parent lookup is read-only; the move itself is one reparent request that removes
//! every current parent and adds the quarantine folder. If the lookup was stale and the
//! response still lists other parents, one compensating reparent removes them.
//!
//! "At most one move per file" counts calls to `isolate`, not reparent requests: a file
//! whose lookup went stale sees two reparent requests from its single `isolate` call.

use thiserror::Error;
use tracing::{debug, warn};

use crate::sentinel::drive::{DriveError, FileStore};

#[derive(Error, Debug)]
pub enum QuarantineError {
    #[error("failed to look up current parents: {0}")]
    Lookup(#[source] DriveError),

    #[error("failed to reparent (parents before the attempt: {previous_parents:?}): {source}")]
    Reparent {
        previous_parents: Vec<String>,
        #[source]
        source: DriveError,
    },

    #[error("file still has parents outside quarantine: {remaining:?}")]
    Incomplete { remaining: Vec<String> },
}

impl QuarantineError {
    /// The Drive error behind this failure when Drive rejected the credentials.
    pub fn into_auth_failure(self) -> Option<DriveError> {
        match self {
            QuarantineError::Lookup(source) | QuarantineError::Reparent { source, .. }
                if source.is_auth_failure() =>
            {
                Some(source)
            }
            _ => None,
        }
    }
}

pub type QuarantineResult<T> = Result<T, QuarantineError>;

/// The quarantine folder resolved for this run.
#[derive(Debug, Clone)]
pub struct Quarantine {
    folder_id: String,
}

impl Quarantine {
    pub fn new(folder_id: impl Into<String>) -> Self {
        Self {
            folder_id: folder_id.into(),
        }
    }

    pub fn folder_id(&self) -> &str {
        &self.folder_id
    }

    /// Leave `file_id` with the quarantine folder as its only parent.
    pub async fn isolate<S: FileStore + ?Sized>(&self, store: &S, file_id: &str) -> QuarantineResult<()> {
        let parents = store
            .get_parents(file_id)
            .await
            .map_err(QuarantineError::Lookup)?;
        let remove = self.foreign(&parents);

        let after = store
            .reparent(file_id, &remove, &self.folder_id)
            .await
            .map_err(|source| QuarantineError::Reparent {
                previous_parents: parents.clone(),
                source,
            })?;
        if self.is_isolated(&after) {
            debug!("File {} moved from {:?} into quarantine", file_id, parents);
            return Ok(());
        }

        let stragglers = self.foreign(&after);
        warn!(
            "File {} gained parents {:?} during the move, removing them",
            file_id, stragglers
        );
        let after = store
            .reparent(file_id, &stragglers, &self.folder_id)
            .await
            .map_err(|source| QuarantineError::Reparent {
                previous_parents: after.clone(),
                source,
            })?;
        if self.is_isolated(&after) {
            Ok(())
        } else {
            Err(QuarantineError::Incomplete {
                remaining: self.foreign(&after),
            })
        }
    }

    fn foreign(&self, parents: &[String]) -> Vec<String> {
        parents
            .iter()
            .filter(|parent| **parent != self.folder_id)
            .cloned()
            .collect()
    }

    fn is_isolated(&self, parents: &[String]) -> bool {
        parents.iter().any(|parent| *parent == self.folder_id) && self.foreign(parents).is_empty()
    }
}
