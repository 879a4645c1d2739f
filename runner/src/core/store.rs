//! Holds the most recent compiled artifact.

use std::fmt;

use sha2::{Digest, Sha256};
use snip_lang::CompiledArtifact;

/// Hex SHA-256 of an artifact payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactId(String);

impl ArtifactId {
    pub fn of(artifact: &CompiledArtifact) -> Self {
        let digest = Sha256::digest(&artifact.payload);
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First twelve hex digits, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub id: ArtifactId,
    /// Version of the source unit that produced it.
    pub source_version: u64,
    pub artifact: CompiledArtifact,
}

/// Single-slot store. Storing replaces and drops the previous artifact.
#[derive(Debug, Default)]
pub struct ArtifactStore {
    current: Option<StoredArtifact>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&mut self, source_version: u64, artifact: CompiledArtifact) -> ArtifactId {
        let id = ArtifactId::of(&artifact);
        self.current = Some(StoredArtifact {
            id: id.clone(),
            source_version,
            artifact,
        });
        id
    }

    pub fn current(&self) -> Option<&StoredArtifact> {
        self.current.as_ref()
    }
}
