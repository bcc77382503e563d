use std::io::ErrorKind;
use std::path::Path;
use sha2::{Sha256, Digest};

/// Computes a SHA-256 fingerprint of the label source file.
/// A missing or unreadable file gets a stable marker so that its
/// disappearance and reappearance both register as changes.
pub fn fingerprint_source(path: &Path) -> String {
    match std::fs::read(path) {
        Ok(bytes) => hex::encode(Sha256::digest(&bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => "missing".to_string(),
        Err(e) => format!("unreadable:{:?}", e.kind()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_tracks_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docker-compose.yml");

        assert_eq!(fingerprint_source(&path), "missing");

        std::fs::write(&path, "services: {}\n").unwrap();
        let first = fingerprint_source(&path);
        assert_eq!(first.len(), 64);
        assert_eq!(first, fingerprint_source(&path), "Fingerprint should be deterministic");

        std::fs::write(&path, "services:\n  web: {}\n").unwrap();
        assert_ne!(first, fingerprint_source(&path), "Fingerprint should change with content");
    }
}
