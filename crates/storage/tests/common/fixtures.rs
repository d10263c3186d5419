use bytes::Bytes;
use std::sync::Arc;
use tempfile::TempDir;
use twinstore_storage::{FilesystemBackend, MemoryBackend, ObjectStore};

/// Generate deterministic test data using a seeded pseudo-random generator.
/// Same seed produces same output.
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    for chunk in data.chunks_mut(8) {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// One instance of every local backend. Keep the TempDir alive for the test.
pub async fn all_backends() -> (TempDir, Vec<Arc<dyn ObjectStore>>) {
    let dir = TempDir::new().unwrap();
    let filesystem = FilesystemBackend::new(dir.path().join("fs")).await.unwrap();
    let backends: Vec<Arc<dyn ObjectStore>> =
        vec![Arc::new(filesystem), Arc::new(MemoryBackend::new())];
    (dir, backends)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_bytes_deterministic() {
        assert_eq!(seeded_bytes(42, 1000), seeded_bytes(42, 1000));
        assert_ne!(seeded_bytes(42, 1000), seeded_bytes(43, 1000));
    }
}
