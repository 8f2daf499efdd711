use anyhow::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Hex sha256 of the canonical JSON form of `value`.
///
/// Struct fields serialize in declaration order and maps are sorted,
/// so equal values always hash equally.
pub fn content_hash<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_matter() -> Result<()> {
        let a = json!({"num_cores": 2, "scheduler": "slurm"});
        let b = json!({"scheduler": "slurm", "num_cores": 2});
        assert_eq!(content_hash(&a)?, content_hash(&b)?);
        assert_ne!(content_hash(&a)?, content_hash(&json!({"num_cores": 3}))?);
        Ok(())
    }
}
