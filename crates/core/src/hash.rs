use std::fs::File;
use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};

/// Computes the SHA-256 digest of a file, hex encoded. Streams the file so
/// large dumps are never held in memory.
pub fn file_sha256(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
