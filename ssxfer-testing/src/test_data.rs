//! Create local test data files for transfer tests
use crate::Result;
use rand::prelude::*;
use std::path::{Path, PathBuf};

/// Generate `size` bytes of random data.
///
/// The data is deliberately not compressible or repetitive, so corruption bugs like transposed or
/// overlapping parts can't accidentally produce the right bytes.
pub fn make_random_data(size: usize) -> Vec<u8> {
    let mut data = vec![0u8; size];

    rand::thread_rng().fill(&mut data[..]);

    data
}

/// Create a file of `size` random bytes in `dir`, returning its path and its contents so tests
/// can verify what comes back out of object storage.
pub async fn make_test_file(dir: &Path, name: &str, size: usize) -> Result<(PathBuf, Vec<u8>)> {
    let data = make_random_data(size);
    let path = dir.join(name);

    tokio::fs::write(&path, &data).await?;

    Ok((path, data))
}

/// Read back a file written by a download, for comparison against the expected object contents
pub async fn read_test_file(path: &Path) -> Result<Vec<u8>> {
    Ok(tokio::fs::read(path).await?)
}
