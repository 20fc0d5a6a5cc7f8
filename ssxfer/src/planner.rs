//! Computes the part layout of a transfer before any I/O is performed.
//!
//! Given nothing but the object size and the [`crate::Config`], [`plan`] decides whether the
//! object moves as a single unit or as multiple parts, and computes the exact byte range of every
//! part.  The function is pure and deterministic, so tests can assert on part layouts directly.
use crate::{Config, Result};

/// A contiguous byte range of an object, transferred as one unit of work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartSpec {
    /// The part number, starting from 0.
    ///
    /// Note that the S3 multipart APIs number parts from 1; the S3 client implementation performs
    /// that translation, so nothing outside of it needs to care.
    pub part_number: u32,

    /// Offset of the first byte of this part within the object
    pub offset: u64,

    /// Length of the part in bytes.
    ///
    /// This is always non-zero, except for the single part of a zero-length object.
    pub length: u64,
}

/// The complete part layout of one transfer operation.
///
/// The parts exactly partition `[0, object_size)`: sorted by offset they are contiguous and
/// non-overlapping, and their lengths sum to the object size.  Immutable once created.
#[derive(Clone, Debug)]
pub struct TransferPlan {
    object_size: u64,

    /// Whether this transfer uses the multipart storage APIs.
    ///
    /// Note that this isn't the same thing as `parts.len() > 1`.  An object larger than the
    /// multipart threshold but smaller than a single chunk still goes through the multipart
    /// upload lifecycle, with exactly one part.
    multipart: bool,

    parts: Vec<PartSpec>,
}

impl TransferPlan {
    pub fn object_size(&self) -> u64 {
        self.object_size
    }

    /// Whether the multipart storage APIs (initiate/complete/abort) apply to this transfer
    pub fn is_multipart(&self) -> bool {
        self.multipart
    }

    pub fn parts(&self) -> &[PartSpec] {
        &self.parts
    }

    pub fn num_parts(&self) -> usize {
        self.parts.len()
    }
}

/// Compute the part layout for an object of the given size.
///
/// Objects at or below the multipart threshold always produce a single-part plan, without even
/// looking at the chunk size.  This branch is load-bearing: setting a threshold larger than the
/// object is the documented way to force a single-shot transfer.
///
/// Fails with [`crate::TransferError::InvalidChunkSize`] or
/// [`crate::TransferError::InvalidConcurrency`] if the multipart path is taken with a nonsensical
/// config.  Validation happens here, before any I/O.
pub fn plan(object_size: u64, config: &Config) -> Result<TransferPlan> {
    let threshold = config.multipart_threshold.get_bytes() as u64;

    if object_size <= threshold {
        // Too small to bother with multipart.  A zero-length object still gets exactly one
        // (empty) part so the rest of the pipeline doesn't need a special case.
        return Ok(TransferPlan {
            object_size,
            multipart: false,
            parts: vec![PartSpec {
                part_number: 0,
                offset: 0,
                length: object_size,
            }],
        });
    }

    let chunk_size = config.multipart_chunk_size.get_bytes() as u64;

    snafu::ensure!(chunk_size > 0, crate::error::InvalidChunkSizeSnafu);
    snafu::ensure!(
        config.max_concurrent_requests >= 1,
        crate::error::InvalidConcurrencySnafu
    );

    let mut parts = Vec::with_capacity(((object_size + chunk_size - 1) / chunk_size) as usize);
    let mut part_number = 0u32;
    let mut offset = 0u64;

    while offset < object_size {
        let length = chunk_size.min(object_size - offset);

        parts.push(PartSpec {
            part_number,
            offset,
            length,
        });

        part_number += 1;
        offset += length;
    }

    Ok(TransferPlan {
        object_size,
        multipart: true,
        parts,
    })
}
