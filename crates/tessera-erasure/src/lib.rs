//! Reed-Solomon slice encoding and reconstruction.
//!
//! An object of `obj_size` bytes is split into `data` contiguous slices of
//! [`slice_size`] bytes each (the last one zero-padded), then `parity`
//! parity slices are generated over them. Slice ids are 1-based on the wire
//! and on disk (slice 0 is the full object); this crate works with 0-based
//! shard indices and the callers translate.
//!
//! Reconstruction is deterministic: given the same `(data, parity, slices)`
//! every caller produces byte-identical output, which the rebalance
//! protocol relies on when several targets regenerate the same fragments.

mod error;

pub use error::ErasureError;

use bytes::Bytes;
use tracing::debug;

/// Size of one slice for an object of `obj_size` bytes split `data` ways.
///
/// `ceil(obj_size / data)`, rounded up to the next even number — the RS
/// backend requires even shard sizes. Slices on disk are stored padded; the
/// object's true size lives in its metadata.
pub fn slice_size(obj_size: u64, data: usize) -> usize {
    debug_assert!(data > 0);
    let per = (obj_size as usize).div_ceil(data);
    if per % 2 == 0 {
        per
    } else {
        per + 1
    }
}

/// Encode `object` into `data + parity` equal-sized slices.
///
/// Index `i` of the result is slice id `i + 1`: indices `0..data` are the
/// data slices (the object's bytes in order, padded), `data..data+parity`
/// the parity slices.
pub fn encode(object: &[u8], data: usize, parity: usize) -> Result<Vec<Bytes>, ErasureError> {
    if object.is_empty() {
        return Err(ErasureError::EmptyObject);
    }

    let shard = slice_size(object.len() as u64, data);
    let mut padded = Vec::with_capacity(data * shard);
    padded.extend_from_slice(object);
    padded.resize(data * shard, 0);

    let originals: Vec<&[u8]> = padded.chunks_exact(shard).collect();
    debug_assert_eq!(originals.len(), data);

    let mut slices: Vec<Bytes> = originals
        .iter()
        .map(|s| Bytes::copy_from_slice(s))
        .collect();

    if parity > 0 {
        let recovery = reed_solomon_simd::encode(data, parity, &originals)?;
        slices.extend(recovery.iter().map(|r| Bytes::copy_from_slice(r)));
    }

    debug!(
        data,
        parity,
        obj_size = object.len(),
        slice_size = shard,
        "encoded object into slices"
    );
    Ok(slices)
}

/// Result of [`reconstruct`]: the full object plus the complete slice set.
#[derive(Debug, Clone)]
pub struct Rebuilt {
    /// The original object bytes, truncated to its true size.
    pub object: Bytes,
    /// All `data + parity` slices; index `i` is slice id `i + 1`.
    pub slices: Vec<Bytes>,
}

/// Rebuild an object and its full slice set from any `data` surviving slices.
///
/// `present` holds `(slice_id, bytes)` pairs with 1-based slice ids. The
/// object data is decoded first (a plain concatenation when every data
/// slice survived), then re-encoded to regenerate the missing slices.
pub fn reconstruct(
    data: usize,
    parity: usize,
    present: &[(u16, Bytes)],
    obj_size: u64,
) -> Result<Rebuilt, ErasureError> {
    if present.len() < data {
        return Err(ErasureError::NotEnoughSlices {
            needed: data,
            got: present.len(),
        });
    }

    let mut originals: Vec<(usize, &[u8])> = Vec::new();
    let mut recovery: Vec<(usize, &[u8])> = Vec::new();
    for (slice_id, bytes) in present {
        if *slice_id == 0 || *slice_id as usize > data + parity {
            return Err(ErasureError::BadSliceId(*slice_id));
        }
        let idx = *slice_id as usize - 1;
        if idx < data {
            originals.push((idx, bytes.as_ref()));
        } else {
            recovery.push((idx - data, bytes.as_ref()));
        }
    }

    debug!(
        data,
        parity,
        originals = originals.len(),
        recovery = recovery.len(),
        obj_size,
        "reconstructing object from slices"
    );

    let shard = slice_size(obj_size, data);
    let mut full = vec![0u8; data * shard];

    for (idx, bytes) in &originals {
        if bytes.len() != shard {
            return Err(ErasureError::SliceSizeMismatch {
                expected: shard,
                got: bytes.len(),
            });
        }
        full[idx * shard..(idx + 1) * shard].copy_from_slice(bytes);
    }

    if originals.len() < data {
        let restored = reed_solomon_simd::decode(data, parity, originals, recovery)?;
        for (idx, bytes) in &restored {
            full[idx * shard..(idx + 1) * shard].copy_from_slice(bytes);
        }
    }

    let slices = encode(&full[..obj_size as usize], data, parity)?;
    let mut object = full;
    object.truncate(obj_size as usize);

    Ok(Rebuilt {
        object: Bytes::from(object),
        slices,
    })
}
