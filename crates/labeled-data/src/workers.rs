use std::ops::Range;

use rayon::prelude::*;
use rayon::ThreadPoolBuilder;

use crate::errors::{DataError, Result};
use crate::preprocessing::{normalize_text, pad_to_length, TokenEncoder, TokenizedText};

/// Split `0..total` into at most `parts` contiguous, non-empty ranges whose
/// lengths differ by at most one.
pub fn index_ranges(total: usize, parts: usize) -> Vec<Range<usize>> {
    let parts = parts.max(1).min(total.max(1));
    let base = total / parts;
    let extra = total % parts;
    let mut ranges = Vec::with_capacity(parts);
    let mut start = 0;
    for part in 0..parts {
        let len = base + usize::from(part < extra);
        if len == 0 {
            continue;
        }
        ranges.push(start..start + len);
        start += len;
    }
    ranges
}

/// Normalize and tokenize `texts` on a pool of exactly `workers` threads.
///
/// Each worker receives a contiguous index range and owns its output buffer;
/// buffers are concatenated in range order so the result lines up with the
/// input. Per-example failures are returned in place, never raised.
pub fn tokenize_parallel<E>(
    encoder: &E,
    texts: &[String],
    max_length: usize,
    workers: usize,
) -> Result<Vec<Result<TokenizedText>>>
where
    E: TokenEncoder + ?Sized,
{
    if max_length == 0 {
        return Err(DataError::InvalidConfig(
            "max_length must be greater than zero".into(),
        ));
    }

    let pool = ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|index| format!("tokenize-{index}"))
        .build()
        .map_err(|err| DataError::InvalidConfig(format!("worker pool: {err}")))?;

    let ranges = index_ranges(texts.len(), workers.max(1));
    tracing::debug!(
        examples = texts.len(),
        workers,
        chunks = ranges.len(),
        "tokenizing"
    );

    let chunks: Vec<Vec<Result<TokenizedText>>> = pool.install(|| {
        ranges
            .into_par_iter()
            .map(|range| {
                range
                    .map(|index| tokenize_one(encoder, index, &texts[index], max_length))
                    .collect()
            })
            .collect()
    });

    Ok(chunks.into_iter().flatten().collect())
}

fn tokenize_one<E>(
    encoder: &E,
    index: usize,
    text: &str,
    max_length: usize,
) -> Result<TokenizedText>
where
    E: TokenEncoder + ?Sized,
{
    let normalized = normalize_text(text);
    if normalized.is_empty() {
        return Err(DataError::Tokenization {
            index,
            reason: "text is empty after normalization".into(),
        });
    }
    let ids = encoder
        .encode(&normalized)
        .map_err(|reason| DataError::Tokenization { index, reason })?;
    if ids.is_empty() {
        return Err(DataError::Tokenization {
            index,
            reason: "encoder produced no tokens".into(),
        });
    }
    Ok(pad_to_length(ids, max_length, encoder.pad_id()))
}
