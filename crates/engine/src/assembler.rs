//! Chunk assembly.
//!
//! Joins a completed session's numbered chunk files into one output
//! file. Chunks are ordered by parsed integer value, never by file name,
//! and copied through a fixed window so peak memory stays bounded
//! however large the upload. The chunk dir is removed only on success;
//! a failed assembly leaves it behind for retry or the stale-temp sweep.

use std::path::Path;

use depot_core::COPY_WINDOW_SIZE;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{EngineError, EngineResult};

fn merge_error(detail: impl std::fmt::Display) -> EngineError {
    EngineError::Assembly(detail.to_string())
}

/// Assemble the chunk files under `chunk_dir` into `dest`. Returns the
/// total bytes written.
pub async fn assemble(chunk_dir: &Path, dest: &Path) -> EngineResult<u64> {
    let mut indexed = Vec::new();
    let mut entries = fs::read_dir(chunk_dir)
        .await
        .map_err(|e| merge_error(format!("reading {}: {e}", chunk_dir.display())))?;
    while let Some(entry) = entries.next_entry().await.map_err(merge_error)? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            return Err(merge_error(format!(
                "non-utf8 entry in {}",
                chunk_dir.display()
            )));
        };
        let index: u32 = name
            .parse()
            .map_err(|_| merge_error(format!("unexpected entry {name}")))?;
        indexed.push((index, entry.path()));
    }

    if indexed.is_empty() {
        return Err(merge_error("no chunks to assemble"));
    }

    // Numeric order: "10" must come after "2".
    indexed.sort_by_key(|(index, _)| *index);
    for (expected, (index, _)) in indexed.iter().enumerate() {
        if *index as usize != expected {
            return Err(merge_error(format!("missing chunk {expected}")));
        }
    }

    let mut out = fs::File::create(dest)
        .await
        .map_err(|e| merge_error(format!("creating {}: {e}", dest.display())))?;
    let mut window = vec![0u8; COPY_WINDOW_SIZE];
    let mut total: u64 = 0;
    for (index, path) in &indexed {
        let mut chunk = fs::File::open(path)
            .await
            .map_err(|e| merge_error(format!("opening chunk {index}: {e}")))?;
        loop {
            let n = chunk
                .read(&mut window)
                .await
                .map_err(|e| merge_error(format!("reading chunk {index}: {e}")))?;
            if n == 0 {
                break;
            }
            out.write_all(&window[..n])
                .await
                .map_err(|e| merge_error(format!("writing chunk {index}: {e}")))?;
            total += n as u64;
        }
    }
    out.flush().await.map_err(merge_error)?;
    out.sync_all().await.map_err(merge_error)?;

    if let Err(error) = fs::remove_dir_all(chunk_dir).await {
        tracing::warn!(%error, dir = %chunk_dir.display(), "assembled but failed to remove chunk dir");
    }
    Ok(total)
}
