//! Original-message storage: the raw message written to the blob store,
//! optionally gzip-compressed. Compressed objects carry a `.gz` suffix and
//! reading picks decompression from that suffix.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use uuid::Uuid;

use super::AttachmentStore;
use crate::config::GatewayConfig;
use crate::error::StorageError;

const GZIP_SUFFIX: &str = ".gz";

/// Where an original message went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredOriginal {
    pub reference: String,
    pub compressed: bool,
}

/// Write `raw` to `store` under a random `.eml` name, compressed per config.
pub async fn store_original(
    store: &dyn AttachmentStore,
    raw: &[u8],
    config: &GatewayConfig,
) -> Result<StoredOriginal, StorageError> {
    let base = format!("{}.eml", Uuid::new_v4().simple());
    let (bytes, name) = if config.compress_original_message {
        (gzip(raw, config.original_message_compression)?, format!("{base}{GZIP_SUFFIX}"))
    } else {
        (raw.to_vec(), base)
    };
    let reference = store.save(&bytes, &name).await?;
    Ok(StoredOriginal {
        compressed: reference.ends_with(GZIP_SUFFIX),
        reference,
    })
}

/// Read an original message back, decompressing `.gz` references.
pub async fn load_original(store: &dyn AttachmentStore, reference: &str) -> Result<Vec<u8>, StorageError> {
    let bytes = store.read(reference).await?;
    if reference.ends_with(GZIP_SUFFIX) {
        gunzip(&bytes)
    } else {
        Ok(bytes)
    }
}

fn gzip(data: &[u8], level: u32) -> Result<Vec<u8>, StorageError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level.min(9)));
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>, StorageError> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| StorageError::Encoding(format!("gzip: {e}")))?;
    Ok(out)
}
