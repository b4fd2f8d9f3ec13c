use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{Bytes, BytesMut};
use rchat_abstract::FileChunk;

/// Split `bytes` at fixed `chunk_size` boundaries and base64 each piece.
pub fn split_file(file_name: &str, bytes: &[u8], chunk_size: usize) -> Vec<FileChunk> {
    let pieces: Vec<&[u8]> = bytes.chunks(chunk_size.max(1)).collect();
    let total = pieces.len() as u32;
    pieces
        .into_iter()
        .enumerate()
        .map(|(index, piece)| FileChunk {
            file_name: file_name.to_string(),
            index: index as u32,
            total,
            data: STANDARD.encode(piece),
        })
        .collect()
}

/// Decode base64 chunks delivered in index order and concatenate them.
pub fn join_chunks(chunks: &[String]) -> Result<Bytes, base64::DecodeError> {
    let mut out = BytesMut::new();
    for chunk in chunks {
        out.extend_from_slice(&STANDARD.decode(chunk)?);
    }
    Ok(out.freeze())
}
