use bitcoin::script::PushBytesBuf;

use super::constants::MAX_PUSH_SIZE;
use crate::OrdResult;

pub fn bytes_to_push_bytes(bytes: &[u8]) -> OrdResult<PushBytesBuf> {
    Ok(PushBytesBuf::try_from(bytes.to_vec())?)
}

/// Splits `bytes` into pushes of at most [`MAX_PUSH_SIZE`] bytes. Empty input gives no push.
pub fn push_chunks(bytes: &[u8]) -> OrdResult<Vec<PushBytesBuf>> {
    bytes.chunks(MAX_PUSH_SIZE).map(bytes_to_push_bytes).collect()
}
