pub const PROTOCOL_ID: [u8; 3] = *b"ord";
pub const BODY_TAG: [u8; 0] = [];
/// Tag 1, representing the MIME type of the body.
pub const CONTENT_TYPE_TAG: [u8; 1] = [1];
/// Tag 3, representing the parent inscription.
pub const PARENT_TAG: [u8; 1] = [3];
/// Tag 5, representing CBOR metadata, stored as data pushes.
pub const METADATA_TAG: [u8; 1] = [5];
/// Tag 9, representing the encoding of the body.
pub const CONTENT_ENCODING_TAG: [u8; 1] = [9];
/// Content encoding advertised for bodies flagged as compressed.
pub const BROTLI_ENCODING: &str = "br";
/// Largest data push allowed by the tapscript policy.
pub const MAX_PUSH_SIZE: usize = 520;
/// Smallest output value relayed by default policy.
pub const DUST_LIMIT: u64 = 546;
/// Default per-inscription postage.
pub const DEFAULT_PADDING: u64 = 546;
/// Schnorr signature with the default sighash type.
pub const SCHNORR_SIGNATURE_SIZE: usize = 64;
/// Total weight of the platform fee destinations after renormalisation.
pub const FEE_WEIGHT_TOTAL: u64 = 100;
