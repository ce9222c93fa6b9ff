//! Storage of genesis parameters and content, with the ephemeral key envelope-encrypted.

mod document;
mod envelope;
mod key_service;
mod object_store;

pub use self::document::{
    content_path, transaction_path, InscriptionDoc, LeafDoc, ParentDoc, SecureDocumentStore,
};
pub use self::envelope::{decrypt, encrypt, EncryptedEnvelope};
pub use self::key_service::{DataKey, KeyService, LocalKeyService};
pub use self::object_store::{FsObjectStore, MemoryObjectStore, ObjectStore};
