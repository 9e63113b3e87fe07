//! Object types exposed by the resource store.

/// Metadata of a stored object as seen through list and get.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Object name, unique within its group-resource.
    pub name: String,
    /// Resource version, bumped on every write.
    pub resource_version: u64,
    /// Encrypted-by marker: tag of the provider that last sealed this
    /// record, e.g. `identity` or `aescbc:1-ab12cd`.
    pub provider: String,
}

/// A decrypted object as returned by get.
#[derive(Debug, Clone)]
pub struct StoredObject {
    /// Object metadata.
    pub meta: ObjectMeta,
    /// Decrypted payload.
    pub payload: Vec<u8>,
}

/// The raw stored representation of an object, for inspecting which provider
/// encrypted it and whether the bytes are plaintext.
#[derive(Debug, Clone)]
pub struct RawRecord {
    /// Encrypted-by marker.
    pub provider: String,
    /// Stored bytes: plaintext under identity, sealed ciphertext otherwise.
    pub data: Vec<u8>,
}

/// One page of a paginated list.
#[derive(Debug, Clone)]
pub struct ObjectPage {
    /// Object metadata in name order.
    pub items: Vec<ObjectMeta>,
    /// Opaque continuation token; `None` on the last page.
    pub continue_token: Option<String>,
}
