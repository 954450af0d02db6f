//! Purpose: Define the public Rust API boundary for the search data extractor.
//! Exports: Gate, export, registry, store and identity types used by the binary and embedders.
//! Role: Public, additive-only surface; hides internal module layout.
//! Invariants: This module is the only public path to core types.

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::cursor::{START, format_cursor, parse_offset};
pub use crate::core::error::{Error, ErrorKind, to_http_status};
pub use crate::core::export::{
    CLASS_NOT_ALLOWED_MESSAGE, DEFAULT_PAGINATION_LIMIT, Envelope, EnvelopeHook, ExportRequest,
    ExportSettings, Exporter, MISSING_CLASS_MESSAGE, MetadataHook, RequestEcho,
};
pub use crate::core::field_map::{CanViewTypeRule, FieldMap, ID_FIELD};
pub use crate::core::gate::{
    BasicAuth, DEFAULT_REALM, ENTER_CREDENTIALS_MESSAGE, ENV_DISABLE_HTTPS, Environment,
    INSECURE_TRANSPORT_MESSAGE, NOT_PERMITTED_MESSAGE, Transport, TransportPolicy,
    UNRECOGNISED_MESSAGE, env_flag_is_set, parse_basic_credentials,
};
pub use crate::core::identity::{
    ADMIN_PERMISSION_CODE, API_PERMISSION_CODE, Identity, Member, MemberStore, PERMISSIONS,
    generate_salt, hash_password,
};
pub use crate::core::record::{
    MemoryStore, PageQuery, ReadingMode, Record, RecordStore, StoredRecord,
};
pub use crate::core::registry::{
    AllowList, Capability, ExportRegistry, ExportType, SearchDataExtractable, VisibilityPredicate,
};
