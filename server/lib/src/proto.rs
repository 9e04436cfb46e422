//! Error and result types surfaced across the operation boundary. These are
//! serialisable so that a protocol layer can relay them without translation.

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SchemaError {
    NoClassFound,
    InvalidClass(Vec<String>),
    MissingMustAttribute(Vec<String>),
    RdnValueMissing(String),
    InvalidAttribute(String),
    InvalidAttributeSyntax(String),
    AttributeNotAllowed(String),
    EmptyFilter,
    Corrupted,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PluginError {
    AttrUnique(String),
    ReferentialIntegrity(String),
    ShortCircuit(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyError {
    Unknown,
    QueryServerSearchFailure,
    DnIndexCorrupt(String),
    DnNotUnique(String),
    RefintNotUpheld(String),
    DuplicateUniqueAttribute(String, String),
    InvalidAttributeType(String),
    BackendIndexSync(String),
}

/// Raised while validating configuration, before any engine component is
/// constructed. These never occur mid-operation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigError {
    UnknownAttributeType(String),
    InvalidBaseDn(String),
    NegativeInterval(i64),
    EmptyAttributeList,
    EmptyBaseDnList,
    DuplicateBackendName(String),
    OverlappingBackendBase(String),
    UnsupportedPluginCapability(String),
    InvalidFilter(String),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "lowercase")]
pub enum OperationError {
    EmptyRequest,
    Backend,
    NoSuchEntry,
    EntryAlreadyExists,
    NoSuchParent,
    NotAllowedOnNonLeaf,
    BackendReadOnly,
    NoMatchingBackend,
    SchemaViolation(SchemaError),
    Plugin(PluginError),
    ShortCircuited(ResultCode),
    ConsistencyError(Vec<ConsistencyError>),
    InvalidDistinguishedName(String),
    InvalidAttributeName(String),
    InvalidValueState,
    InvalidEntryState,
    InvalidRequestState,
    InvalidState,
    InvalidFilter(String),
    FilterGeneration,
    LockAcquisitionTimeout,
    Cancelled,
    SizeLimitExceeded,
    TimeLimitExceeded,
    SerdeJsonError,
    FsError,
    QueueDisconnected,
}

impl PartialEq for OperationError {
    fn eq(&self, other: &Self) -> bool {
        // Discriminant equality only. The payloads carry diagnostic detail
        // and tests should not have to reproduce it.
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl Eq for OperationError {}

/// Result codes surfaced to protocol layers and to the short-circuit control.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ResultCode {
    Success,
    OperationsError,
    TimeLimitExceeded,
    SizeLimitExceeded,
    NoSuchObject,
    ConstraintViolation,
    EntryAlreadyExists,
    NotAllowedOnNonLeaf,
    UnwillingToPerform,
    Busy,
    Cancelled,
    Other,
}

impl ResultCode {
    /// Decode a result code from its wire integer form. Unknown values map
    /// to `Other` rather than failing, as controls are opaque until used.
    pub fn from_wire(value: u32) -> Self {
        match value {
            0 => ResultCode::Success,
            1 => ResultCode::OperationsError,
            3 => ResultCode::TimeLimitExceeded,
            4 => ResultCode::SizeLimitExceeded,
            32 => ResultCode::NoSuchObject,
            19 => ResultCode::ConstraintViolation,
            68 => ResultCode::EntryAlreadyExists,
            66 => ResultCode::NotAllowedOnNonLeaf,
            53 => ResultCode::UnwillingToPerform,
            51 => ResultCode::Busy,
            118 => ResultCode::Cancelled,
            _ => ResultCode::Other,
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            ResultCode::Success => 0,
            ResultCode::OperationsError => 1,
            ResultCode::TimeLimitExceeded => 3,
            ResultCode::SizeLimitExceeded => 4,
            ResultCode::ConstraintViolation => 19,
            ResultCode::NoSuchObject => 32,
            ResultCode::Busy => 51,
            ResultCode::UnwillingToPerform => 53,
            ResultCode::NotAllowedOnNonLeaf => 66,
            ResultCode::EntryAlreadyExists => 68,
            ResultCode::Cancelled => 118,
            ResultCode::Other => 80,
        }
    }
}

impl From<&OperationError> for ResultCode {
    fn from(err: &OperationError) -> Self {
        match err {
            OperationError::NoSuchEntry | OperationError::NoMatchingBackend => {
                ResultCode::NoSuchObject
            }
            OperationError::EntryAlreadyExists => ResultCode::EntryAlreadyExists,
            OperationError::NoSuchParent => ResultCode::NoSuchObject,
            OperationError::NotAllowedOnNonLeaf => ResultCode::NotAllowedOnNonLeaf,
            OperationError::BackendReadOnly => ResultCode::UnwillingToPerform,
            OperationError::Plugin(PluginError::AttrUnique(_)) => ResultCode::ConstraintViolation,
            OperationError::Plugin(_) => ResultCode::UnwillingToPerform,
            OperationError::SchemaViolation(_) => ResultCode::ConstraintViolation,
            OperationError::ShortCircuited(rc) => *rc,
            OperationError::LockAcquisitionTimeout => ResultCode::Busy,
            OperationError::Cancelled => ResultCode::Cancelled,
            OperationError::SizeLimitExceeded => ResultCode::SizeLimitExceeded,
            OperationError::TimeLimitExceeded => ResultCode::TimeLimitExceeded,
            _ => ResultCode::OperationsError,
        }
    }
}

/// Collapse an operation result into the result code a caller would see.
pub fn result_code_of(result: &Result<(), OperationError>) -> ResultCode {
    match result {
        Ok(()) => ResultCode::Success,
        Err(e) => e.into(),
    }
}
