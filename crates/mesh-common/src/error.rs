//! Error types for the mesh operator
//!
//! Errors are classified so callers can treat expected conditions locally:
//! not-found means "already absent", conflicts are retried by the conflict
//! handler, and a kind that is not registered means the feature is not
//! present on the cluster. Batch operations collect per-object failures into
//! [`Error::Aggregate`] so sibling objects keep converging.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for mesh operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// The object (or its namespace) does not exist
    #[error("not found: {resource}")]
    NotFound {
        /// Description of the missing resource
        resource: String,
    },

    /// Create was rejected because the object already exists
    #[error("already exists: {resource}")]
    AlreadyExists {
        /// Description of the existing resource
        resource: String,
    },

    /// Optimistic-concurrency conflict (stale resourceVersion)
    #[error("conflict: {message}")]
    Conflict {
        /// Server or store message
        message: String,
    },

    /// The API group/kind is not served by the cluster (CRD missing)
    #[error("kind not registered: {api_version}, Kind={kind}")]
    KindNotRegistered {
        /// Requested apiVersion
        api_version: String,
        /// Requested kind
        kind: String,
    },

    /// The server rejected the write as structurally invalid
    /// (e.g. an immutable field changed)
    #[error("invalid object: {message}")]
    Invalid {
        /// Server or store message
        message: String,
    },

    /// A patch would change identity fields of the object
    #[error("precondition failed for {field}: {message}")]
    PreconditionFailed {
        /// The identity field the patch tried to change
        field: String,
        /// Description of the violation
        message: String,
    },

    /// Namespace already belongs to a different mesh
    #[error("namespace {namespace} is already a member of mesh {member_of}, cannot add it to {requested}")]
    MembershipConflict {
        /// The member namespace
        namespace: String,
        /// Mesh namespace currently recorded on the namespace
        member_of: String,
        /// Mesh namespace that tried to claim it
        requested: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Validation error for specs and manifests
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.members")
        field: Option<String>,
    },

    /// A bounded wait gave up
    #[error("timed out waiting for {operation}: {message}")]
    Timeout {
        /// The operation that was waited on
        operation: String,
        /// Description of the last observed state
        message: String,
    },

    /// Unclassified Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        source: kube::Error,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "store")
        context: String,
    },

    /// Another error with additional context
    #[error("{context}: {source}")]
    Context {
        /// What was being attempted
        context: String,
        /// The underlying error
        source: Box<Error>,
    },

    /// Several independent failures from a batch operation
    #[error("{}", format_aggregate(.0))]
    Aggregate(Vec<Error>),
}

fn format_aggregate(errors: &[Error]) -> String {
    match errors {
        [] => String::new(),
        [single] => single.to_string(),
        many => {
            let joined: Vec<String> = many.iter().map(|e| e.to_string()).collect();
            format!("[{}]", joined.join(", "))
        }
    }
}

impl From<kube::Error> for Error {
    fn from(source: kube::Error) -> Self {
        if let kube::Error::Api(response) = &source {
            match (response.code, response.reason.as_str()) {
                (404, _) => {
                    return Error::NotFound {
                        resource: response.message.clone(),
                    }
                }
                (409, "AlreadyExists") => {
                    return Error::AlreadyExists {
                        resource: response.message.clone(),
                    }
                }
                (409, _) => {
                    return Error::Conflict {
                        message: response.message.clone(),
                    }
                }
                (422, _) => {
                    return Error::Invalid {
                        message: response.message.clone(),
                    }
                }
                _ => {}
            }
        }
        Error::Kube { source }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

impl Error {
    /// Create a not-found error
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict {
            message: msg.into(),
        }
    }

    /// Create a kind-not-registered error
    pub fn kind_not_registered(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::KindNotRegistered {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }

    /// Create a structural-rejection error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid {
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with a field path
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Wrap this error with a description of what was being attempted
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Collapse a list of errors into a single result.
    ///
    /// Nested aggregates are flattened. No errors yields `Ok(())`, exactly
    /// one error is returned as-is.
    pub fn aggregate(errors: Vec<Error>) -> Result<(), Error> {
        let mut flat = Vec::with_capacity(errors.len());
        for error in errors {
            match error {
                Error::Aggregate(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Ok(()),
            1 => Err(flat.remove(0)),
            _ => Err(Error::Aggregate(flat)),
        }
    }

    /// The innermost errors with `Context` wrappers and aggregates removed
    pub fn leaves(&self) -> Vec<&Error> {
        match self {
            Error::Context { source, .. } => source.leaves(),
            Error::Aggregate(errors) => errors.iter().flat_map(|e| e.leaves()).collect(),
            other => vec![other],
        }
    }

    fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the object was missing
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::NotFound { .. })
    }

    /// Whether the create hit an existing object
    pub fn is_already_exists(&self) -> bool {
        matches!(self.root(), Error::AlreadyExists { .. })
    }

    /// Whether this is a single optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), Error::Conflict { .. })
    }

    /// Whether the kind is not served by the cluster
    pub fn is_kind_not_registered(&self) -> bool {
        matches!(self.root(), Error::KindNotRegistered { .. })
    }

    /// Whether the server rejected the object as structurally invalid
    pub fn is_invalid(&self) -> bool {
        matches!(self.root(), Error::Invalid { .. })
    }

    /// Whether every distinct underlying cause is a conflict.
    ///
    /// Unwraps context wrappers and aggregates. An aggregate that mixes a
    /// conflict with any other error is not a pure conflict.
    pub fn is_pure_conflict(&self) -> bool {
        let leaves = self.leaves();
        !leaves.is_empty()
            && leaves
                .iter()
                .all(|leaf| matches!(leaf, Error::Conflict { .. }))
    }
}
