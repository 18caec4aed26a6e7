use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("No token provided")]
    MissingToken,
    #[error("Malformed token")]
    MalformedToken,
    #[error("Token signature mismatch")]
    BadSignature,
    #[error("Token has expired")]
    Expired,
    #[error("Token was not issued by this relay")]
    BadIssuer,
    #[error("Token signing failed: {0}")]
    Signing(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Store call timed out")]
    Timeout,
    #[error("Store rejected write: {0}")]
    Conflict(String),
}

impl StoreError {
    /// Transient failures are retried by [`crate::store::RetryPolicy`].
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("Authentication failed: {0}")]
    Authentication(#[from] AuthError),
    #[error("{0}")]
    Validation(String),
    #[error("Room {0} not found")]
    RoomNotFound(String),
    #[error("Room is not active")]
    RoomInactive,
    #[error("Room is full")]
    RoomFull,
    #[error("User already in the room")]
    AlreadyMember,
    #[error("Room is private and needs admin approval")]
    ApprovalRequired,
    #[error("User is not in the room")]
    NotMember,
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("User is already an admin")]
    AlreadyAdmin,
    #[error("Cannot remove the room creator")]
    CannotRemoveCreator,
    #[error("Message is already deleted")]
    AlreadyDeleted,
    #[error("Message {0} not found")]
    MessageNotFound(String),
    #[error("Store unavailable, try again: {0}")]
    StoreUnavailable(String),
}

impl ChatError {
    pub fn kind(&self) -> &'static str {
        match self {
            ChatError::Authentication(_) => "authentication",
            ChatError::Validation(_) => "validation",
            ChatError::RoomNotFound(_) => "room-not-found",
            ChatError::RoomInactive => "room-inactive",
            ChatError::RoomFull => "room-full",
            ChatError::AlreadyMember => "already-member",
            ChatError::ApprovalRequired => "approval-required",
            ChatError::NotMember => "not-member",
            ChatError::PermissionDenied(_) => "permission-denied",
            ChatError::AlreadyAdmin => "already-admin",
            ChatError::CannotRemoveCreator => "cannot-remove-creator",
            ChatError::AlreadyDeleted => "already-deleted",
            ChatError::MessageNotFound(_) => "message-not-found",
            ChatError::StoreUnavailable(_) => "store-unavailable",
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        ChatError::PermissionDenied(reason.into())
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        ChatError::Validation(reason.into())
    }
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        ChatError::StoreUnavailable(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("No certificate found in {0}")]
    NoCertificate(String),
    #[error("No private key found in {0}")]
    NoPrivateKey(String),
    #[error("Expected <user_id>:<username>, got {0:?}")]
    BadTokenSubject(String),
    #[error(transparent)]
    Token(#[from] AuthError),
}
