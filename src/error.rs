//! Error types for the campaign mailer.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Campaign registration errors. All of these are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Campaign ident may not be empty")]
    EmptyIdentifier,

    #[error("Campaign ident \"{0}\" already registered")]
    DuplicateIdentifier(String),

    #[error("Unknown campaign ident \"{0}\"")]
    UnknownCampaign(String),
}

/// Template lookup and rendering errors.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("Template not found: {0}")]
    NotFound(String),

    #[error("Failed to load template {reference}: {reason}")]
    Load { reference: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outbound transmission errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Message has no recipients")]
    NoRecipients,

    #[error("Failed to build message: {0}")]
    Build(String),

    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Errors raised while evaluating a campaign predicate against one record.
///
/// These never abort a run; the record is treated as ineligible.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PredicateError {
    #[error("Record {record} has no field `{field}`")]
    MissingField { record: String, field: String },

    #[error("Field `{field}` on record {record} is not a {expected}")]
    WrongType {
        record: String,
        field: String,
        expected: &'static str,
    },

    #[error("Predicate failed: {0}")]
    Other(String),
}

/// Result type alias for the mailer.
pub type Result<T> = std::result::Result<T, Error>;
