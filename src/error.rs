//! Diagnostic error types for the service bus and schema registry.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]`
//! derives; [`CageError`] wraps them so callers at the edge (the CLI, an
//! API front end) can carry any of them with the full diagnostic chain.

use miette::Diagnostic;
use thiserror::Error;

use crate::compile::CompileError;
use crate::config::ConfigError;
use crate::convergence::ConvergenceError;
use crate::datasource::error::{DriverError, TranslatorError};
use crate::policy::error::PolicyError;

/// Top-level error type.
#[derive(Debug, Error, Diagnostic)]
pub enum CageError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Translator(#[from] TranslatorError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Convergence(#[from] ConvergenceError),
}

/// Result type for cross-subsystem operations.
pub type CageResult<T> = std::result::Result<T, CageError>;

// ---------------------------------------------------------------------------
// Bus errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum BusError {
    #[error("duplicate service name: \"{name}\"")]
    #[diagnostic(
        code(cage::bus::duplicate_name),
        help(
            "A service with this name is already registered on the bus. \
             Pick a different name or unregister the existing service first."
        )
    )]
    DuplicateName { name: String },

    #[error("service \"{name}\" failed to initialize: {message}")]
    #[diagnostic(
        code(cage::bus::initialization),
        help(
            "The service factory failed during construction (for example an \
             unreachable external dependency or missing credentials). \
             Nothing was registered; fix the cause and register again."
        )
    )]
    Initialization { name: String, message: String },

    #[error("unknown service: \"{name}\"")]
    #[diagnostic(
        code(cage::bus::unknown_service),
        help("No service with this name is registered. List names with `Bus::services()`.")
    )]
    UnknownService { name: String },

    #[error("unknown service module: \"{module}\"")]
    #[diagnostic(
        code(cage::bus::unknown_module),
        help(
            "The module name does not match any factory in the registry. \
             Register a factory under this name before creating services from it."
        )
    )]
    UnknownModule { module: String },

    #[error("no async runtime available to schedule service \"{name}\"")]
    #[diagnostic(
        code(cage::bus::no_runtime),
        help("Services run as tokio tasks; register them from inside a tokio runtime.")
    )]
    NoRuntime { name: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Service(#[from] ServiceError),
}

/// Result type for bus operations.
pub type BusResult<T> = std::result::Result<T, BusError>;

// ---------------------------------------------------------------------------
// Service errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ServiceError {
    #[error("service \"{service}\" has no action \"{action}\"")]
    #[diagnostic(
        code(cage::service::unknown_action),
        help(
            "The action is neither a registered local action nor supported by the \
             service's external API client."
        )
    )]
    UnknownAction { service: String, action: String },

    #[error("action \"{action}\" on service \"{service}\" failed: {message}")]
    #[diagnostic(
        code(cage::service::action_failed),
        help("The action handler returned an error; check its arguments.")
    )]
    ActionFailed {
        service: String,
        action: String,
        message: String,
    },

    #[error("poll of service \"{service}\" failed: {message}")]
    #[diagnostic(
        code(cage::service::poll_failed),
        help("The periodic update failed; the previous state stays published.")
    )]
    PollFailed { service: String, message: String },
}

/// Result type for service operations.
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

// ---------------------------------------------------------------------------
// Schema errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum SchemaError {
    #[error(
        "schema conflict for table \"{table}\": declared as {existing}, redeclared as {requested}"
    )]
    #[diagnostic(
        code(cage::schema::conflict),
        help(
            "The first declaration of a table wins. Use a different table name, \
             or create a fresh policy if the shape really changed."
        )
    )]
    Conflict {
        table: String,
        existing: String,
        requested: String,
    },

    #[error("table \"{table}\" declares {columns} column names but arity {arity}")]
    #[diagnostic(
        code(cage::schema::column_count),
        help("Give exactly one column name per position, or omit the names.")
    )]
    ColumnCount {
        table: String,
        arity: usize,
        columns: usize,
    },
}

/// Result type for schema operations.
pub type SchemaResult<T> = std::result::Result<T, SchemaError>;
