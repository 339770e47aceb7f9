//! Data source error types.

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum TranslatorError {
    #[error("table \"{table}\": expected an object, found {found}")]
    #[diagnostic(
        code(cage::translator::not_an_object),
        help("HDICT translators read dictionaries. Check the selector against the source data.")
    )]
    NotAnObject { table: String, found: String },

    #[error("table \"{table}\": expected a list, found {found}")]
    #[diagnostic(
        code(cage::translator::not_a_list),
        help("`in-list` HDICT and LIST translators read arrays.")
    )]
    NotAList { table: String, found: String },

    #[error("a VALUE translator cannot produce a table on its own")]
    #[diagnostic(
        code(cage::translator::top_level_value),
        help("Wrap the field in an HDICT or LIST translator that names a table.")
    )]
    TopLevelValue,

    #[error("table \"{table}\" is produced by more than one translator")]
    #[diagnostic(
        code(cage::translator::duplicate_table),
        help("Every translated table needs a unique `table-name`.")
    )]
    DuplicateTable { table: String },
}

/// Result type for translation.
pub type TranslatorResult<T> = std::result::Result<T, TranslatorError>;

#[derive(Debug, Error, Diagnostic)]
pub enum DriverError {
    #[error("driver \"{driver}\" requires option \"{option}\"")]
    #[diagnostic(
        code(cage::driver::missing_config),
        help("Add the option to the service arguments. The driver cannot start without it.")
    )]
    MissingConfig { driver: String, option: String },

    #[error("driver \"{driver}\": invalid option \"{option}\": {message}")]
    #[diagnostic(
        code(cage::driver::invalid_config),
        help("Check the option's type against the driver documentation.")
    )]
    InvalidConfig {
        driver: String,
        option: String,
        message: String,
    },

    #[error("driver \"{driver}\" could not read its source: {message}")]
    #[diagnostic(
        code(cage::driver::source),
        help("The previous state stays published; the next poll retries.")
    )]
    Source { driver: String, message: String },

    #[error("driver \"{driver}\" has no API action \"{action}\"")]
    #[diagnostic(code(cage::driver::unknown_action))]
    UnknownAction { driver: String, action: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Translate(#[from] TranslatorError),
}

/// Result type for driver operations.
pub type DriverResult<T> = std::result::Result<T, DriverError>;
