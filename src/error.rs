//! Rich diagnostic error types for the airis agent.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes and help text. Knowledge gaps and prediction mismatches
//! are never errors; only structural damage to the knowledge store, storage
//! failures, bad configuration, and protocol misuse surface here.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the airis agent.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain through to the user.
#[derive(Debug, Error, Diagnostic)]
pub enum AirisError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Knowledge(#[from] KnowledgeError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Agent(#[from] AgentError),
}

// ---------------------------------------------------------------------------
// Knowledge errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum KnowledgeError {
    #[error("rule {rule} under trigger value {trigger} lost its last inclusion condition")]
    #[diagnostic(
        code(airis::knowledge::structurally_broken),
        help(
            "Pruning removed every inclusion condition of this rule, so the store can \
             no longer tell when it applies. This usually means the environment is not \
             deterministic with respect to the observed grid and auxiliary values. \
             The store refuses to persist until it is rebuilt from a clean state."
        )
    )]
    StructurallyBroken { rule: u32, trigger: i64 },

    #[error("refusing to serialize a knowledge store with {count} broken rule(s)")]
    #[diagnostic(
        code(airis::knowledge::corrupted),
        help(
            "A structural inconsistency was detected earlier. Saving now would persist \
             a corrupted store. Discard this session's knowledge or reload the last snapshot."
        )
    )]
    Corrupted { count: usize },

    #[error("rule not found: {rule}")]
    #[diagnostic(
        code(airis::knowledge::rule_not_found),
        help("The rule id does not exist in this store. Ids are only valid for the store that issued them.")
    )]
    RuleNotFound { rule: u32 },

    #[error("exception not found: {exception}")]
    #[diagnostic(
        code(airis::knowledge::exception_not_found),
        help("The exception id does not exist in this store. Ids are only valid for the store that issued them.")
    )]
    ExceptionNotFound { exception: u32 },
}

/// Result type for knowledge store operations.
pub type KnowledgeResult<T> = std::result::Result<T, KnowledgeError>;

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("I/O error: {source}")]
    #[diagnostic(
        code(airis::store::io),
        help(
            "A filesystem operation failed. Check that the data directory exists, \
             has correct permissions, and that the disk is not full."
        )
    )]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("redb transaction error: {message}")]
    #[diagnostic(
        code(airis::store::redb),
        help(
            "The embedded database encountered a transaction error. \
             Try running with a fresh data directory."
        )
    )]
    Redb { message: String },

    #[error("serialization error: {message}")]
    #[diagnostic(
        code(airis::store::serde),
        help(
            "Failed to serialize or deserialize the knowledge snapshot. \
             This usually means the snapshot was written by an incompatible version."
        )
    )]
    Serialization { message: String },
}

// ---------------------------------------------------------------------------
// Config errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read agent config: {path}")]
    #[diagnostic(
        code(airis::config::read),
        help("Ensure the config file exists and is valid TOML.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse agent config: {path}")]
    #[diagnostic(
        code(airis::config::parse),
        help("Check the TOML syntax in the agent config file.")
    )]
    Parse { path: String, message: String },

    #[error("failed to write agent config: {path}")]
    #[diagnostic(
        code(airis::config::write),
        help("Ensure you have write permissions to the config directory.")
    )]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("the action space is empty")]
    #[diagnostic(
        code(airis::config::empty_action_space),
        help("Declare at least one entry under [[actions]] in the agent config.")
    )]
    EmptyActionSpace,

    #[error("action \"{action}\" has an empty output range [{min}, {max}) step {step}")]
    #[diagnostic(
        code(airis::config::output_range),
        help("Output ranges are half-open: `min` must be below `max` and `step` must be positive.")
    )]
    InvalidOutputRange {
        action: String,
        min: i64,
        max: i64,
        step: i64,
    },
}

// ---------------------------------------------------------------------------
// Agent errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum AgentError {
    #[error("grid row {row} has {actual} cells, expected {expected}")]
    #[diagnostic(
        code(airis::agent::ragged_grid),
        help("Every row of an observation grid must have the same width.")
    )]
    RaggedGrid {
        row: usize,
        expected: usize,
        actual: usize,
    },

    #[error("observation shape {actual_width}x{actual_height} does not match {expected_width}x{expected_height}")]
    #[diagnostic(
        code(airis::agent::shape_mismatch),
        help(
            "The grid dimensions and auxiliary vector length are fixed for the lifetime \
             of an agent. Pad or crop observations to the first observed shape."
        )
    )]
    ShapeMismatch {
        expected_width: usize,
        expected_height: usize,
        actual_width: usize,
        actual_height: usize,
    },

    #[error("auxiliary vector has {actual} values, expected {expected}")]
    #[diagnostic(
        code(airis::agent::aux_length),
        help("The auxiliary vector length is fixed for the lifetime of an agent.")
    )]
    AuxLength { expected: usize, actual: usize },

    #[error("unknown action \"{label}\" with output {output}")]
    #[diagnostic(
        code(airis::agent::unknown_action),
        help("Only actions declared in the agent's action space can be predicted or learned from.")
    )]
    UnknownAction { label: String, output: i64 },

    #[error("observe_after called without a preceding observation")]
    #[diagnostic(
        code(airis::agent::no_prior),
        help("Call `observe_before` (or `predict_action`) with the pre-action observation first.")
    )]
    NoPriorObservation,
}

/// Convenience result type for the airis crate.
pub type AirisResult<T> = std::result::Result<T, AirisError>;
