use crate::config::Method;
use crate::data::partition::Stratum;

/// Errors raised by the contrastive training core.
#[derive(Debug, thiserror::Error)]
pub enum CncError {
    /// A configuration value is out of range or two options conflict.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Both a model and a config were handed to the trainer.
    #[error("Cannot pass both `model` and `config`")]
    ModelAndConfig,

    /// Contrastive temperature must be strictly positive.
    #[error("Temperature must be positive and finite, got {0}")]
    NonPositiveTemperature(f64),

    /// The partitioner received an example outside the four known groups.
    #[error("Example {id} has group id {group_id}, expected one of 0..=3")]
    InvalidGroup { id: String, group_id: i64 },

    /// Identity-match anchors must come from a majority group.
    #[error("Anchor {id} has group id {group_id}; anchors must come from group 0 or 3")]
    InvalidAnchorGroup { id: String, group_id: i64 },

    /// No examples to draw companions from.
    #[error("Stratum {0} is empty")]
    EmptyStratum(Stratum),

    /// Feature-proximity sampling needs auxiliary features on every batch member.
    #[error("Example {0} has no auxiliary features")]
    MissingFeatures(String),

    /// Subgroup attributes are binary.
    #[error("Example {id}: subgroup attribute `{column}` must be 0 or 1, got {value}")]
    InvalidSubgroupAttribute { id: String, column: String, value: i64 },

    /// Bit-packed group ids only make sense for binary targets.
    #[error("Example {id}: target {target} is not binary but subgroup columns are configured")]
    NonBinaryTarget { id: String, target: u32 },

    /// Tensor or row shapes disagree.
    #[error("Shape mismatch: {0}")]
    Shape(String),

    /// The method parses but this core does not train it.
    #[error("Method `{0}` is not supported by this trainer")]
    UnsupportedMethod(Method),

    /// Malformed manifest line.
    #[error("Failed to parse line {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CncError>;
