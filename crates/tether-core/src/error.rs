use crate::shape::Shape;

/// All errors that can occur within Tether.
///
/// One enum covers the tensor layer (shape and index failures) and the graph
/// layer (missing keys, arity mismatches, cycles, unresolvable expressions,
/// numeric divergence). Using a single error type across the workspace keeps
/// `?` propagation uniform from a kernel all the way up to the trainer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shape mismatch between two tensors.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Operation requires a specific rank (number of dimensions).
    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// Dimension index out of range for the tensor's rank.
    #[error("dimension out of range: dim {dim} for tensor with {rank} dimensions")]
    DimOutOfRange { dim: usize, rank: usize },

    /// Narrow/slice operation out of bounds.
    #[error("narrow out of bounds: dim {dim}, start {start}, len {len}, dim_size {dim_size}")]
    NarrowOutOfBounds {
        dim: usize,
        start: usize,
        len: usize,
        dim_size: usize,
    },

    /// Tried to access a scalar from a non-scalar tensor.
    #[error("not a scalar: tensor has shape {shape}")]
    NotAScalar { shape: Shape },

    /// Element count mismatch when creating from a slice.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Matrix multiplication dimension mismatch.
    #[error("matmul shape mismatch: [{m}x{k1}] @ [{k2}x{n}], inner dims must match")]
    MatmulShapeMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    /// Cannot reshape because element counts differ.
    #[error(
        "cannot reshape: source has {src} elements, target shape {dst_shape} has {dst} elements"
    )]
    ReshapeElementMismatch {
        src: usize,
        dst: usize,
        dst_shape: Shape,
    },

    /// A node or dictionary lookup referenced a key that is not present.
    #[error("missing key '{key}' required by {context}")]
    MissingKey { key: String, context: String },

    /// A block returned a different number of outputs than its node declares.
    #[error("node '{node}' declares {expected} outputs but its block returned {got}")]
    OutputArity {
        node: String,
        expected: usize,
        got: usize,
    },

    /// No valid execution order exists for a non-recurrent system.
    #[error("system '{system}' contains a dependency cycle through nodes {nodes:?}")]
    CyclicGraph { system: String, nodes: Vec<String> },

    /// An expression referenced a variable that is absent from the dictionary.
    #[error("cannot resolve '{expr}': variable '{key}' is not in the data dictionary")]
    Resolution { expr: String, key: String },

    /// A node wrote a key that already exists while the system is strict.
    #[error("node '{node}' would overwrite existing key '{key}'")]
    KeyCollision { key: String, node: String },

    /// A non-finite loss or gradient appeared during training.
    #[error("numeric divergence: non-finite {quantity} ({value}) at epoch {epoch}, batch {batch}")]
    NumericDivergence {
        quantity: String,
        value: f64,
        epoch: usize,
        batch: usize,
    },

    /// I/O failure while reading or writing a checkpoint.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Whether this error reflects a structural authoring defect (bad key,
    /// arity, cycle, unresolvable expression) rather than a runtime condition.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::MissingKey { .. }
                | Error::OutputArity { .. }
                | Error::CyclicGraph { .. }
                | Error::Resolution { .. }
                | Error::KeyCollision { .. }
        )
    }
}

/// Convenience Result type used throughout Tether.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
