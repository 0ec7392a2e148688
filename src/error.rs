use thiserror::Error;

/// Problems setting up or running a constraint solver.
#[derive(Debug, Error)]
pub enum ConstraintError {
    #[error(
        "constraint {constraint}: atom index {atom} out of range; the system has {num_atoms} atoms"
    )]
    AtomOutOfRange {
        constraint: usize,
        atom: usize,
        num_atoms: usize,
    },
    #[error("constraint {constraint} connects atom {atom} to itself")]
    SelfConstraint { constraint: usize, atom: usize },
    #[error(
        "constraint {constraint}: type {type_index} is missing from the length table \
         (size {table_len})"
    )]
    UnknownType {
        constraint: usize,
        type_index: usize,
        table_len: usize,
    },
    #[error("constraint list must be (type, i, j) triples; got {0} values")]
    MalformedTriples(usize),
    #[error("{what} has {actual} entries; expected {expected}")]
    SizeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("invalid constraint configuration: {0}")]
    InvalidConfig(String),
    #[error(
        "SHAKE: inner product between old and new vector <= 0 for constraint {constraint} \
         (atoms {atom_i}-{atom_j}); the bond rotated too far during the step"
    )]
    ShakeRotationTooLarge {
        constraint: usize,
        atom_i: usize,
        atom_j: usize,
    },
    #[error("SHAKE did not converge in {iterations} iterations")]
    ShakeNotConverged { iterations: usize },
}

/// Misuse of the thread force buffers. These are programming-contract violations; callers
/// should treat them as fatal.
#[derive(Debug, Error)]
pub enum ForceBufferError {
    #[error("thread count must be between 1 and {max}; got {requested}")]
    InvalidThreadCount { requested: usize, max: usize },
    #[error("thread {thread} has not processed its reduction mask for the current decomposition")]
    MaskNotProcessed { thread: usize },
    #[error("thread {thread} buffer holds {actual} atoms; thread 0 holds {expected}")]
    AtomCountMismatch {
        thread: usize,
        expected: usize,
        actual: usize,
    },
    #[error("reduce called before setup_reduction")]
    ReductionNotSetUp,
    #[error("thread {thread} started a new decomposition since setup_reduction was called")]
    StaleReduction { thread: usize },
    #[error("{what} output has {actual} entries; the reduction needs {expected}")]
    OutputTooSmall {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{0} output is required by the step workload, but was not supplied")]
    MissingOutput(&'static str),
}

#[derive(Debug, Error)]
pub enum MdError {
    #[error(transparent)]
    Constraint(#[from] ConstraintError),
    #[error(transparent)]
    ForceBuffer(#[from] ForceBufferError),
    #[error("{0}")]
    Setup(String),
}

pub type ConstraintResult<T> = Result<T, ConstraintError>;
