//! Error type shared by every stage of the BA81 engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Ba81Error {
    #[error("quadrature points ({points}) and areas ({areas}) must have the same length")]
    QuadratureLength { points: usize, areas: usize },

    #[error("quadrature rule must contain at least one point")]
    EmptyQuadrature,

    #[error("item model interface version {found} is older than the minimum supported {required}")]
    InterfaceVersion { found: u32, required: u32 },

    #[error("item {item}: unknown item model id {id}")]
    UnknownModel { item: usize, id: i64 },

    #[error("item {item}: {what}")]
    InvalidSpec { item: usize, what: String },

    #[error("{what}: expected {expected} rows or columns, found {found}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("data column {column}, row {row}: value {value} is not a category")]
    NonCategorical {
        row: usize,
        column: usize,
        value: f64,
    },

    #[error("data column {column} has category {found} but item declares {outcomes} outcomes")]
    OutcomeOverflow {
        column: usize,
        found: i32,
        outcomes: usize,
    },

    #[error("data row {row} has no observed responses")]
    EmptyRow { row: usize },

    #[error("design matrix entry ({item}, {dim}) = {value} is not a valid ability index")]
    DesignValue { item: usize, dim: usize, value: f64 },

    #[error("item {item} is assigned to {found} abilities but has only {dims} dimensions")]
    DesignOverflow {
        item: usize,
        found: usize,
        dims: usize,
    },

    #[error("item {item} can only belong to one specific factor")]
    MultipleSpecific { item: usize },

    #[error("free parameter {free}: item {item}, parameter {param} is out of range")]
    ParamOutOfRange {
        free: usize,
        item: usize,
        param: usize,
    },

    #[error("item {item}, parameter {param} is claimed by more than one free parameter")]
    DuplicateParam { item: usize, param: usize },

    #[error("expected {expected} free values, found {found}")]
    FreeValueLength { expected: usize, found: usize },

    #[error("prior algebra must be 1x1, found {rows}x{cols}")]
    NonScalarAlgebra { rows: usize, cols: usize },

    #[error("prior density is not finite ({0})")]
    NonFinitePrior(f64),

    #[error("fit requested before the first E-step")]
    NoEstep,

    #[error("failed to build thread pool: {0}")]
    ThreadPool(String),
}

pub type Result<T> = std::result::Result<T, Ba81Error>;

#[cfg(feature = "python")]
impl From<Ba81Error> for pyo3::PyErr {
    fn from(err: Ba81Error) -> pyo3::PyErr {
        pyo3::exceptions::PyValueError::new_err(err.to_string())
    }
}
