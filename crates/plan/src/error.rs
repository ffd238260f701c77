use thiserror::Error;

use crate::operator::OpId;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PlanError {
    #[error("plan has no root")]
    NoRoot,
    #[error("operator {0:?} has no child at index {1}")]
    MissingChild(OpId, usize),
    #[error("expression {0} was never produced by any operator")]
    ExprNotProduced(u32),
    #[error("unsupported plan shape: {0}")]
    Unsupported(&'static str),
    #[error("unexpected: {0}")]
    Unexpected(String),
}

pub type Result<T> = std::result::Result<T, PlanError>;
