pub mod executor;
pub mod expressions;

pub use executor::{Executor, QueryResult, Session};
pub use expressions::{eval, RowSchema};
