pub mod schema;
pub mod tuple;
pub mod value;

pub use schema::{Column, Schema};
pub use tuple::Tuple;
pub use value::{DataType, Value};
