mod infer;
mod types;

pub use infer::infer_schema;
pub use types::*;
