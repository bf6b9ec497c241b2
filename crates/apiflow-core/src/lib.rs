mod environment;
mod flow;
pub mod hooks;
mod result;
pub mod runtime;
pub mod storage;
mod validation;

pub use environment::*;
pub use flow::*;
pub use result::*;
pub use validation::*;
