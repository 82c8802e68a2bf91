pub mod assemble;
pub mod error;
pub mod factors;
pub mod linear;
pub mod logger;
pub mod noise;
pub mod values;

pub use error::{SbaError, SbaResult};
pub use logger::{init_logger, init_logger_with_level};
