pub mod enums;
pub mod experiment;

pub use enums::*;
pub use experiment::*;
