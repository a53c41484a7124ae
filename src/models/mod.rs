pub mod entry;
pub mod result;

pub use entry::*;
pub use result::*;
