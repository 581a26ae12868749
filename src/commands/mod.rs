pub mod serve;

pub use serve::{ServeArgs, ServeCommand};
