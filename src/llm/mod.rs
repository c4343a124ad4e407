pub mod client;
pub mod commentary;
pub mod extractor;
pub mod prompts;
pub mod types;
pub mod validator;

pub use client::*;
pub use commentary::*;
pub use extractor::*;
pub use types::*;
pub use validator::*;
