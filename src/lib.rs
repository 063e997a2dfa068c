pub mod cmd;
pub mod credentials;
pub mod db;
mod error;
pub mod format;
pub mod history;
pub mod jobs;
pub mod metadata;
pub mod options;
pub mod parser;
pub mod paths;
pub mod process;
pub mod tools;

pub use error::{EngineError, Result};
