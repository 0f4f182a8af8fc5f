//! Script bundles.
//!
//! A bundle is a zip archive with a top-level entry point `main.<ext>` and
//! any number of importable modules. [`build`] packages a source directory;
//! [`Bundle`] reads modules back out of the archive bytes.

mod reader;
mod writer;

pub use reader::{Bundle, BundleEntry};
pub use writer::build;

/// File extension of a packaged bundle.
pub const BUNDLE_EXTENSION: &str = ".fzz";

/// Script file extensions, in lookup order.
pub const SCRIPT_EXTENSIONS: [&str; 2] = [".risor", ".rsr"];

/// Module name of the entry point.
pub const ENTRY_POINT: &str = "main";

#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("bundle source is empty")]
    IsEmpty,
    #[error("bundle source has no main script")]
    MissingMain,
    #[error("main script is not a regular file: {0}")]
    InvalidMain(String),
    #[error("module not found: {0}")]
    ModuleNotFound(String),
    #[error("bundle io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bundle archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// Normalise a module name to its archive form: forward slashes, no
/// leading `./` or `/`.
fn module_key(name: &str) -> String {
    let name = name.replace('\\', "/");
    let mut name = name.as_str();
    loop {
        if let Some(rest) = name.strip_prefix("./") {
            name = rest;
        } else if let Some(rest) = name.strip_prefix('/') {
            name = rest;
        } else {
            break;
        }
    }
    name.to_string()
}
