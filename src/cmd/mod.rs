//! Command-line entry points.

use tokio::{fs::File, io::AsyncWrite};

use crate::prelude::*;

pub mod ocr;
pub mod schema;

/// Create a writer for `path`, or standard output if `None`.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}
