use std::{env, fs, path::Path};

use anyhow::{Context, Result};
use gallery_daemon::server::docs::ApiDoc;
use utoipa::OpenApi;

/// Prints the OpenAPI document, or writes it to the path given as first argument.
fn main() -> Result<()> {
    let document = ApiDoc::openapi()
        .to_pretty_json()
        .context("failed to serialise OpenAPI")?;

    match env::args().nth(1) {
        Some(output) => {
            let path = Path::new(&output);
            if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create directory for {}", path.display())
                })?;
            }
            fs::write(path, document)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
        None => println!("{document}"),
    }

    Ok(())
}
