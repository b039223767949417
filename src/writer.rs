use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::deployment::Deployment;
use crate::engine::Outputs;

pub const MANIFEST: &str = "manifest.json";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Could not write {0}: {1}")]
    IoError(PathBuf, std::io::Error),

    #[error("Could not serialize {0}: {1}")]
    SerializationError(String, serde_json::Error),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ManifestEntry<'a> {
    stack_name: &'a str,
    template_file: String,
    dependencies: Vec<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Manifest<'a> {
    service: &'a str,
    environment: &'a str,
    stacks: Vec<ManifestEntry<'a>>,
}

pub fn template_file(stack_name: &str) -> String {
    format!("{}.template.json", stack_name)
}

fn write(path: &Path, contents: String) -> Result<(), Error> {
    fs::write(path, contents).map_err(|err| Error::IoError(path.to_path_buf(), err))
}

/// Writes one `<stack>.template.json` per stack plus a manifest listing the
/// stacks in deployment order.
pub fn write_templates(dir: &Path, deployment: &Deployment) -> Result<Vec<PathBuf>, Error> {
    fs::create_dir_all(dir).map_err(|err| Error::IoError(dir.to_path_buf(), err))?;

    let mut written = Vec::new();
    let mut entries = Vec::new();
    for stack in deployment.stacks() {
        let body = stack
            .to_template_body()
            .map_err(|err| Error::SerializationError(stack.name().to_string(), err))?;
        let file = template_file(stack.name());
        let path = dir.join(&file);
        write(&path, body)?;
        info!(path = %path.display(), "wrote template");
        written.push(path);

        entries.push(ManifestEntry {
            stack_name: stack.name(),
            template_file: file,
            dependencies: stack.dependencies().iter().map(String::as_str).collect(),
        });
    }

    let manifest = Manifest {
        service: &deployment.service,
        environment: &deployment.environment,
        stacks: entries,
    };
    let contents = serde_json::to_string_pretty(&manifest)
        .map_err(|err| Error::SerializationError(String::from(MANIFEST), err))?;
    let path = dir.join(MANIFEST);
    write(&path, contents)?;
    written.push(path);

    return Ok(written);
}

/// Writes `{stack: {key: value}}`.
pub fn write_outputs(path: &Path, outputs: &Outputs) -> Result<(), Error> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| Error::IoError(parent.to_path_buf(), err))?;
    }

    let contents = serde_json::to_string_pretty(outputs)
        .map_err(|err| Error::SerializationError(path.display().to_string(), err))?;
    write(path, contents)?;
    info!(path = %path.display(), stacks = outputs.len(), "wrote stack outputs");

    return Ok(());
}
