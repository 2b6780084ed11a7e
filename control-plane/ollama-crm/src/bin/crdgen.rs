//! Writes the Model CustomResourceDefinition to stdout, ready for
//! `kubectl apply -f -`.

use std::io::Write;

use kube::core::CustomResourceExt;
use ollama_crm::crd::model::Model;

fn main() -> anyhow::Result<()> {
    let mut out = std::io::stdout().lock();
    serde_yaml::to_writer(&mut out, &Model::crd())?;
    out.flush()?;
    Ok(())
}
