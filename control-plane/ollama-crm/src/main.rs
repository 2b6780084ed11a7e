use envconfig::Envconfig;
use kube::Client;
use ollama_crm::{config::CrmConfig, init_tracing, runtime};
use tracing::{error, info};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");
    install_crypto_provider();

    let cfg = CrmConfig::init_from_env()?;
    info!(
        image = %cfg.server_image(),
        namespace = ?cfg.k8s_namespace,
        backoff = ?cfg.backoff,
        concurrency = cfg.concurrency,
        "ollama CRM starting"
    );

    let client = Client::try_default().await?;
    let res = runtime::run_all(client, cfg).await;
    if let Err(e) = &res {
        error!(error = %e, "ollama CRM stopped with error");
    }
    res
}

// kube's rustls stack needs a process-wide provider
fn install_crypto_provider() {
    if rustls::crypto::CryptoProvider::get_default().is_none() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }
}
