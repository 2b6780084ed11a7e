// Integration tests require a running Kubernetes cluster with the Model CRD
// applied (`cargo run --bin crdgen | kubectl apply -f -`). Ignored by default.

use envconfig::Envconfig;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    Client,
    api::{Api, PostParams},
};
use ollama_crm::config::CrmConfig;
use ollama_crm::crd::model::{Model, ModelSpec};
use tokio_util::sync::CancellationToken;

mod common;
use common::{ControllerGuard, set_env, uniq, wait_for_model_pod};

#[test_log::test(tokio::test)]
#[ignore]
async fn controller_provisions_server_pod() {
    let _g1 = set_env("OLLAMA_CONTAINER_IMAGE", "ollama/ollama:latest");
    let client = Client::try_default().await.expect("kube client");
    let ns = "default";
    let name = uniq("ollama-it");
    let guard = ControllerGuard::new(ns, &name, client.clone());

    let api: Api<Model> = Api::namespaced(client.clone(), ns);
    let model = Model::new(
        &name,
        ModelSpec {
            images: vec!["tinyllama".into()],
            ..Default::default()
        },
    );
    api.create(&PostParams::default(), &model)
        .await
        .expect("create Model");

    let cfg = CrmConfig::init_from_env().expect("config");
    let client_for_ctrl = client.clone();
    let ctrl = tokio::spawn(async move {
        let _ = ollama_crm::controller::run_controller(
            client_for_ctrl,
            cfg,
            CancellationToken::new(),
        )
        .await;
    });
    let _guard = guard.with_controller(ctrl);

    let pod_name = wait_for_model_pod(ns, &name, client.clone())
        .await
        .expect("status.podRef set in time");
    let pods: Api<Pod> = Api::namespaced(client, ns);
    let pod = pods.get(&pod_name).await.expect("server pod exists");
    assert!(pod_name.starts_with(&format!("{name}-")));
    assert_eq!(
        pod.metadata.owner_references.unwrap_or_default()[0].name,
        name
    );
}
