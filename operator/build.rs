use kube::CustomResourceExt;
use manor_types::*;
use std::fs;

fn main() {
    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/manor.codelogia.com_apps.yaml",
        serde_yaml::to_string(&App::crd()).unwrap(),
    )
    .unwrap();
    fs::write(
        "../crds/manor.codelogia.com_artifacts.yaml",
        serde_yaml::to_string(&Artifact::crd()).unwrap(),
    )
    .unwrap();
}
