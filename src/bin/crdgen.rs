use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!(
        "{}",
        serde_yaml::to_string(&cloudsap::resources::cloudserviceaccounts::CloudServiceAccount::crd())?
    );
    Ok(())
}
