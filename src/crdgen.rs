use kaas_operator::api::{cluster::Cluster, sandbox_config::SandboxConfig};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&Cluster::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&SandboxConfig::crd())?);
    Ok(())
}
