use k8s_gpu_operator::crd::GpuCluster;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&GpuCluster::crd())?);
    Ok(())
}
