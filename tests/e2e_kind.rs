use std::error::Error;
use std::process::{Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use k8s_gpu_operator::crd::GpuCluster;
use kube::CustomResourceExt;

const OPERATOR_NAMESPACE: &str = "gpu-operator";
const OPERATOR_NAME: &str = "k8s-gpu-operator";
const CLUSTER_NAME: &str = "gpu-cluster";
const DUPLICATE_NAME: &str = "gpu-cluster-duplicate";
const DEVICE_PLUGIN_DS: &str = "xdxct-device-plugin-ds";

/// Returns true if the given binary is accessible in PATH.
fn tool_available(binary: &str) -> bool {
    Command::new(binary)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

/// End-to-end test of the GpuCluster lifecycle on a Kind cluster:
///
/// 1. Install the CRD and the operator.
/// 2. Apply a GpuCluster with only the device plugin enabled.
/// 3. Wait for the device plugin DaemonSet and its drift annotation.
/// 4. Apply a second GpuCluster and expect it to be marked `ignored`.
/// 5. Disable the device plugin and expect its DaemonSet to be deleted.
///
/// The operator image must ship the component manifests under
/// `/opt/k8s-gpu-operator`. Run with: `cargo test --test e2e_kind -- --ignored`
#[test]
#[ignore]
fn e2e_gpucluster_lifecycle() -> Result<(), Box<dyn Error>> {
    for tool in &["kind", "kubectl"] {
        if !tool_available(tool) {
            eprintln!("Skipping e2e test: `{tool}` not found in PATH.");
            return Ok(());
        }
    }

    let kind_cluster = std::env::var("KIND_CLUSTER_NAME").unwrap_or_else(|_| "gpu-e2e".into());
    ensure_kind_cluster(&kind_cluster)?;

    let image =
        std::env::var("E2E_OPERATOR_IMAGE").unwrap_or_else(|_| "k8s-gpu-operator:e2e".into());
    if env_true("E2E_BUILD_IMAGE", false) {
        run_cmd("docker", &["build", "-t", &image, "."])?;
    }
    if env_true("E2E_LOAD_IMAGE", true) {
        run_cmd(
            "kind",
            &["load", "docker-image", &image, "--name", &kind_cluster],
        )?;
    }

    let operator_yaml = operator_manifest(&image);
    let _cleanup = Cleanup::new(operator_yaml.clone());

    kubectl_apply(&serde_yaml::to_string(&GpuCluster::crd())?)?;
    run_cmd(
        "kubectl",
        &[
            "create",
            "namespace",
            OPERATOR_NAMESPACE,
            "--dry-run=client",
            "-o",
            "yaml",
        ],
    )
    .and_then(|output| kubectl_apply(&output))?;

    kubectl_apply(&operator_yaml)?;
    run_cmd(
        "kubectl",
        &[
            "rollout",
            "status",
            &format!("deployment/{OPERATOR_NAME}"),
            "-n",
            OPERATOR_NAMESPACE,
            "--timeout=180s",
        ],
    )?;

    kubectl_apply(&gpu_cluster_manifest(CLUSTER_NAME, true))?;

    wait_for("DaemonSet created", Duration::from_secs(90), || {
        let hash = run_cmd(
            "kubectl",
            &[
                "get",
                "daemonset",
                DEVICE_PLUGIN_DS,
                "-n",
                OPERATOR_NAMESPACE,
                "-o",
                r#"jsonpath={.metadata.annotations.xdxct\.com/last-applied-hash}"#,
            ],
        );
        Ok(hash.map(|h| !h.is_empty()).unwrap_or(false))
    })?;

    wait_for("GpuCluster status set", Duration::from_secs(60), || {
        Ok(gpu_cluster_state(CLUSTER_NAME)
            .map(|state| state == "ready" || state == "notReady")
            .unwrap_or(false))
    })?;

    kubectl_apply(&gpu_cluster_manifest(DUPLICATE_NAME, true))?;
    wait_for("duplicate ignored", Duration::from_secs(60), || {
        Ok(gpu_cluster_state(DUPLICATE_NAME)
            .map(|state| state == "ignored")
            .unwrap_or(false))
    })?;

    kubectl_apply(&gpu_cluster_manifest(CLUSTER_NAME, false))?;
    wait_for("DaemonSet deleted", Duration::from_secs(90), || {
        Ok(run_cmd(
            "kubectl",
            &["get", "daemonset", DEVICE_PLUGIN_DS, "-n", OPERATOR_NAMESPACE],
        )
        .is_err())
    })?;

    Ok(())
}

fn gpu_cluster_state(name: &str) -> Result<String, Box<dyn Error>> {
    run_cmd(
        "kubectl",
        &["get", "gpucluster", name, "-o", "jsonpath={.status.state}"],
    )
}

fn gpu_cluster_manifest(name: &str, device_plugin: bool) -> String {
    format!(
        r#"apiVersion: xdxct.com/v1alpha1
kind: GpuCluster
metadata:
  name: {name}
spec:
  daemonSets:
    updateStrategy: RollingUpdate
    rollingUpdate:
      maxUnavailable: "1"
  devicePlugin:
    enabled: {device_plugin}
    image: busybox:1.36
    args: ["sleep", "infinity"]
  kubevirtDevicePlugin:
    enabled: false
  vgpuDeviceManager:
    enabled: false
  vfioManager:
    enabled: false
"#
    )
}

fn operator_manifest(image: &str) -> String {
    format!(
        r#"---
apiVersion: v1
kind: ServiceAccount
metadata:
  name: {operator_name}
  namespace: {operator_namespace}
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: {operator_name}
rules:
  - apiGroups: ["xdxct.com"]
    resources: ["gpuclusters", "gpuclusters/status"]
    verbs: ["get", "list", "watch", "update", "patch"]
  - apiGroups: [""]
    resources: ["nodes", "pods"]
    verbs: ["get", "list", "watch"]
  - apiGroups: [""]
    resources: ["serviceaccounts", "configmaps"]
    verbs: ["get", "list", "watch", "create", "update", "patch", "delete"]
  - apiGroups: ["apps"]
    resources: ["daemonsets"]
    verbs: ["get", "list", "watch", "create", "update", "patch", "delete"]
  - apiGroups: ["apps"]
    resources: ["controllerrevisions"]
    verbs: ["get", "list", "watch"]
  - apiGroups: ["rbac.authorization.k8s.io"]
    resources: ["roles", "rolebindings", "clusterroles", "clusterrolebindings"]
    verbs: ["*"]
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRoleBinding
metadata:
  name: {operator_name}
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: ClusterRole
  name: {operator_name}
subjects:
  - kind: ServiceAccount
    name: {operator_name}
    namespace: {operator_namespace}
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: {operator_name}
  namespace: {operator_namespace}
spec:
  replicas: 1
  selector:
    matchLabels:
      app: {operator_name}
  template:
    metadata:
      labels:
        app: {operator_name}
    spec:
      serviceAccountName: {operator_name}
      containers:
        - name: operator
          image: {image}
          imagePullPolicy: IfNotPresent
          args: ["run"]
          env:
            - name: OPERATOR_NAMESPACE
              value: {operator_namespace}
"#,
        operator_name = OPERATOR_NAME,
        operator_namespace = OPERATOR_NAMESPACE,
        image = image
    )
}

struct Cleanup {
    operator_manifest: String,
}

impl Cleanup {
    fn new(operator_manifest: String) -> Self {
        Self { operator_manifest }
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        for name in [CLUSTER_NAME, DUPLICATE_NAME] {
            let _ = run_cmd(
                "kubectl",
                &["delete", "gpucluster", name, "--ignore-not-found=true"],
            );
        }
        let _ = run_cmd_with_stdin("kubectl", &["delete", "-f", "-"], &self.operator_manifest);
        let _ = run_cmd(
            "kubectl",
            &[
                "delete",
                "namespace",
                OPERATOR_NAMESPACE,
                "--ignore-not-found=true",
            ],
        );
    }
}

fn ensure_kind_cluster(name: &str) -> Result<(), Box<dyn Error>> {
    let clusters = run_cmd("kind", &["get", "clusters"])?;
    if clusters.lines().any(|line| line.trim() == name) {
        return Ok(());
    }
    run_cmd("kind", &["create", "cluster", "--name", name])?;
    Ok(())
}

fn kubectl_apply(manifest: &str) -> Result<(), Box<dyn Error>> {
    run_cmd_with_stdin("kubectl", &["apply", "-f", "-"], manifest)
}

fn command(program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Ok(kubeconfig) = std::env::var("KUBECONFIG") {
        cmd.env("KUBECONFIG", kubeconfig);
    }
    cmd
}

fn run_cmd(program: &str, args: &[&str]) -> Result<String, Box<dyn Error>> {
    let output = command(program, args).output()?;
    if !output.status.success() {
        return Err(format!(
            "command failed: {} {:?}\nstdout:\n{}\nstderr:\n{}",
            program,
            args,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        )
        .into());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn run_cmd_with_stdin(program: &str, args: &[&str], input: &str) -> Result<(), Box<dyn Error>> {
    let mut child = command(program, args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        use std::io::Write;
        stdin.write_all(input.as_bytes())?;
    }
    let output = child.wait_with_output()?;
    if !output.status.success() {
        return Err(format!(
            "command failed: {} {:?}\nstderr:\n{}",
            program,
            args,
            String::from_utf8_lossy(&output.stderr)
        )
        .into());
    }
    Ok(())
}

fn wait_for<F>(label: &str, timeout: Duration, mut condition: F) -> Result<(), Box<dyn Error>>
where
    F: FnMut() -> Result<bool, Box<dyn Error>>,
{
    let start = Instant::now();
    let mut attempts: u32 = 0;
    loop {
        if condition()? {
            return Ok(());
        }
        attempts += 1;
        if start.elapsed() > timeout {
            return Err(format!(
                "timeout while waiting for {} after {:?} (attempts={})",
                label, timeout, attempts
            )
            .into());
        }
        sleep(Duration::from_secs(3));
    }
}

fn env_true(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}
