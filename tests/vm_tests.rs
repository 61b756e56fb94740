//! Integration tests for VM provisioning through the public API
//!
//! Everything here runs on the local backend against a temporary root.
//! Docker scenarios need a daemon and the runner image and are marked #[ignore].

use notebook_sandbox::vm::{
    vm_id_for, BackendChoice, NetOutbound, VirtualMachine, VirtualMachineState, VmBackendKind, VmConfig,
    VmManager, VmSpecOverrides,
};
use notebook_sandbox::SandboxError;

fn local_config(root: &std::path::Path) -> VmConfig {
    VmConfig {
        backend: BackendChoice::Local,
        root_dir: root.to_path_buf(),
        ..VmConfig::default()
    }
}

#[test]
fn test_vm_id_derivation() {
    assert_eq!(vm_id_for("notebook:17").unwrap(), "runner-notebook_17");
    assert_eq!(vm_id_for("A b/c").unwrap(), "runner-A_b_c");
    assert!(matches!(vm_id_for(""), Err(SandboxError::PreconditionViolation(_))));
}

#[tokio::test]
async fn test_ensure_creates_workspace_and_metadata() {
    let root = tempfile::tempdir().unwrap();
    let manager = VmManager::new(local_config(root.path())).unwrap();

    let vm = manager.ensure_session_vm("notebook:1", None).await.unwrap();
    assert_eq!(vm.vm_id, "runner-notebook_1");
    assert_eq!(vm.backend, VmBackendKind::Local);
    assert_eq!(vm.state, VirtualMachineState::Running);
    assert_eq!(vm.workspace_path, root.path().join("runner-notebook_1").join("workspace"));
    assert!(vm.workspace_path.is_dir());

    let metadata = root.path().join("runner-notebook_1").join("metadata.json");
    let stored = VirtualMachine::from_json(&std::fs::read_to_string(&metadata).unwrap()).unwrap();
    assert_eq!(stored, vm);
}

#[tokio::test]
async fn test_ensure_is_idempotent() {
    let root = tempfile::tempdir().unwrap();
    let manager = VmManager::new(local_config(root.path())).unwrap();

    let first = manager.ensure_session_vm("notebook:2", None).await.unwrap();
    std::fs::write(first.workspace_path.join("keep.txt"), "x").unwrap();
    let second = manager.ensure_session_vm("notebook:2", None).await.unwrap();

    assert_eq!(first, second);
    assert!(second.workspace_path.join("keep.txt").exists());
}

#[tokio::test]
async fn test_overrides_reach_metadata() {
    let root = tempfile::tempdir().unwrap();
    let manager = VmManager::new(local_config(root.path())).unwrap();
    let overrides = VmSpecOverrides {
        cpu: Some(1),
        net_outbound: Some(NetOutbound::Allow),
        net_allowlist: Some(vec!["pypi.org".to_string()]),
        ..VmSpecOverrides::default()
    };

    let vm = manager.ensure_session_vm("notebook:3", Some(&overrides)).await.unwrap();
    assert_eq!(vm.spec.resources.cpu, 1);
    assert_eq!(vm.spec.network.outbound, NetOutbound::Allow);

    let shown = manager.get_session_vm("notebook:3").await.unwrap();
    assert_eq!(shown.spec, vm.spec);
}

#[tokio::test]
async fn test_create_then_destroy_leaves_nothing() {
    let root = tempfile::tempdir().unwrap();
    let manager = VmManager::new(local_config(root.path())).unwrap();

    manager.ensure_session_vm("notebook:4", None).await.unwrap();
    assert!(manager.destroy_session_vm("notebook:4").await.unwrap());

    assert!(!root.path().join("runner-notebook_4").exists());
    assert!(manager.get_session_vm("notebook:4").await.unwrap_err().is_not_found());
    assert!(!manager.destroy_session_vm("notebook:4").await.unwrap());
}

#[tokio::test]
async fn test_directory_without_metadata_is_not_a_vm() {
    let root = tempfile::tempdir().unwrap();
    let manager = VmManager::new(local_config(root.path())).unwrap();
    std::fs::create_dir_all(root.path().join("runner-notebook_5").join("workspace")).unwrap();

    assert!(manager.get_session_vm("notebook:5").await.unwrap_err().is_not_found());
    let vm = manager.ensure_session_vm("notebook:5", None).await.unwrap();
    assert!(vm.workspace_path.is_dir());
}

#[tokio::test]
#[ignore = "requires docker and the runner-vm image"]
async fn test_docker_backend_roundtrip() {
    let root = tempfile::tempdir().unwrap();
    let config = VmConfig {
        backend: BackendChoice::Docker,
        root_dir: root.path().to_path_buf(),
        ..VmConfig::default()
    };
    let manager = VmManager::new(config).unwrap();

    let vm = manager.ensure_session_vm("notebook:99", None).await.unwrap();
    assert_eq!(vm.backend, VmBackendKind::Docker);
    assert!(vm.backend_str("container_name").is_some());
    assert!(manager.destroy_session_vm("notebook:99").await.unwrap());
    assert!(!root.path().join("runner-notebook_99").exists());
}
