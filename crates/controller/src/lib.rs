pub mod reconciler;
pub mod workspace;

pub use reconciler::{
    run_controller, KubeWorkspaceApi, ReconcileError, WorkspaceApi, WorkspaceReconciler,
};
pub use workspace::{NetworkRule, Workspace, WorkspaceSpec};
