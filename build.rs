//! Generates the tonic service stubs for the hand-written prost messages in
//! `src/proto.rs`. Using the manual builder keeps `protoc` out of the build.

use tonic_build::manual::{Builder, Method, Service};

fn method(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(format!("crate::proto::{}", input))
        .output_type(format!("crate::proto::{}", output))
        .codec_path("tonic::codec::ProstCodec")
        .build()
}

fn main() {
    let internal = Service::builder()
        .name("CoordinatorInternal")
        .package("minictl")
        .method(method("step", "Step", "RaftMessage", "StepAck"))
        .build();

    let control_plane = Service::builder()
        .name("ControlPlane")
        .package("minictl")
        .method(method(
            "register_worker",
            "RegisterWorker",
            "RegisterWorkerRequest",
            "RegisterWorkerResponse",
        ))
        .method(method(
            "register_launcher",
            "RegisterLauncher",
            "RegisterLauncherRequest",
            "Ack",
        ))
        .method(method(
            "create_namespace",
            "CreateNamespace",
            "CreateNamespaceRequest",
            "CreateNamespaceResponse",
        ))
        .method(method(
            "assign_placement",
            "AssignPlacement",
            "AssignPlacementRequest",
            "AssignPlacementResponse",
        ))
        .method(method("heartbeat", "Heartbeat", "HeartbeatRequest", "Ack"))
        .method(method(
            "launcher_heartbeat",
            "LauncherHeartbeat",
            "LauncherHeartbeatRequest",
            "Ack",
        ))
        .method(method(
            "get_namespace",
            "GetNamespace",
            "GetNamespaceRequest",
            "NamespaceInfo",
        ))
        .method(method(
            "list_namespaces",
            "ListNamespaces",
            "ListNamespacesRequest",
            "ListNamespacesResponse",
        ))
        .method(method(
            "get_cluster_status",
            "GetClusterStatus",
            "GetClusterStatusRequest",
            "ClusterStatus",
        ))
        .build();

    Builder::new().compile(&[internal, control_plane]);
}
