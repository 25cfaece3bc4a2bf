//! Translation between controller models and KubeVirt objects
//!
//! Desired specs become a `VirtualMachine` with a DataVolume-backed root disk,
//! a multus bridge network, and optional cloud-init credentials. Observed
//! objects are reduced to an [`ObservedState`]. Snapshots of a VM become a
//! `VirtualMachineSnapshot` labelled with their source.

use crate::models::{
    ClusterPhase, NetworkIdentity, ObservedState, ResourceId, ResourceSpec, SnapshotInfo,
    SpecFingerprint,
};
use chrono::{DateTime, Utc};
use crds::labels::{
    DOMAIN_LABEL, HOSTNAME_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE, OWNER_ANNOTATION,
    SNAPSHOT_SOURCE_LABEL, SPEC_HASH_ANNOTATION,
};
use crds::{
    CloudInitNoCloud, CpuSpec, DataVolumeRef, DataVolumeSource, DataVolumeSpec, DataVolumeTemplate,
    Devices, Disk, DiskTarget, DomainSpec, HttpSource, Interface, MultusNetwork, Network,
    PersistentVolumeClaimSpec, ResourceRequirements, SnapshotSource, TemplateMetadata,
    VirtualMachine, VirtualMachineInstance, VirtualMachineInstanceSpec, VirtualMachineSnapshot,
    VirtualMachineSnapshotSpec, VirtualMachineSpec, VirtualMachineTemplate, Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

const ROOT_DISK: &str = "rootdisk";
const CLOUD_INIT_DISK: &str = "cloudinitdisk";
const NETWORK_NAME: &str = "default";
const RUN_STRATEGY: &str = "Always";

/// Printable statuses KubeVirt uses for errors
///
/// `Unknown` is absent: it only means virt-controller lost track of the VM
/// for a moment, and such a VM is treated as still provisioning.
const FAILED_STATUSES: &[&str] = &[
    "CrashLoopBackOff",
    "ErrImagePull",
    "ImagePullBackOff",
    "DataVolumeError",
];

/// Cluster-wide settings applied to every generated manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestOptions {
    /// Multus network attachment (named after the host bridge)
    pub bridge: String,
    pub storage_class: String,
    /// Pin VMs to this node when set
    pub node: Option<String>,
}

#[must_use]
pub fn root_disk_name(vm_name: &str) -> String {
    format!("{vm_name}-{ROOT_DISK}")
}

/// Build the `VirtualMachine` object for a desired spec
#[must_use]
pub fn build_virtual_machine(
    spec: &ResourceSpec,
    owner: &str,
    options: &ManifestOptions,
) -> VirtualMachine {
    let data_volume = root_disk_name(&spec.name);

    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());

    let mut annotations = BTreeMap::new();
    annotations.insert(SPEC_HASH_ANNOTATION.to_string(), spec.spec_hash());
    annotations.insert(OWNER_ANNOTATION.to_string(), owner.to_string());

    let mut disks = vec![virtio_disk(ROOT_DISK)];
    let mut volumes = vec![Volume {
        name: ROOT_DISK.to_string(),
        data_volume: Some(DataVolumeRef {
            name: data_volume.clone(),
        }),
        ..Default::default()
    }];
    if let Some(credentials) = &spec.credentials {
        disks.push(virtio_disk(CLOUD_INIT_DISK));
        volumes.push(Volume {
            name: CLOUD_INIT_DISK.to_string(),
            cloud_init_no_cloud: Some(CloudInitNoCloud {
                user_data: cloud_init_user_data(&credentials.password),
            }),
            ..Default::default()
        });
    }

    let mut node_selector = BTreeMap::new();
    if let Some(node) = &options.node {
        node_selector.insert(HOSTNAME_LABEL.to_string(), node.clone());
    }

    let vm_spec = VirtualMachineSpec {
        run_strategy: Some(RUN_STRATEGY.to_string()),
        running: None,
        template: VirtualMachineTemplate {
            metadata: Some(TemplateMetadata {
                name: None,
                labels: BTreeMap::from([(DOMAIN_LABEL.to_string(), spec.name.clone())]),
            }),
            spec: VirtualMachineInstanceSpec {
                domain: DomainSpec {
                    cpu: Some(CpuSpec {
                        cores: spec.cpu_cores,
                    }),
                    resources: Some(ResourceRequirements {
                        requests: BTreeMap::from([(
                            "memory".to_string(),
                            format!("{}Gi", spec.memory_gib),
                        )]),
                    }),
                    devices: Devices {
                        disks,
                        interfaces: vec![Interface {
                            name: NETWORK_NAME.to_string(),
                            bridge: Some(serde_json::json!({})),
                            mac_address: None,
                        }],
                    },
                },
                networks: vec![Network {
                    name: NETWORK_NAME.to_string(),
                    multus: Some(MultusNetwork {
                        network_name: options.bridge.clone(),
                    }),
                    pod: None,
                }],
                volumes,
                node_selector,
            },
        },
        data_volume_templates: vec![DataVolumeTemplate {
            metadata: TemplateMetadata {
                name: Some(data_volume),
                labels: BTreeMap::new(),
            },
            spec: DataVolumeSpec {
                source: DataVolumeSource {
                    http: Some(HttpSource {
                        url: spec.image.clone(),
                    }),
                },
                pvc: PersistentVolumeClaimSpec {
                    access_modes: vec!["ReadWriteOnce".to_string()],
                    resources: ResourceRequirements {
                        requests: BTreeMap::from([(
                            "storage".to_string(),
                            format!("{}Gi", spec.disk_gib),
                        )]),
                    },
                    storage_class_name: Some(options.storage_class.clone()),
                },
            },
        }],
    };

    VirtualMachine {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: vm_spec,
        status: None,
    }
}

fn virtio_disk(name: &str) -> Disk {
    Disk {
        name: name.to_string(),
        disk: Some(DiskTarget {
            bus: Some("virtio".to_string()),
        }),
    }
}

fn cloud_init_user_data(password: &str) -> String {
    format!("#cloud-config\npassword: {password}\nchpasswd: {{ expire: False }}\nssh_pwauth: True\n")
}

/// Reduce a `VirtualMachine` to what the reconciler compares against
#[must_use]
pub fn observe(vm: &VirtualMachine) -> ObservedState {
    let annotations = vm.metadata.annotations.as_ref();
    let printable_status = vm
        .status
        .as_ref()
        .and_then(|s| s.printable_status.clone())
        .unwrap_or_default();
    let ready = vm.status.as_ref().is_some_and(|s| s.is_ready());

    ObservedState {
        fingerprint: fingerprint_of(vm),
        phase: phase_from(&printable_status, ready),
        printable_status,
        resource_version: vm.metadata.resource_version.clone(),
        spec_hash: annotations.and_then(|a| a.get(SPEC_HASH_ANNOTATION).cloned()),
        owner: annotations.and_then(|a| a.get(OWNER_ANNOTATION).cloned()),
        uid: vm.metadata.uid.clone(),
        managed: is_managed(&vm.metadata),
    }
}

fn is_managed(metadata: &ObjectMeta) -> bool {
    metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(MANAGED_BY_LABEL))
        .is_some_and(|value| value == MANAGED_BY_VALUE)
}

fn fingerprint_of(vm: &VirtualMachine) -> Option<SpecFingerprint> {
    let domain = &vm.spec.template.spec.domain;
    let cpu_cores = domain.cpu.as_ref()?.cores;
    let memory_gib = domain
        .resources
        .as_ref()?
        .requests
        .get("memory")
        .and_then(|q| parse_gib(q))?;

    let root = vm.spec.data_volume_templates.first()?;
    let image = root.spec.source.http.as_ref()?.url.clone();
    let disk_gib = root
        .spec
        .pvc
        .resources
        .requests
        .get("storage")
        .and_then(|q| parse_gib(q))?;

    Some(SpecFingerprint {
        image,
        cpu_cores,
        memory_gib,
        disk_gib,
    })
}

/// Parse a binary quantity into whole GiB ("4Gi", "4096Mi", "1Ti")
fn parse_gib(quantity: &str) -> Option<u32> {
    let quantity = quantity.trim();
    let (digits, factor_mib) = if let Some(v) = quantity.strip_suffix("Ti") {
        (v, 1024 * 1024)
    } else if let Some(v) = quantity.strip_suffix("Gi") {
        (v, 1024)
    } else if let Some(v) = quantity.strip_suffix("Mi") {
        (v, 1)
    } else {
        return None;
    };
    let mib = digits.parse::<u64>().ok()?.checked_mul(factor_mib)?;
    if mib % 1024 != 0 {
        return None;
    }
    u32::try_from(mib / 1024).ok()
}

fn phase_from(printable_status: &str, ready: bool) -> ClusterPhase {
    if ready {
        return ClusterPhase::Ready;
    }
    if printable_status.starts_with("Error") || FAILED_STATUSES.contains(&printable_status) {
        return ClusterPhase::Failed;
    }
    match printable_status {
        "Stopped" | "Stopping" | "Terminating" => ClusterPhase::Stopped,
        "Running" | "Paused" | "Migrating" => ClusterPhase::NotReady,
        _ => ClusterPhase::Provisioning,
    }
}

/// First reported interface of a running VMI
///
/// Returns `None` until virt-handler has published an interface name. The
/// name is taken as the host-side link of the multus bridge attachment; the
/// bridge coordinator refuses it if it resolves to the uplink or the bridge.
#[must_use]
pub fn network_identity(vmi: &VirtualMachineInstance) -> Option<NetworkIdentity> {
    let iface = vmi.status.as_ref()?.interfaces.first()?;
    let interface_name = iface.interface_name.clone()?;
    Some(NetworkIdentity {
        interface_name,
        network_name: iface.name.clone(),
        mac_address: iface.mac.clone(),
        ip_address: iface.ip_address.clone(),
    })
}

/// Build a `VirtualMachineSnapshot` of `vm` named `snapshot_name`
#[must_use]
pub fn build_snapshot(vm: &ResourceId, snapshot_name: &str) -> VirtualMachineSnapshot {
    let labels = BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (SNAPSHOT_SOURCE_LABEL.to_string(), vm.name.clone()),
    ]);
    VirtualMachineSnapshot {
        metadata: ObjectMeta {
            name: Some(snapshot_name.to_string()),
            namespace: Some(vm.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: VirtualMachineSnapshotSpec {
            source: SnapshotSource::virtual_machine(&vm.name),
        },
        status: None,
    }
}

/// Snapshot names are `<vm>-snap-<6 hex>`, cut so they stay a DNS label
#[must_use]
pub fn snapshot_name(vm_name: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let prefix: String = vm_name.chars().take(52).collect();
    format!("{}-snap-{}", prefix.trim_end_matches('-'), &suffix[..6])
}

/// Reduce a `VirtualMachineSnapshot` to what callers see
#[must_use]
pub fn observe_snapshot(snapshot: &VirtualMachineSnapshot) -> SnapshotInfo {
    let status = snapshot.status.as_ref();
    let created_at = status
        .and_then(|s| s.creation_time.as_deref())
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .or_else(|| snapshot.metadata.creation_timestamp.as_ref().map(|t| t.0));
    SnapshotInfo {
        name: snapshot.metadata.name.clone().unwrap_or_default(),
        namespace: snapshot.metadata.namespace.clone().unwrap_or_default(),
        source: snapshot.spec.source.name.clone(),
        phase: status.and_then(|s| s.phase.clone()),
        ready_to_use: status.and_then(|s| s.ready_to_use).unwrap_or(false),
        created_at,
        error: status
            .and_then(|s| s.error.as_ref())
            .and_then(|e| e.message.clone()),
    }
}
