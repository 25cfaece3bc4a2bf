//! Well-known labels and annotations placed on managed objects.

/// Label marking objects created by this controller
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY_VALUE: &str = "vm-controller";

/// Annotation carrying the subject that requested the VM (subjects are not label-safe)
pub const OWNER_ANNOTATION: &str = "vm-controller.io/owner";

/// Annotation carrying the SHA-256 of the desired spec fingerprint.
///
/// Stored as an annotation because label values are limited to 63 characters.
pub const SPEC_HASH_ANNOTATION: &str = "vm-controller.io/spec-hash";

/// Label KubeVirt uses to tie a VMI back to its domain name
pub const DOMAIN_LABEL: &str = "kubevirt.io/domain";

/// Node label used for pinning VMs to the bridge host
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Label on snapshots naming the VM they were taken from
pub const SNAPSHOT_SOURCE_LABEL: &str = "vm-controller.io/source-vm";
