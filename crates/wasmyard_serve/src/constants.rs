/// Annotation marking an image spec as a wasm module; also the fetch URL.
pub const WASM_MODULE_URL_ANNOTATION: &str = "wasm.module.url";

/// Annotation naming the module file on disk; required at pull time and the
/// default process argv[0].
pub const WASM_MODULE_FILENAME_ANNOTATION: &str = "wasm.module.filename";

/// Annotation selecting the signal used to stop instances of the module.
pub const WASM_MODULE_STOP_SIGNAL_ANNOTATION: &str = "wasm.module.stopSignal";

/// Signal recorded on the module when the pull annotation is absent.
pub const DEFAULT_MODULE_STOP_SIGNAL: &str = "SIGKILL";

/// Stop-time fallback when neither the instance nor its module yields a
/// signal (e.g. the module was deleted and predates the copied signal).
pub const FALLBACK_STOP_SIGNAL: &str = "SIGTERM";

/// Exit code recorded when a wasm instance fails to start.
pub const ERROR_START_EXIT_CODE: i32 = 128;

/// Exit code synthesized for instances whose real exit was never observed.
pub const UNKNOWN_EXIT_CODE: u32 = 255;

pub const ERROR_START_REASON: &str = "StartError";
pub const COMPLETE_EXIT_REASON: &str = "Completed";
pub const ERROR_EXIT_REASON: &str = "Error";

/// Label tagging workloads managed by this plane.
pub const WORKLOAD_KIND_LABEL_KEY: &str = "io.wasmyard.kind";
pub const WASM_INSTANCE_LABEL_VALUE: &str = "wasm instance";

/// Maximum message size for the CRI gRPC server. Module payloads travel over
/// HTTP, so requests stay small; this is headroom for large label maps.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024 * 16;
