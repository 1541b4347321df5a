//! Kernels: protocol types, specs, spec resolution, and connections.

mod connection;
mod gateway;
mod messages;
mod resolver;
mod sources;
mod spec;

pub use connection::{ExecuteHandle, KernelConnection, KernelConnector};
pub use gateway::{GatewayConnector, GatewayKernel};
pub use messages::{
    ExecuteReply, ExecuteRequest, ExecutionState, Header, IoPubMessage, MimeBundle,
    PROTOCOL_VERSION, ReplyStatus, WireMessage,
};
pub use resolver::{
    DEFAULT_LANGUAGE, IpykernelInstaller, KernelCriteria, KernelInstaller, KernelSpecResolver,
    best_match, rewrite_installed_spec, score,
};
pub use sources::{
    CliKernelSource, DirectoryKernelSource, KernelSpecSource, RemoteKernelSource,
    default_kernel_dirs,
};
pub use spec::{InterpreterInfo, KernelSpec, KernelSpecCache, KernelSpecFile, KernelSpecMetadata, Version};
