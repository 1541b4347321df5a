//! Core engine for Mercury, a Jupyter kernel session and execution engine.
//!
//! This crate provides:
//! - Connection info for Jupyter servers and a REST/WebSocket kernel client
//! - Kernel spec discovery, matching, and installation
//! - Session lifecycle (launch, connect, restart, interrupt, shutdown)
//! - Cell execution as lazy streams of cell snapshots
//! - The `Server` trait shared by local and collaborative sessions

pub mod cancel;
pub mod clock;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod execute;
pub mod kernel;
pub mod server;
pub mod session;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cancel::CancelToken;
pub use clock::{SessionClock, now_millis};
pub use command::JupyterCommand;
pub use config::MercuryConfig;
pub use connection::{ConnectionInfo, LaunchInfo};
pub use error::{Error, Result};
pub use execute::{Cell, CellData, CellOutput, CellState, CellStream, CellType, ExecutionEngine};
pub use kernel::{
    GatewayConnector, InterpreterInfo, KernelConnection, KernelConnector, KernelCriteria,
    KernelSpec, KernelSpecResolver, Version,
};
pub use server::{ExecutionRequest, LocalServer, Role, Server};
pub use session::{InterruptResult, JupyterLauncher, KernelStatus, SessionManager, SessionState};
