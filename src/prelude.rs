pub use crate::client::ControlPlaneClient;
pub use crate::config::ServerConfig;
pub use crate::error::{ControlError, ControlResult, ErrorCode, RecvError, TryRecvError, WriteError};
pub use crate::pipeline::{
    ManifoldInstance, ManifoldState, PipelineDefinition, PipelineInstance, PipelineTarget,
    SegmentAddress, SegmentDef, SegmentState,
};
pub use crate::protocol::{Event, EventKind, Message};
pub use crate::server::Server;
pub use crate::transport::{ClientStream, EventDuplex, EventWriter, StreamAcceptor};
pub use crate::utils::{LiveFlag, SnapshotCell, StopToken};
