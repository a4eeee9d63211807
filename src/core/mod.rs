pub mod affinity;
pub mod cluster;
pub mod context;
pub mod destination;
pub mod forwarder;
pub mod picker;
pub mod pipeline;
pub mod protocol;
pub mod route;
pub mod transforms;

pub use cluster::{ClusterDestinationsState, ClusterModel, ClusterState, Destinations};
pub use context::{ClientConnection, ProxyContext};
pub use destination::{DestinationHealth, DestinationModel, DestinationState};
pub use forwarder::{ForwarderError, ForwarderRequestSettings, HttpForwarder};
pub use picker::{DestinationPicker, RandomPicker};
pub use pipeline::{ProxyError, ProxyOutcome, ProxyPipeline};
pub use route::RouteModel;
