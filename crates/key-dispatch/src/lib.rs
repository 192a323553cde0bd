pub mod clock;
pub mod codec;
pub mod counted_tree;
pub mod discovery;
pub mod dispatcher;
pub mod estimator;
pub mod idgen;
pub mod server_table;
pub mod worker;

pub use codec::{Fingerprint, Op, Padding, RequestFrame, MAX_DATAGRAM};
pub use counted_tree::CountedTree;
pub use discovery::DiscoveryClient;
pub use dispatcher::{DispatchError, Dispatcher};
pub use estimator::SpeedEstimator;
pub use idgen::IdGen;
pub use server_table::{Backend, ServerTable};
pub use worker::{Accel, KeyStore, MirrorAccel, Worker, WorkerConfig};
