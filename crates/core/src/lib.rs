// courier: transport session for a messaging client
//
// Admits HTTP work under a concurrency budget, renews the access credential
// single-flight, keeps a push channel open across reachability changes, and
// wakes sibling sessions when new work may be available.

pub mod background;
pub mod backoff;
pub mod bus;
pub mod config;
pub mod credential;
pub mod error;
mod events;
pub mod loop_detection;
pub mod push_channel;
pub mod reachability;
pub mod request;
pub mod scheduler;
pub mod session;
pub mod testing;
pub mod transport;

pub use background::BackgroundCompletions;
pub use backoff::Backoff;
pub use bus::{BusMembership, SessionBus};
pub use config::{BackoffConfig, DEFAULT_MAX_CONCURRENT, LoopDetectionConfig, SessionConfig};
pub use courier_protocol as protocol;
pub use credential::{CredentialEvent, CredentialHandler, CredentialRenewer, CredentialStore, EnsureValid, MemoryCredentialStore};
pub use error::{Error, Result};
pub use push_channel::{CloseCause, PushChannel, PushChannelConsumer};
pub use reachability::ReachabilityObserver;
pub use request::{Completion, HttpRequest, RequestGenerator, RequestId, WorkItem};
pub use scheduler::{Admission, GeneratorId};
pub use session::{NetworkStateDelegate, Session, SessionBuilder};
pub use transport::{PushReceiver, PushSender, PushTransport, PushTransportParts, Transport, TransportOutcome};
