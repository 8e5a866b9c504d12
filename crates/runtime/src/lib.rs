//! Network collaborators that plug a [`courier::Session`] into real servers.
//!
//! * [`HttpTransport`] sends requests with `reqwest`.
//! * [`WebSocketPushTransport`] opens the push channel with `tokio-tungstenite`.
//! * [`FileCredentialStore`] keeps the last good credential on disk.
//! * [`CookieRenewer`] trades a login cookie for an access credential.
//! * [`TcpProbe`] feeds a [`courier::ReachabilityObserver`].

pub mod http;
pub mod probe;
pub mod renew;
pub mod store;
pub mod websocket;

pub use http::HttpTransport;
pub use probe::TcpProbe;
pub use renew::CookieRenewer;
pub use store::FileCredentialStore;
pub use websocket::WebSocketPushTransport;
