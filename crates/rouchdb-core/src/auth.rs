//! Credential refresh for a remote peer.
//!
//! Modeled on TouchDB's `TDAuthorizer` protocol: `TDPersonaAuthorizer`
//! holds a registered assertion and is asked for a fresh one when the
//! server rejects the current header. `rouchdb-adapter-http` consults an
//! `Authorizer` for the header to present on each request; the change
//! tracker and replicator consult the same object to refresh credentials
//! once after a 401 before giving up.

/// Supplies and refreshes the credential presented to a remote peer.
pub trait Authorizer: Send + Sync {
    /// The `Authorization` header value to present on the next request,
    /// if any.
    fn header(&self) -> Option<String>;

    /// Called once after a 401. Returns `true` if new credentials were
    /// obtained and the request is worth retrying, `false` if refreshing
    /// isn't possible — a second consecutive 401 is then fatal.
    fn refresh(&self) -> bool;
}
