/// Observable state of the connection owned by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none will be made (initial, or terminal after
    /// shutdown / exhausted retries).
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    Connected,
    /// Connection lost; reconnect attempts running.
    Recovering,
}

/// Lifecycle events broadcast by a session so publishers and consumer
/// pools can recreate their channels after recovery.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    /// The connection dropped unexpectedly; recovery starts next.
    Disconnected,
    /// A reconnect attempt is about to run.
    Recovering { attempt: u32 },
    /// The connection is back. Channels from earlier epochs are invalid.
    Recovered { epoch: u64 },
    /// The session is permanently down: clean shutdown, or retries
    /// exhausted.
    Closed { reason: String },
}
