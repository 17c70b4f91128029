//! Static mapping from inbound message ids to dispatch paths.

use proto::msg_id;

const STANDARD_ROUTES: &[(u32, &str)] = &[
    (msg_id::NODE_HEARTBEAT_RESP, "/heartbeat"),
    (msg_id::TEST_STEP_UPDATE_RESP, "/testStepUpdate"),
    (msg_id::WORKER_HEARTBEAT_RESP, "/worker/heartbeat"),
];

/// Route table fixed at process start.
///
/// Handlers can only be bound to ids already present here.
#[derive(Debug, Clone, Copy)]
pub struct RouteTable {
    entries: &'static [(u32, &'static str)],
}

impl RouteTable {
    /// The routes for heartbeat and test-step traffic.
    pub const fn standard() -> Self {
        Self {
            entries: STANDARD_ROUTES,
        }
    }

    /// Builds a table from a static list of `(msg_id, path)` entries.
    pub const fn from_entries(entries: &'static [(u32, &'static str)]) -> Self {
        Self { entries }
    }

    /// Resolves a message id to its dispatch path.
    pub fn resolve(&self, msg_id: u32) -> Option<&'static str> {
        self.entries
            .iter()
            .find(|(id, _)| *id == msg_id)
            .map(|(_, path)| *path)
    }

    pub fn contains(&self, msg_id: u32) -> bool {
        self.resolve(msg_id).is_some()
    }

    /// Iterates over `(msg_id, path)` entries.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &'static str)> + '_ {
        self.entries.iter().copied()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::standard()
    }
}
