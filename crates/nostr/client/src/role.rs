//! Server roles and the exhaustive per-role table.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which backend server a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    /// Caching/query server
    Caching,
    /// Upload server
    Upload,
    /// Wallet server
    Wallet,
}

impl ServerRole {
    /// Every role, in table order.
    pub const ALL: [ServerRole; 3] = [ServerRole::Caching, ServerRole::Upload, ServerRole::Wallet];

    pub(crate) fn index(self) -> usize {
        match self {
            ServerRole::Caching => 0,
            ServerRole::Upload => 1,
            ServerRole::Wallet => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServerRole::Caching => "caching",
            ServerRole::Upload => "upload",
            ServerRole::Wallet => "wallet",
        }
    }
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One value per [`ServerRole`].
///
/// Built from a total function over roles, so lookups can never miss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleMap<T> {
    slots: [T; 3],
}

impl<T> RoleMap<T> {
    /// Build the table by calling `f` once per role.
    pub fn from_fn(mut f: impl FnMut(ServerRole) -> T) -> Self {
        Self {
            slots: ServerRole::ALL.map(&mut f),
        }
    }

    /// Fallible variant of [`RoleMap::from_fn`].
    pub fn try_from_fn<E>(mut f: impl FnMut(ServerRole) -> Result<T, E>) -> Result<Self, E> {
        let [caching, upload, wallet] = ServerRole::ALL;
        Ok(Self {
            slots: [f(caching)?, f(upload)?, f(wallet)?],
        })
    }

    pub fn get(&self, role: ServerRole) -> &T {
        &self.slots[role.index()]
    }

    pub fn get_mut(&mut self, role: ServerRole) -> &mut T {
        &mut self.slots[role.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (ServerRole, &T)> {
        ServerRole::ALL.into_iter().zip(self.slots.iter())
    }
}

impl<T> std::ops::Index<ServerRole> for RoleMap<T> {
    type Output = T;

    fn index(&self, role: ServerRole) -> &T {
        self.get(role)
    }
}
